//! Flujo subir → analizar → persistir → borrar.
//!
//! Cada operación es secuencial. La persistencia remota es opcional y
//! estrictamente aditiva: si falla, el usuario recibe igualmente su análisis.
//! Lo que se llegue a crear en el almacén remoto se borra en cuanto termina
//! el análisis.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    analysis_api::AnalysisApi,
    error::{AppError, ErrorKind, StoreError, TransportError},
    models::{AnalysisResult, NewAnalysis, NewDocument, SelectedFile},
    remote_store::RemoteStore,
};

const TEXT_DOCUMENT_NAME: &str = "texto_pegado.txt";

/// Límites de entrada aplicados antes de cualquier llamada de red.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_file_size_bytes: u64,
    pub max_text_chars: usize,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 10 * 1024 * 1024,
            max_text_chars: 3000,
            allowed_extensions: vec!["pdf".into(), "docx".into(), "doc".into(), "txt".into()],
        }
    }
}

impl UploadLimits {
    pub fn validate_file(&self, file: &SelectedFile) -> Result<(), AppError> {
        if file.name.trim().is_empty() {
            return Err(AppError::Validation("No se ha seleccionado ningún fichero.".into()));
        }
        if file.size() > self.max_file_size_bytes {
            return Err(AppError::Validation(format!(
                "El fichero ocupa {} bytes; el máximo permitido es {} bytes.",
                file.size(),
                self.max_file_size_bytes
            )));
        }
        let ext = file.extension().unwrap_or_default();
        if !self.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            return Err(AppError::Validation(format!(
                "Tipo de fichero .{ext} no permitido. Usa: {}",
                self.allowed_extensions.join(", ")
            )));
        }
        Ok(())
    }

    /// Valida y recorta el texto al máximo de caracteres permitido.
    pub fn prepare_text(&self, text: &str) -> Result<String, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::Validation("El texto a analizar está vacío.".into()));
        }
        Ok(text.chars().take(self.max_text_chars).collect())
    }
}

/// Estado efímero de una acción del usuario.
#[derive(Debug)]
struct UploadSession {
    id: Uuid,
    document_id: Option<String>,
    storage_path: Option<String>,
    analysis_id: Option<String>,
}

impl UploadSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: None,
            storage_path: None,
            analysis_id: None,
        }
    }

    fn has_remote_artifacts(&self) -> bool {
        self.document_id.is_some() || self.storage_path.is_some() || self.analysis_id.is_some()
    }

    fn clear_remote(&mut self) {
        self.document_id = None;
        self.storage_path = None;
        self.analysis_id = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    UploadObject,
    InsertDocument,
    Analyze,
    InsertAnalysis,
    ConfirmCommit,
    DeleteObject,
    DeleteAnalysis,
    DeleteDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Skipped,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    #[serde(flatten)]
    pub status: StepStatus,
}

/// Resultado de cada borrado; `None` si no había nada que borrar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupResults {
    pub storage_object: Option<bool>,
    pub analysis_row: Option<bool>,
    pub document_row: Option<bool>,
}

/// Informe ordenado de los pasos de una operación.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeReport {
    pub steps: Vec<StepRecord>,
}

impl OutcomeReport {
    fn record(&mut self, step: Step, status: StepStatus) {
        self.steps.push(StepRecord { step, status });
    }

    fn ok(&mut self, step: Step) {
        self.record(step, StepStatus::Ok);
    }

    fn skip(&mut self, step: Step) {
        self.record(step, StepStatus::Skipped);
    }

    fn fail(&mut self, step: Step, err: &AppError) {
        self.record(
            step,
            StepStatus::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        );
    }

    pub fn status_of(&self, step: Step) -> Option<&StepStatus> {
        self.steps.iter().rev().find(|r| r.step == step).map(|r| &r.status)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|r| match &r.status {
                StepStatus::Failed { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cleanup(&self) -> CleanupResults {
        let outcome = |step| match self.status_of(step) {
            Some(StepStatus::Ok) => Some(true),
            Some(StepStatus::Failed { .. }) => Some(false),
            _ => None,
        };
        CleanupResults {
            storage_object: outcome(Step::DeleteObject),
            analysis_row: outcome(Step::DeleteAnalysis),
            document_row: outcome(Step::DeleteDocument),
        }
    }
}

/// Lo que recibe el llamante tras un análisis correcto.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub report: OutcomeReport,
    pub warnings: Vec<String>,
    pub cleanup: CleanupResults,
}

impl AnalysisOutcome {
    fn new(result: AnalysisResult, report: OutcomeReport) -> Self {
        Self {
            result,
            warnings: report.warnings(),
            cleanup: report.cleanup(),
            report,
        }
    }
}

/// Contexto explícito de análisis, construido una vez al arrancar.
#[derive(Clone)]
pub struct AnalysisWorkflow {
    api: Arc<dyn AnalysisApi>,
    store: Option<Arc<dyn RemoteStore>>,
    limits: UploadLimits,
    settle_delay: Duration,
}

impl AnalysisWorkflow {
    pub fn new(
        api: Arc<dyn AnalysisApi>,
        store: Option<Arc<dyn RemoteStore>>,
        limits: UploadLimits,
        settle_delay: Duration,
    ) -> Self {
        Self {
            api,
            store,
            limits,
            settle_delay,
        }
    }

    pub fn api(&self) -> &Arc<dyn AnalysisApi> {
        &self.api
    }

    pub fn store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.store.as_ref()
    }

    /// Analiza un fichero.
    ///
    /// La operación corre en su propia tarea: si el llamante se abandona a
    /// mitad, la limpieza del almacén remoto se completa igualmente.
    pub async fn analyze_file(&self, file: SelectedFile) -> Result<AnalysisOutcome, AppError> {
        self.limits.validate_file(&file)?;

        let this = self.clone();
        let session = UploadSession::new();
        let span = info_span!("analyze_file", session = %session.id, file = %file.name);
        detached(async move { this.run_file(file, session).await }.instrument(span)).await
    }

    /// Analiza texto pegado por el usuario.
    pub async fn analyze_text(&self, text: &str) -> Result<AnalysisOutcome, AppError> {
        let text = self.limits.prepare_text(text)?;

        let this = self.clone();
        let session = UploadSession::new();
        let span = info_span!("analyze_text", session = %session.id, chars = text.chars().count());
        detached(async move { this.run_text(text, session).await }.instrument(span)).await
    }

    async fn run_file(&self, file: SelectedFile, mut session: UploadSession) -> Result<AnalysisOutcome, AppError> {
        let mut report = OutcomeReport::default();

        match &self.store {
            Some(store) => self.persist_file(store.as_ref(), &file, &mut session, &mut report).await,
            None => {
                report.skip(Step::UploadObject);
                report.skip(Step::InsertDocument);
            }
        }

        let analyzed = self.api.analyze_file(&file).await;
        self.finish(analyzed, None, &mut session, report).await
    }

    async fn run_text(&self, text: String, mut session: UploadSession) -> Result<AnalysisOutcome, AppError> {
        let mut report = OutcomeReport::default();
        report.skip(Step::UploadObject);

        match &self.store {
            Some(store) => {
                let doc = NewDocument {
                    file_name: TEXT_DOCUMENT_NAME.to_string(),
                    file_size: text.len() as u64,
                    mime_type: "text/plain".to_string(),
                    storage_path: None,
                    text_content: Some(text.clone()),
                };
                match store.insert_document(&doc).await {
                    Ok(row) => {
                        session.document_id = Some(row.id);
                        report.ok(Step::InsertDocument);
                    }
                    Err(e) => {
                        warn!("No se pudo guardar el texto en el almacén remoto: {e}");
                        report.fail(Step::InsertDocument, &AppError::Persistence(e));
                    }
                }
            }
            None => report.skip(Step::InsertDocument),
        }

        let analyzed = self.api.analyze_text(&text).await;
        let text_length = Some(text.chars().count() as u64);
        self.finish(analyzed, text_length, &mut session, report).await
    }

    /// Paso 1 para ficheros: objeto en storage + fila `documents`.
    async fn persist_file(
        &self,
        store: &dyn RemoteStore,
        file: &SelectedFile,
        session: &mut UploadSession,
        report: &mut OutcomeReport,
    ) {
        let path = storage_path_for(&file.name, Utc::now().timestamp_millis());
        if let Err(e) = store
            .upload_object(&path, file.bytes.clone(), &file.mime_type)
            .await
        {
            warn!("Subida a storage fallida, se continúa sin persistencia: {e}");
            report.fail(Step::UploadObject, &AppError::Persistence(e));
            report.skip(Step::InsertDocument);
            return;
        }
        session.storage_path = Some(path.clone());
        report.ok(Step::UploadObject);

        let doc = NewDocument {
            file_name: file.name.clone(),
            file_size: file.size(),
            mime_type: file.mime_type.clone(),
            storage_path: Some(path),
            text_content: None,
        };
        match store.insert_document(&doc).await {
            Ok(row) => {
                session.document_id = Some(row.id);
                report.ok(Step::InsertDocument);
            }
            Err(e) => {
                warn!("No se pudo registrar el documento; se retira el objeto subido: {e}");
                report.fail(Step::InsertDocument, &AppError::Persistence(e));
                self.cleanup(store, session, report).await;
            }
        }
    }

    /// Pasos 2 y 3: resultado de la API, fila `analyses` y limpieza.
    async fn finish(
        &self,
        analyzed: Result<AnalysisResult, TransportError>,
        text_length: Option<u64>,
        session: &mut UploadSession,
        mut report: OutcomeReport,
    ) -> Result<AnalysisOutcome, AppError> {
        let mut result = match analyzed {
            Ok(result) => {
                report.ok(Step::Analyze);
                result
            }
            Err(e) => {
                error!("Fallo en la API de análisis: {e}");
                if let Some(store) = &self.store {
                    if session.has_remote_artifacts() {
                        self.cleanup(store.as_ref(), session, &mut report).await;
                    }
                }
                session.clear_remote();
                return Err(AppError::Transport(e));
            }
        };

        match (&self.store, session.document_id.clone()) {
            (Some(store), Some(document_id)) => {
                result.db_file_id = Some(document_id.clone());
                let analysis = NewAnalysis {
                    document_id,
                    analysis_text: result.analysis.clone().unwrap_or_default(),
                    text_length: result.text_length.or(text_length),
                };
                match store.insert_analysis(&analysis).await {
                    Ok(row) => {
                        report.ok(Step::InsertAnalysis);
                        self.await_commit(store.as_ref(), &row.id, &mut report).await;
                        session.analysis_id = Some(row.id);
                        self.cleanup(store.as_ref(), session, &mut report).await;
                    }
                    Err(e) => {
                        warn!(
                            "No se pudo guardar el análisis; no se realiza la limpieza (documento {:?}, objeto {:?}): {e}",
                            session.document_id, session.storage_path
                        );
                        report.fail(Step::InsertAnalysis, &AppError::Persistence(e));
                    }
                }
            }
            _ => report.skip(Step::InsertAnalysis),
        }

        result.strip_remote_ids();
        session.clear_remote();
        info!("Análisis completado");
        Ok(AnalysisOutcome::new(result, report))
    }

    /// Lee de vuelta la fila recién insertada; si aún no es visible se aplica
    /// la espera fija configurada.
    async fn await_commit(&self, store: &dyn RemoteStore, analysis_id: &str, report: &mut OutcomeReport) {
        let err = match store.get_analysis(analysis_id).await {
            Ok(Some(_)) => {
                report.ok(Step::ConfirmCommit);
                return;
            }
            Ok(None) => StoreError::NotVisible(analysis_id.to_string()),
            Err(e) => e,
        };
        warn!(
            "Escritura no confirmada ({err}); esperando {} ms antes de limpiar",
            self.settle_delay.as_millis()
        );
        report.fail(Step::ConfirmCommit, &AppError::Persistence(err));
        tokio::time::sleep(self.settle_delay).await;
    }

    /// Borra, en orden, objeto de storage, fila `analyses` y fila `documents`.
    /// Cada borrado es independiente de los demás.
    async fn cleanup(&self, store: &dyn RemoteStore, session: &mut UploadSession, report: &mut OutcomeReport) {
        if let Some(path) = session.storage_path.take() {
            let outcome = store.remove_object(&path).await;
            record_cleanup(report, Step::DeleteObject, &path, outcome);
        }
        if let Some(id) = session.analysis_id.take() {
            let outcome = store.delete_analysis(&id).await;
            record_cleanup(report, Step::DeleteAnalysis, &id, outcome);
        }
        if let Some(id) = session.document_id.take() {
            let outcome = store.delete_document(&id).await;
            record_cleanup(report, Step::DeleteDocument, &id, outcome);
        }
    }
}

/// Ejecuta la operación en una tarea aparte y espera su resultado.
async fn detached<F>(operation: F) -> Result<AnalysisOutcome, AppError>
where
    F: Future<Output = Result<AnalysisOutcome, AppError>> + Send + 'static,
{
    tokio::spawn(operation).await.map_err(|e| {
        error!("La tarea de análisis terminó de forma anómala: {e}");
        AppError::Transport(TransportError::Interrupted(e.to_string()))
    })?
}

fn record_cleanup(report: &mut OutcomeReport, step: Step, target: &str, outcome: Result<(), StoreError>) {
    match outcome {
        Ok(()) => report.ok(step),
        Err(e) => {
            warn!("Limpieza incompleta de {target}: {e}");
            report.fail(step, &AppError::Cleanup(e));
        }
    }
}

/// Ruta en storage: `<millis>_<nombre saneado>.<ext>`.
pub fn storage_path_for(file_name: &str, timestamp_millis: i64) -> String {
    let path = std::path::Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let sanitized = if sanitized.is_empty() { "fichero".to_string() } else { sanitized };

    match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) => format!("{timestamp_millis}_{sanitized}.{ext}"),
        None => format!("{timestamp_millis}_{sanitized}"),
    }
}
