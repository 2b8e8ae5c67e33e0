//! Modelos de dominio (fichero seleccionado, resultado de análisis y filas
//! del almacén remoto).

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::TransportError;

/// Fichero elegido por el usuario para analizar.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SelectedFile {
    /// Construye el fichero deduciendo el tipo MIME por la extensión cuando
    /// el cliente no lo indica.
    pub fn new(name: impl Into<String>, mime_type: Option<String>, bytes: Bytes) -> Self {
        let name = name.into();
        let mime_type = mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&name)
                    .first_or_octet_stream()
                    .to_string()
            });
        Self {
            name,
            mime_type,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Extensión en minúsculas, sin el punto.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .map(|e| e.to_lowercase())
    }
}

/// Claves de las que se extrae el texto del análisis, por orden de prioridad.
const ANALYSIS_KEYS: [&str; 3] = ["analysis", "ai_analysis", "text"];

/// Resultado canónico de un análisis.
///
/// La API devuelve un mapa libre; aquí se normalizan las claves conocidas y
/// el resto se conserva tal cual en `extra`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AnalysisResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id de la fila `documents` mientras exista en el almacén remoto.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_file_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    /// Normaliza la respuesta de la API.
    ///
    /// Una respuesta con `error` y sin texto de análisis se trata como fallo.
    pub fn from_payload(mut payload: Map<String, Value>) -> Result<Self, TransportError> {
        let mut analysis = None;
        for key in ANALYSIS_KEYS {
            if let Some(Value::String(text)) = payload.remove(key) {
                if analysis.is_none() && !text.trim().is_empty() {
                    analysis = Some(text);
                }
            }
        }

        let error = take_string(&mut payload, "error");
        if analysis.is_none() {
            if let Some(message) = error {
                return Err(TransportError::Api {
                    status: 200,
                    message,
                });
            }
        }

        Ok(Self {
            analysis,
            filename: take_string(&mut payload, "filename"),
            file_size: take_u64(&mut payload, "file_size"),
            text_length: take_u64(&mut payload, "text_length"),
            error: error.or_else(|| take_string(&mut payload, "ai_error")),
            db_file_id: None,
            extra: payload,
        })
    }

    /// Elimina cualquier identificador remoto del resultado visible.
    pub fn strip_remote_ids(&mut self) {
        self.db_file_id = None;
        self.extra.retain(|key, _| !key.starts_with("db_"));
    }
}

fn take_string(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    match payload.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn take_u64(payload: &mut Map<String, Value>, key: &str) -> Option<u64> {
    match payload.remove(key) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Fila a insertar en la tabla `documents`.
#[derive(Debug, Clone, Serialize)]
pub struct NewDocument {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

/// Fila de la tabla `documents`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRow {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Fila a insertar en la tabla `analyses`.
#[derive(Debug, Clone, Serialize)]
pub struct NewAnalysis {
    pub document_id: String,
    pub analysis_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_length: Option<u64>,
}

/// Fila de la tabla `analyses`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRow {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(deserialize_with = "id_as_string")]
    pub document_id: String,
    #[serde(default)]
    pub analysis_text: String,
    #[serde(default)]
    pub text_length: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Análisis con su documento asociado (join `analyses` → `documents`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub analysis: AnalysisRow,
    #[serde(default, rename = "documents")]
    pub document: Option<DocumentRow>,
}

/// Acepta ids numéricos (bigserial) o de texto (uuid).
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("id no válido: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn analysis_key_wins_over_fallbacks() {
        let result = AnalysisResult::from_payload(payload(json!({
            "analysis": "principal",
            "ai_analysis": "secundario",
            "text": "terciario"
        })))
        .unwrap();
        assert_eq!(result.analysis.as_deref(), Some("principal"));
        assert!(result.extra.is_empty());
    }

    #[test]
    fn falls_back_to_ai_analysis_then_text() {
        let result = AnalysisResult::from_payload(payload(json!({
            "ai_analysis": "de la IA",
            "filename": "x.pdf",
            "file_size": 1234,
            "text_length": 99,
            "text_preview": "..."
        })))
        .unwrap();
        assert_eq!(result.analysis.as_deref(), Some("de la IA"));
        assert_eq!(result.filename.as_deref(), Some("x.pdf"));
        assert_eq!(result.file_size, Some(1234));
        assert_eq!(result.text_length, Some(99));
        assert_eq!(result.extra.get("text_preview"), Some(&json!("...")));

        let result = AnalysisResult::from_payload(payload(json!({ "text": "solo texto" }))).unwrap();
        assert_eq!(result.analysis.as_deref(), Some("solo texto"));
    }

    #[test]
    fn error_without_analysis_is_transport_failure() {
        let err = AnalysisResult::from_payload(payload(json!({ "error": "No file" }))).unwrap_err();
        match err {
            TransportError::Api { message, .. } => assert_eq!(message, "No file"),
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[test]
    fn ai_error_is_kept_as_soft_error() {
        let result = AnalysisResult::from_payload(payload(json!({
            "success": true,
            "filename": "a.txt",
            "ai_error": "sin clave"
        })))
        .unwrap();
        assert!(result.analysis.is_none());
        assert_eq!(result.error.as_deref(), Some("sin clave"));
    }

    #[test]
    fn strip_remote_ids_removes_db_fields() {
        let mut result = AnalysisResult::from_payload(payload(json!({
            "analysis": "OK",
            "db_analysis_id": 7,
            "model": "deepseek-chat"
        })))
        .unwrap();
        result.db_file_id = Some("42".into());
        result.strip_remote_ids();

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("db_file_id").is_none());
        assert!(json.get("db_analysis_id").is_none());
        assert_eq!(json["model"], "deepseek-chat");
    }

    #[test]
    fn selected_file_guesses_mime() {
        let file = SelectedFile::new("Informe.PDF", None, Bytes::from_static(b"%PDF"));
        assert_eq!(file.mime_type, "application/pdf");
        assert_eq!(file.extension().as_deref(), Some("pdf"));
        assert_eq!(file.size(), 4);
    }

    #[test]
    fn rows_accept_numeric_ids() {
        let row: AnalysisRow = serde_json::from_value(json!({
            "id": 3,
            "document_id": 9,
            "analysis_text": "OK"
        }))
        .unwrap();
        assert_eq!(row.id, "3");
        assert_eq!(row.document_id, "9");
    }

    #[test]
    fn history_entry_reads_embedded_document() {
        let entry: HistoryEntry = serde_json::from_value(json!({
            "id": "a1",
            "document_id": "d1",
            "analysis_text": "OK",
            "documents": { "id": "d1", "file_name": "x.pdf" }
        }))
        .unwrap();
        assert_eq!(entry.analysis.id, "a1");
        assert_eq!(entry.document.unwrap().file_name, "x.pdf");
    }
}
