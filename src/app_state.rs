use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::{config::AppConfig, offline_cache::OfflineWorker, workflow::{AnalysisOutcome, AnalysisWorkflow}};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub workflow: AnalysisWorkflow,
    pub worker: Arc<OfflineWorker>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado visible para la interfaz. Las operaciones concurrentes no se
/// coordinan: el último resultado escrito es el que se muestra.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub in_flight: u32,
    pub message: String,
    pub last_result: Option<AnalysisOutcome>,
}

impl Status {
    pub fn ready() -> Self {
        Self {
            message: "Servidor listo.".to_string(),
            ..Default::default()
        }
    }
}
