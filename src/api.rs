use axum::{
    body::{to_bytes, Body},
    extract::{DefaultBodyLimit, Json, Multipart, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use std::future::Future;
use tokio::spawn;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    app_state::{AppState, Status},
    error::AppError,
    models::{HistoryEntry, SelectedFile},
    offline_cache::{FetchRequest, FetchResponse},
    workflow::{AnalysisOutcome, AnalysisWorkflow},
};

/// Cabeceras de la petición que se reenvían al origen remoto.
const FORWARDED_HEADERS: &[&str] = &["accept", "accept-language", "content-type", "authorization", "cookie"];

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

type ApiError = (StatusCode, Json<Value>);

// --- Payloads ---

#[derive(Deserialize)]
pub struct TextPayload {
    text: String,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    // Margen sobre el máximo para que un fichero algo mayor llegue a la
    // validación y reciba un error claro en lugar de un 413.
    let body_limit = (app_state.config.max_file_size_bytes as usize)
        .saturating_mul(2)
        .max(2 * 1024 * 1024);

    Router::new()
        .route("/api/analyze/file", post(analyze_file_handler))
        .route("/api/analyze/text", post(analyze_text_handler))
        .route("/api/health", get(health_handler))
        .route("/api/history", get(history_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .fallback(offline_proxy_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn analyze_file_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisOutcome>, ApiError> {
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), Json(json!({ "error": e.body_text() }))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let mime = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (e.status(), Json(json!({ "error": e.body_text() }))))?;
        file = Some(SelectedFile::new(name, mime, bytes));
    }

    let file = file.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No se ha recibido ningún fichero." })),
        )
    })?;

    run_to_completion(state, format!("Analizando {}...", file.name), |workflow| async move {
        workflow.analyze_file(file).await
    })
    .await
}

#[axum::debug_handler]
async fn analyze_text_handler(
    State(state): State<AppState>,
    Json(payload): Json<TextPayload>,
) -> Result<Json<AnalysisOutcome>, ApiError> {
    run_to_completion(state, "Analizando texto...".to_string(), |workflow| async move {
        workflow.analyze_text(&payload.text).await
    })
    .await
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let analysis_api = match state.workflow.api().health().await {
        Ok(health) => json!({ "status": health.status }),
        Err(e) => json!({ "status": "unreachable", "error": e.to_string() }),
    };
    let remote_store = if state.workflow.store().is_some() {
        "configured"
    } else {
        "disabled"
    };

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "analysis_api": analysis_api,
            "remote_store": remote_store,
            "offline_cache": state.worker.state(),
        }
    }))
}

#[axum::debug_handler]
async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let Some(store) = state.workflow.store() else {
        return Ok(Json(Vec::new()));
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    store.list_history(limit).await.map(Json).map_err(|e| {
        error!("Error consultando el historial: {}", e);
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": format!("No se pudo consultar el historial: {}", e) })),
        )
    })
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().await.clone())
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().await.take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

/// Todo lo que no es API local pasa por la caché offline hacia el origen remoto.
async fn offline_proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body_limit = (state.config.max_file_size_bytes as usize).saturating_mul(2);
    let body = match to_bytes(body, body_limit).await {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let fetch = FetchRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        is_navigation: is_navigation(&parts.method, &parts.headers),
        headers: forwarded_headers(&parts.headers),
        body,
    };

    match state.worker.handle(&fetch).await {
        Ok(resp) => into_response(resp),
        Err(e) => {
            warn!("Sin respuesta para {}: {}", fetch.path, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": format!("Recurso no disponible sin conexión: {}", e) })),
            )
                .into_response()
        }
    }
}

// --- Utilidades ---

/// Lanza el análisis en segundo plano y espera su resultado. Si el cliente
/// se desconecta, la tarea termina igualmente y el estado queda actualizado.
async fn run_to_completion<F, Fut>(
    state: AppState,
    message: String,
    operation: F,
) -> Result<Json<AnalysisOutcome>, ApiError>
where
    F: FnOnce(AnalysisWorkflow) -> Fut,
    Fut: Future<Output = Result<AnalysisOutcome, AppError>> + Send + 'static,
{
    let pending = operation(state.workflow.clone());
    let task = spawn(async move {
        begin(&state, message).await;
        let outcome = pending.await;
        finish(&state, outcome).await
    });

    task.await.map_err(|e| {
        error!("La tarea de análisis terminó de forma anómala: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("La tarea de análisis falló: {}", e) })),
        )
    })?
}

async fn begin(state: &AppState, message: String) {
    let mut status = state.status.lock().await;
    status.in_flight += 1;
    status.is_busy = true;
    status.message = message;
}

async fn finish(
    state: &AppState,
    outcome: Result<AnalysisOutcome, AppError>,
) -> Result<Json<AnalysisOutcome>, ApiError> {
    let mut status = state.status.lock().await;
    status.in_flight = status.in_flight.saturating_sub(1);
    status.is_busy = status.in_flight > 0;

    match outcome {
        Ok(outcome) => {
            status.message = if outcome.warnings.is_empty() {
                "¡Análisis completado!".to_string()
            } else {
                format!("Análisis completado con {} avisos.", outcome.warnings.len())
            };
            status.last_result = Some(outcome.clone());
            Ok(Json(outcome))
        }
        Err(err) => {
            status.message = err.to_string();
            let code = match &err {
                AppError::Validation(_) => StatusCode::BAD_REQUEST,
                AppError::Transport(_) => StatusCode::BAD_GATEWAY,
                AppError::Persistence(_) | AppError::Cleanup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((code, Json(json!({ "error": err.to_string(), "kind": err.kind() }))))
        }
    }
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if *method != Method::GET {
        return false;
    }
    let mode_is_navigate = headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("navigate"))
        .unwrap_or(false);
    let accepts_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);
    mode_is_navigate || accepts_html
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn into_response(resp: FetchResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use bytes::Bytes;
    use crate::{
        analysis_api::{AnalysisApi, ApiHealth},
        config::AppConfig,
        error::TransportError,
        models::AnalysisResult,
        offline_cache::{CacheStorage, OfflineWorker, ResponseKind, UpstreamFetcher},
        workflow::UploadLimits,
    };
    use async_trait::async_trait;
    use serde_json::Map;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::{oneshot, Mutex};

    struct SlowApi;

    impl SlowApi {
        async fn reply() -> Result<AnalysisResult, TransportError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut payload = Map::new();
            payload.insert("analysis".into(), json!("OK"));
            AnalysisResult::from_payload(payload)
        }
    }

    #[async_trait]
    impl AnalysisApi for SlowApi {
        async fn health(&self) -> Result<ApiHealth, TransportError> {
            Ok(ApiHealth {
                status: "healthy".into(),
                details: Map::new(),
            })
        }

        async fn analyze_file(&self, _file: &SelectedFile) -> Result<AnalysisResult, TransportError> {
            Self::reply().await
        }

        async fn analyze_text(&self, _text: &str) -> Result<AnalysisResult, TransportError> {
            Self::reply().await
        }
    }

    fn app_state() -> AppState {
        let config = AppConfig::from_lookup(|key| match key {
            "CACHE_DIR" => Some("none".to_string()),
            _ => None,
        })
        .unwrap();
        let workflow = AnalysisWorkflow::new(
            Arc::new(SlowApi),
            None,
            UploadLimits::default(),
            Duration::ZERO,
        );
        let fetcher = UpstreamFetcher::new(config.analysis_api_url.clone(), Duration::from_secs(1)).unwrap();
        let worker = OfflineWorker::new(
            "v1",
            Vec::new(),
            Arc::new(CacheStorage::in_memory()),
            Arc::new(fetcher),
        );
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        AppState {
            config,
            workflow,
            worker: Arc::new(worker),
            status: Arc::new(Mutex::new(Status::ready())),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
        }
    }

    #[tokio::test]
    async fn status_settles_after_client_disconnects() {
        let state = app_state();
        let request = analyze_text_handler(
            State(state.clone()),
            Json(TextPayload {
                text: "hemoglobina 13.5".into(),
            }),
        );
        assert!(tokio::time::timeout(Duration::from_millis(20), request).await.is_err());
        assert!(state.status.lock().await.is_busy);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = state.status.lock().await;
        assert!(!status.is_busy);
        assert_eq!(status.in_flight, 0);
        let last = status.last_result.as_ref().unwrap();
        assert_eq!(last.result.analysis.as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn validation_errors_map_to_bad_request() {
        let state = app_state();
        let (code, Json(body)) = analyze_text_handler(
            State(state.clone()),
            Json(TextPayload { text: "   ".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(!state.status.lock().await.is_busy);
    }

    #[test]
    fn detects_navigation_requests() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(is_navigation(&Method::GET, &headers));
        assert!(!is_navigation(&Method::POST, &headers));

        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        assert!(is_navigation(&Method::GET, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!is_navigation(&Method::GET, &headers));
    }

    #[test]
    fn only_whitelisted_headers_are_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:3322"));
        let forwarded = forwarded_headers(&headers);
        assert_eq!(forwarded, vec![("content-type".to_string(), "application/json".to_string())]);
    }

    #[test]
    fn fetch_response_becomes_http_response() {
        let resp = into_response(FetchResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/css".into())],
            body: Bytes::from_static(b"body{}"),
            kind: ResponseKind::Basic,
        });
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/css");
    }
}
