//! Cliente de la API de análisis (`/api/health`, `/api/test/upload`,
//! `/api/test/text`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::{
    error::TransportError,
    models::{AnalysisResult, SelectedFile},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    pub status: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn health(&self) -> Result<ApiHealth, TransportError>;
    async fn analyze_file(&self, file: &SelectedFile) -> Result<AnalysisResult, TransportError>;
    async fn analyze_text(&self, text: &str) -> Result<AnalysisResult, TransportError>;
}

/// Implementación sobre HTTP con reqwest.
#[derive(Debug, Clone)]
pub struct HttpAnalysisApi {
    client: Client,
    base_url: Url,
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

impl HttpAnalysisApi {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Parse(format!("URL de la API no válida: {e}")))
    }

    async fn read_analysis(resp: Response) -> Result<AnalysisResult, TransportError> {
        let status = resp.status();
        let body = resp.text().await?;
        let payload: Option<Map<String, Value>> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(|p| p.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Err(TransportError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload = payload.ok_or_else(|| {
            TransportError::Parse("la respuesta de la API no es un objeto JSON".to_string())
        })?;
        AnalysisResult::from_payload(payload)
    }
}

#[async_trait]
impl AnalysisApi for HttpAnalysisApi {
    async fn health(&self) -> Result<ApiHealth, TransportError> {
        let resp = self.client.get(self.endpoint("/api/health")?).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Api {
                status: resp.status().as_u16(),
                message: "health check fallido".to_string(),
            });
        }
        resp.json::<ApiHealth>()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }

    async fn analyze_file(&self, file: &SelectedFile) -> Result<AnalysisResult, TransportError> {
        debug!("Enviando {} ({} bytes) a la API de análisis", file.name, file.size());
        let part = multipart::Part::bytes(file.bytes.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)?;
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(self.endpoint("/api/test/upload")?)
            .multipart(form)
            .send()
            .await?;
        Self::read_analysis(resp).await
    }

    async fn analyze_text(&self, text: &str) -> Result<AnalysisResult, TransportError> {
        debug!("Enviando {} caracteres a la API de análisis", text.chars().count());
        let resp = self
            .client
            .post(self.endpoint("/api/test/text")?)
            .json(&TextRequest { text })
            .send()
            .await?;
        Self::read_analysis(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Multipart,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use bytes::Bytes;
    use serde_json::json;

    async fn serve(app: Router) -> HttpAnalysisApi {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HttpAnalysisApi::new(
            Url::parse(&format!("http://{addr}")).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn error_status_carries_api_message() {
        let api = serve(Router::new().route(
            "/api/test/text",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "No text provided" })),
                )
            }),
        ))
        .await;

        match api.analyze_text("hola").await.unwrap_err() {
            TransportError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "No text provided");
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_without_json_uses_body_text() {
        let api = serve(Router::new().route(
            "/api/test/text",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream caído") }),
        ))
        .await;

        match api.analyze_text("hola").await.unwrap_err() {
            TransportError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream caído");
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_success_body_is_a_parse_error() {
        let api = serve(Router::new().route(
            "/api/test/text",
            post(|| async { "<html>mantenimiento</html>" }),
        ))
        .await;

        let err = api.analyze_text("hola").await.unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[tokio::test]
    async fn text_and_file_requests_reach_the_api() {
        let api = serve(
            Router::new()
                .route(
                    "/api/test/text",
                    post(|Json(body): Json<Value>| async move {
                        Json(json!({ "analysis": format!("texto:{}", body["text"].as_str().unwrap_or_default()) }))
                    }),
                )
                .route(
                    "/api/test/upload",
                    post(|mut multipart: Multipart| async move {
                        let field = multipart.next_field().await.unwrap().unwrap();
                        let name = field.name().unwrap_or_default().to_string();
                        let file_name = field.file_name().unwrap_or_default().to_string();
                        let mime = field.content_type().unwrap_or_default().to_string();
                        let size = field.bytes().await.unwrap().len();
                        Json(json!({
                            "ai_analysis": format!("{name}:{file_name}:{mime}"),
                            "file_size": size,
                        }))
                    }),
                )
                .route("/api/health", get(|| async { Json(json!({ "status": "healthy" })) })),
        )
        .await;

        let result = api.analyze_text("glucosa 90").await.unwrap();
        assert_eq!(result.analysis.as_deref(), Some("texto:glucosa 90"));

        let file = SelectedFile::new("x.pdf", None, Bytes::from_static(b"%PDF-1.4"));
        let result = api.analyze_file(&file).await.unwrap();
        assert_eq!(result.analysis.as_deref(), Some("file:x.pdf:application/pdf"));
        assert_eq!(result.file_size, Some(8));

        assert_eq!(api.health().await.unwrap().status, "healthy");
    }

    #[test]
    fn endpoints_are_joined_from_the_origin() {
        let api = HttpAnalysisApi::new(
            Url::parse("http://localhost:5000/app/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            api.endpoint("/api/test/text").unwrap().as_str(),
            "http://localhost:5000/api/test/text"
        );
    }

    #[test]
    fn health_keeps_service_details() {
        let health: ApiHealth = serde_json::from_str(
            r#"{"status":"healthy","services":{"supabase":"optional"}}"#,
        )
        .unwrap();
        assert_eq!(health.status, "healthy");
        assert!(health.details.contains_key("services"));
    }
}
