//! Almacén remoto opcional: object storage + tablas `documents` y `analyses`
//! sobre la API REST de Supabase (Storage y PostgREST).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::{
    config::RemoteStoreConfig,
    error::StoreError,
    models::{AnalysisRow, DocumentRow, HistoryEntry, NewAnalysis, NewDocument},
};

const DOCUMENTS_TABLE: &str = "documents";
const ANALYSES_TABLE: &str = "analyses";

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload_object(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;
    async fn remove_object(&self, path: &str) -> Result<(), StoreError>;

    async fn insert_document(&self, doc: &NewDocument) -> Result<DocumentRow, StoreError>;
    async fn insert_analysis(&self, analysis: &NewAnalysis) -> Result<AnalysisRow, StoreError>;
    async fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRow>, StoreError>;
    async fn delete_analysis(&self, id: &str) -> Result<(), StoreError>;
    async fn delete_document(&self, id: &str) -> Result<(), StoreError>;

    /// Análisis más recientes con su documento (join-select).
    async fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: Url,
    key: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(cfg: &RemoteStoreConfig, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: cfg.url.clone(),
            key: cfg.key.clone(),
            bucket: cfg.bucket.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(path)
            .map_err(|e| StoreError::Parse(format!("URL de Supabase no válida: {e}")))
    }

    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        self.url(&format!("/rest/v1/{table}"))
    }

    fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        self.url(&format!("/storage/v1/object/{}/{}", self.bucket, path))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.key))
    }

    async fn check(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(StoreError::Api {
            status: status.as_u16(),
            message: message.chars().take(300).collect(),
        })
    }

    async fn insert_row<T, R>(&self, table: &str, row: &T) -> Result<R, StoreError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let resp = self
            .authed(self.client.post(self.table_url(table)?))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        let rows: Vec<R> = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Parse(format!("la inserción en {table} no devolvió filas")))
    }

    async fn select_by_id<R: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<R>, StoreError> {
        let resp = self
            .authed(self.client.get(self.table_url(table)?))
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())])
            .send()
            .await?;
        let rows: Vec<R> = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let resp = self
            .authed(self.client.delete(self.table_url(table)?))
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        Self::check(resp).await?;
        debug!("Fila {id} eliminada de {table}");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    async fn upload_object(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let resp = self
            .authed(self.client.post(self.object_url(path)?))
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn remove_object(&self, path: &str) -> Result<(), StoreError> {
        let resp = self
            .authed(self.client.delete(self.url(&format!("/storage/v1/object/{}", self.bucket))?))
            .json(&json!({ "prefixes": [path] }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn insert_document(&self, doc: &NewDocument) -> Result<DocumentRow, StoreError> {
        self.insert_row(DOCUMENTS_TABLE, doc).await
    }

    async fn insert_analysis(&self, analysis: &NewAnalysis) -> Result<AnalysisRow, StoreError> {
        self.insert_row(ANALYSES_TABLE, analysis).await
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRow>, StoreError> {
        self.select_by_id(ANALYSES_TABLE, id).await
    }

    async fn delete_analysis(&self, id: &str) -> Result<(), StoreError> {
        self.delete_by_id(ANALYSES_TABLE, id).await
    }

    async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        self.delete_by_id(DOCUMENTS_TABLE, id).await
    }

    async fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let resp = self
            .authed(self.client.get(self.table_url(ANALYSES_TABLE)?))
            .query(&[
                ("select", "*,documents(*)".to_string()),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }
}
