//! Caché offline del shell de la aplicación.
//!
//! Intercepta las peticiones dirigidas al origen remoto: los recursos
//! estáticos se sirven primero desde caché y las llamadas `/api/` van primero
//! a la red. Las cachés tienen nombre de versión; al activar una versión
//! nueva se borran todas las demás.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const INDEX_FILE: &str = "index.json";
const ROOT_DOCUMENT: &str = "/";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "content-length",
];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Error de red: {0}")]
    Network(String),
    #[error("Petición no válida: {0}")]
    InvalidRequest(String),
    #[error("Error de E/S en la caché: {0}")]
    Io(#[from] std::io::Error),
    #[error("Índice de caché corrupto: {0}")]
    Index(#[from] serde_json::Error),
    #[error("Instalación fallida: {0}")]
    Install(String),
}

/// Origen de una respuesta: mismo origen (`Basic`) o de otro origen (`Opaque`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Basic,
    Opaque,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    /// Ruta y query relativas al origen remoto, p. ej. `/static/js/app.js`.
    pub path: String,
    pub is_navigation: bool,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            is_navigation: false,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn navigate(path: impl Into<String>) -> Self {
        Self {
            is_navigation: true,
            ..Self::get(path)
        }
    }

    fn is_api(&self) -> bool {
        self.path == "/api" || self.path.starts_with("/api/")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
}

impl FetchResponse {
    /// Sólo se guardan respuestas 200 del mismo origen.
    fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind == ResponseKind::Basic
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Fetcher real contra el origen remoto.
pub struct UpstreamFetcher {
    client: Client,
    origin: Url,
}

impl UpstreamFetcher {
    pub fn new(origin: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client, origin })
    }
}

#[async_trait]
impl Fetcher for UpstreamFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = self
            .origin
            .join(&req.path)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", req.path)))?;
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let kind = if resp.url().origin() == self.origin.origin() {
            ResponseKind::Basic
        } else {
            ResponseKind::Opaque
        };
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            kind,
        })
    }
}

/// Entrada del índice en disco de una caché.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    kind: ResponseKind,
    body_file: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: FetchResponse,
    body_file: String,
}

type NamedCache = HashMap<String, CacheEntry>;

/// Conjunto de cachés con nombre (URL → respuesta).
///
/// Con directorio raíz, cada caché vive en `<raíz>/<nombre>/` con un
/// `index.json` y un fichero por cuerpo; sin él, sólo en memoria.
pub struct CacheStorage {
    root: Option<PathBuf>,
    caches: Mutex<HashMap<String, NamedCache>>,
}

impl CacheStorage {
    pub fn in_memory() -> Self {
        Self {
            root: None,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Abre (o crea) el almacenamiento en disco y carga las cachés existentes.
    pub async fn open(root: PathBuf) -> Result<Self, FetchError> {
        fs::create_dir_all(&root).await?;
        let mut caches = HashMap::new();

        let mut dir = fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match load_cache(&entry.path()).await {
                Ok(cache) => {
                    debug!("Caché {name} cargada con {} entradas", cache.len());
                    caches.insert(name, cache);
                }
                Err(e) => warn!("Ignorando caché {name} ilegible: {e}"),
            }
        }

        Ok(Self {
            root: Some(root),
            caches: Mutex::new(caches),
        })
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn match_url(&self, cache: &str, url: &str) -> Option<FetchResponse> {
        self.caches
            .lock()
            .await
            .get(cache)
            .and_then(|c| c.get(url))
            .map(|e| e.response.clone())
    }

    /// `true` si la caché existe y contiene todas las URLs.
    pub async fn contains_all(&self, cache: &str, urls: &[String]) -> bool {
        let caches = self.caches.lock().await;
        match caches.get(cache) {
            Some(c) => urls.iter().all(|u| c.contains_key(u)),
            None => false,
        }
    }

    pub async fn put(&self, cache: &str, url: &str, response: FetchResponse) -> Result<(), FetchError> {
        self.put_all(cache, vec![(url.to_string(), response)]).await
    }

    /// Guarda varias entradas de una vez. La caché en memoria sólo se
    /// sustituye cuando todos los cuerpos y el índice están escritos.
    pub async fn put_all(
        &self,
        cache: &str,
        entries: Vec<(String, FetchResponse)>,
    ) -> Result<(), FetchError> {
        let mut caches = self.caches.lock().await;
        let mut staged = caches.get(cache).cloned().unwrap_or_default();
        let dir = self.root.as_ref().map(|r| r.join(cache));

        let mut written = Vec::new();
        let mut replaced = Vec::new();
        let staging = stage_entries(dir.as_deref(), &mut staged, entries, &mut written, &mut replaced).await;

        match (staging, &dir) {
            (Ok(()), dir) => {
                caches.insert(cache.to_string(), staged);
                if let Some(dir) = dir {
                    for old in replaced {
                        let _ = fs::remove_file(dir.join(old)).await;
                    }
                }
                Ok(())
            }
            (Err(e), Some(dir)) => {
                for body in written {
                    let _ = fs::remove_file(dir.join(body)).await;
                }
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Borra una caché completa. Devuelve `true` si existía.
    pub async fn delete(&self, cache: &str) -> Result<bool, FetchError> {
        let existed = self.caches.lock().await.remove(cache).is_some();
        if let Some(root) = &self.root {
            let dir = root.join(cache);
            if fs::try_exists(&dir).await? {
                fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(existed)
    }
}

async fn stage_entries(
    dir: Option<&Path>,
    staged: &mut NamedCache,
    entries: Vec<(String, FetchResponse)>,
    written: &mut Vec<String>,
    replaced: &mut Vec<String>,
) -> Result<(), FetchError> {
    if let Some(dir) = dir {
        fs::create_dir_all(dir).await?;
    }
    for (url, response) in entries {
        let body_file = format!("{}.body", Uuid::new_v4());
        if let Some(dir) = dir {
            fs::write(dir.join(&body_file), &response.body).await?;
            written.push(body_file.clone());
        }
        if let Some(old) = staged.insert(url, CacheEntry { response, body_file }) {
            replaced.push(old.body_file);
        }
    }
    if let Some(dir) = dir {
        write_index(dir, staged).await?;
    }
    Ok(())
}

async fn load_cache(dir: &Path) -> Result<NamedCache, FetchError> {
    let raw = fs::read(dir.join(INDEX_FILE)).await?;
    let index: Vec<IndexEntry> = serde_json::from_slice(&raw)?;
    let mut cache = HashMap::new();
    for entry in index {
        let body = fs::read(dir.join(&entry.body_file)).await?;
        cache.insert(
            entry.url,
            CacheEntry {
                response: FetchResponse {
                    status: entry.status,
                    headers: entry.headers,
                    body: Bytes::from(body),
                    kind: entry.kind,
                },
                body_file: entry.body_file,
            },
        );
    }
    Ok(cache)
}

async fn write_index(dir: &Path, cache: &NamedCache) -> Result<(), FetchError> {
    let index: Vec<IndexEntry> = cache
        .iter()
        .map(|(url, e)| IndexEntry {
            url: url.clone(),
            status: e.response.status,
            headers: e.response.headers.clone(),
            kind: e.response.kind,
            body_file: e.body_file.clone(),
        })
        .collect();
    fs::write(dir.join(INDEX_FILE), serde_json::to_vec_pretty(&index)?).await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum WorkerState {
    Installing(String),
    Installed(String),
    Active(String),
    Redundant(String),
}

pub struct OfflineWorker {
    version: String,
    manifest: Vec<String>,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    state: StdMutex<WorkerState>,
}

impl OfflineWorker {
    pub fn new(
        version: impl Into<String>,
        manifest: Vec<String>,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let version = version.into();
        Self {
            state: StdMutex::new(WorkerState::Installing(version.clone())),
            version,
            manifest,
            storage,
            fetcher,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_state(&self, state: WorkerState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Precarga el manifiesto completo en la caché de esta versión.
    /// O se guardan todas las URLs o ninguna.
    pub async fn install(&self) -> Result<(), FetchError> {
        if self.storage.contains_all(&self.version, &self.manifest).await {
            info!("Caché {} ya instalada, se omite la precarga", self.version);
            self.set_state(WorkerState::Installed(self.version.clone()));
            return Ok(());
        }

        let mut entries = Vec::with_capacity(self.manifest.len());
        for url in &self.manifest {
            let fetched = self.fetcher.fetch(&FetchRequest::get(url.clone())).await;
            match fetched {
                Ok(resp) if resp.status == 200 => entries.push((url.clone(), resp)),
                Ok(resp) => {
                    self.set_state(WorkerState::Redundant(self.version.clone()));
                    return Err(FetchError::Install(format!("{url} respondió {}", resp.status)));
                }
                Err(e) => {
                    self.set_state(WorkerState::Redundant(self.version.clone()));
                    return Err(FetchError::Install(format!("{url}: {e}")));
                }
            }
        }

        if let Err(e) = self.storage.put_all(&self.version, entries).await {
            self.set_state(WorkerState::Redundant(self.version.clone()));
            return Err(FetchError::Install(format!("no se pudo guardar la caché: {e}")));
        }
        info!("Caché {} instalada con {} recursos", self.version, self.manifest.len());
        self.set_state(WorkerState::Installed(self.version.clone()));
        Ok(())
    }

    /// Activa la versión actual y borra todas las cachés de otras versiones.
    /// Devuelve los nombres borrados.
    pub async fn activate(&self) -> Result<Vec<String>, FetchError> {
        let mut deleted = Vec::new();
        for name in self.storage.keys().await {
            if name != self.version {
                self.storage.delete(&name).await?;
                info!("Caché antigua eliminada: {name}");
                deleted.push(name);
            }
        }
        self.set_state(WorkerState::Active(self.version.clone()));
        info!("Versión {} activa; controla todas las páginas abiertas", self.version);
        Ok(deleted)
    }

    /// Enruta una petición interceptada.
    pub async fn handle(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if !req.method.eq_ignore_ascii_case("GET") {
            return self.fetcher.fetch(req).await;
        }
        if req.is_api() {
            self.network_first(req).await
        } else {
            self.cache_first(req).await
        }
    }

    async fn network_first(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        match self.fetcher.fetch(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                debug!("Red no disponible para {}; probando caché", req.path);
                match self.storage.match_url(&self.version, &req.path).await {
                    Some(cached) => Ok(cached),
                    None => self.navigation_fallback(req, e).await,
                }
            }
        }
    }

    async fn cache_first(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if let Some(cached) = self.storage.match_url(&self.version, &req.path).await {
            return Ok(cached);
        }
        match self.fetcher.fetch(req).await {
            Ok(resp) => {
                if resp.is_cacheable() {
                    if let Err(e) = self.storage.put(&self.version, &req.path, resp.clone()).await {
                        warn!("No se pudo guardar {} en caché: {e}", req.path);
                    }
                }
                Ok(resp)
            }
            Err(e) => self.navigation_fallback(req, e).await,
        }
    }

    async fn navigation_fallback(&self, req: &FetchRequest, err: FetchError) -> Result<FetchResponse, FetchError> {
        if req.is_navigation {
            if let Some(root) = self.storage.match_url(&self.version, ROOT_DOCUMENT).await {
                debug!("Sin red: sirviendo documento raíz para {}", req.path);
                return Ok(root);
            }
        }
        Err(err)
    }
}
