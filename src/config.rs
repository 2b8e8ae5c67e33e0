//! Carga y gestión de configuración de la aplicación (API de análisis,
//! almacén remoto opcional y caché offline).

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use url::Url;

const DEFAULT_MANIFEST: &[&str] = &[
    "/",
    "/result",
    "/static/css/style.css",
    "/static/js/app.js",
    "/static/manifest.json",
    "/static/icons/icon-192.png",
    "/static/icons/icon-512.png",
];

/// Credenciales del almacén remoto (Supabase).
#[derive(Clone, Debug)]
pub struct RemoteStoreConfig {
    pub url: Url,
    pub key: String,
    pub bucket: String,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub open_browser: bool,

    pub analysis_api_url: Url,
    pub http_timeout: Duration,

    /// `None` si la persistencia está desactivada o mal configurada.
    pub remote_store: Option<RemoteStoreConfig>,

    pub max_file_size_bytes: u64,
    pub max_text_chars: usize,
    pub allowed_extensions: Vec<String>,
    pub cleanup_settle: Duration,

    pub cache_version: String,
    pub cache_dir: Option<PathBuf>,
    pub cache_manifest: Vec<String>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de una función de consulta.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server_addr = get("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());
        let open_browser = get("OPEN_BROWSER").map(|v| parse_flag(&v)).unwrap_or(true);

        let api_url_str =
            get("ANALYSIS_API_URL").unwrap_or_else(|| "http://localhost:5000".to_string());
        let analysis_api_url = Url::parse(&api_url_str)
            .map_err(|e| anyhow!("ANALYSIS_API_URL no es una URL válida ({api_url_str}): {e}"))?;

        let http_timeout = Duration::from_secs(parse_number(get("HTTP_TIMEOUT_SECS"), 120)?);

        let remote_store = if get("ENABLE_SUPABASE").map(|v| parse_flag(&v)).unwrap_or(false) {
            remote_store_from(
                get("SUPABASE_URL"),
                get("SUPABASE_ANON_KEY"),
                get("SUPABASE_BUCKET"),
            )
        } else {
            None
        };

        let max_file_size_mb: u64 = parse_number(get("MAX_FILE_SIZE_MB"), 10)?;
        let max_file_size_bytes = max_file_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("MAX_FILE_SIZE_MB demasiado grande: {max_file_size_mb}"))?;
        let max_text_chars: usize = parse_number(get("MAX_TEXT_CHARS"), 3000)?;
        let allowed_extensions = get("ALLOWED_EXTENSIONS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| vec!["pdf".into(), "docx".into(), "doc".into(), "txt".into()])
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        let cleanup_settle = Duration::from_millis(parse_number(get("CLEANUP_SETTLE_MS"), 1000)?);

        let cache_version = get("CACHE_VERSION").unwrap_or_else(|| "meddoc-cache-v1".to_string());
        let cache_dir = match get("CACHE_DIR") {
            Some(dir) if dir.eq_ignore_ascii_case("none") => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => dirs::cache_dir().map(|d| d.join("meddoc-client").join("offline-cache")),
        };
        let cache_manifest = get("CACHE_MANIFEST")
            .map(|v| split_list(&v))
            .unwrap_or_else(|| DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect());

        Ok(Self {
            server_addr,
            open_browser,
            analysis_api_url,
            http_timeout,
            remote_store,
            max_file_size_bytes,
            max_text_chars,
            allowed_extensions,
            cleanup_settle,
            cache_version,
            cache_dir,
            cache_manifest,
        })
    }
}

/// Devuelve `None` (sin error) si falta algún dato o son valores de ejemplo.
fn remote_store_from(
    url: Option<String>,
    key: Option<String>,
    bucket: Option<String>,
) -> Option<RemoteStoreConfig> {
    let (url, key) = match (url, key) {
        (Some(url), Some(key)) if !is_placeholder(&url) && !is_placeholder(&key) => (url, key),
        _ => {
            tracing::warn!("Supabase activado pero sin credenciales válidas; persistencia desactivada.");
            return None;
        }
    };

    match Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(RemoteStoreConfig {
            url: parsed,
            key,
            bucket: bucket.unwrap_or_else(|| "documents".to_string()),
        }),
        _ => {
            tracing::warn!("SUPABASE_URL no es una URL http(s) válida; persistencia desactivada.");
            None
        }
    }
}

fn is_placeholder(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.contains("your")
        || lower.contains("xxxx")
        || lower.starts_with('<')
        || lower == "changeme"
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| anyhow!("Valor numérico no válido en la configuración: {v}")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
