// Módulos de la aplicación
mod analysis_api;
mod api;
mod app_state;
mod config;
mod error;
mod models;
mod offline_cache;
mod remote_store;
mod workflow;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    analysis_api::HttpAnalysisApi,
    app_state::{AppState, Status},
    offline_cache::{CacheStorage, OfflineWorker, UpstreamFetcher},
    remote_store::{RemoteStore, SupabaseStore},
    workflow::{AnalysisWorkflow, UploadLimits},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Cliente de la API de análisis y almacén remoto opcional
    let api = HttpAnalysisApi::new(cfg.analysis_api_url.clone(), cfg.http_timeout)
        .context("Error creando el cliente de la API de análisis")?;
    let store: Option<Arc<dyn RemoteStore>> = match &cfg.remote_store {
        Some(store_cfg) => {
            info!("✅ Persistencia efímera en Supabase ({})", store_cfg.url);
            let store = SupabaseStore::new(store_cfg, cfg.http_timeout)
                .context("Error creando el cliente de Supabase")?;
            Some(Arc::new(store) as Arc<dyn RemoteStore>)
        }
        None => {
            info!("ℹ️  Persistencia remota desactivada; sólo se usará la API de análisis.");
            None
        }
    };

    let limits = UploadLimits {
        max_file_size_bytes: cfg.max_file_size_bytes,
        max_text_chars: cfg.max_text_chars,
        allowed_extensions: cfg.allowed_extensions.clone(),
    };
    let workflow = AnalysisWorkflow::new(Arc::new(api), store, limits, cfg.cleanup_settle);

    // 4. Caché offline del shell remoto
    let storage = match &cfg.cache_dir {
        Some(dir) => match CacheStorage::open(dir.clone()).await {
            Ok(storage) => storage,
            Err(e) => {
                warn!("No se pudo abrir la caché en {}: {}. Se usará memoria.", dir.display(), e);
                CacheStorage::in_memory()
            }
        },
        None => CacheStorage::in_memory(),
    };
    let fetcher = UpstreamFetcher::new(cfg.analysis_api_url.clone(), cfg.http_timeout)
        .context("Error creando el cliente del origen remoto")?;
    let worker = Arc::new(OfflineWorker::new(
        cfg.cache_version.clone(),
        cfg.cache_manifest.clone(),
        Arc::new(storage),
        Arc::new(fetcher),
    ));
    match worker.install().await {
        Ok(()) => {
            worker
                .activate()
                .await
                .context("Error activando la caché offline")?;
        }
        Err(e) => warn!("Caché offline no instalada ({}); se conservan las versiones anteriores.", e),
    }

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        workflow,
        worker,
        status: Arc::new(Mutex::new(Status::ready())),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router
    let app = api::create_router(app_state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    let server_url = format!("http://{}", cfg.server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    if cfg.open_browser && webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::select! {
                _ = shutdown_rx => info!("Señal de apagado recibida, iniciando cierre del servidor."),
                _ = tokio::signal::ctrl_c() => info!("Ctrl+C recibido, iniciando cierre del servidor."),
            }
        })
        .await
        .context("Error en el servidor HTTP")?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
