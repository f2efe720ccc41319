mod api;
mod config;
mod scan;
mod state;
mod utils;
mod watch;

use std::env;
use std::sync::Arc;

use axum::Router;
use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};
use library::Library;
use metadata::LoftyExtractor;
use parking_lot::RwLock;
use scan::{run_once, run_subprocess, start_scan, ScanCommand};
use scanner::{EventBroker, LocalScanner, Scanner, DEFAULT_LIBRARY_ID};
use state::AppState;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use watch::configure_watcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let command = ScanCommand::parse(env::args().skip(1))?;

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, config.index_path.trim());
    let library = Library::open(&index_path)?;
    let music_root = resolve_music_root(&config_path, &config.music_root);
    match &music_root {
        Some(root) => {
            library.ensure_library(DEFAULT_LIBRARY_ID, "Music", root)?;
            if !root.exists() {
                warn!("Music directory {:?} does not exist", root);
            }
        }
        None => info!("Music directory not configured yet; set music_root in {:?}", config_path),
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let store = Arc::new(library.clone());
    let extractor = Arc::new(LoftyExtractor);

    if let Some(command) = command {
        let code = if command.subprocess {
            let local = LocalScanner::new(store, extractor, &config.scanner);
            run_subprocess(local, command.full_rescan, shutdown).await
        } else {
            let scanner = Scanner::from_config(
                &config.scanner,
                store,
                extractor,
                Arc::new(EventBroker::new()),
                shutdown.clone(),
            )?;
            run_once(&scanner, command.full_rescan, shutdown).await
        };
        std::process::exit(code);
    }

    let events = EventBroker::new();
    let scanner = Scanner::from_config(
        &config.scanner,
        store,
        extractor,
        Arc::new(events.clone()),
        shutdown.clone(),
    )?;
    let port = if config.port == 0 { 3000 } else { config.port };
    let bind_addr = format!("0.0.0.0:{}", port);
    let state = AppState {
        config: Arc::new(RwLock::new(config.clone())),
        scanner: Arc::new(scanner),
        events,
        watcher: Arc::new(RwLock::new(None)),
        shutdown: shutdown.clone(),
    };

    if let Some(root) = music_root.filter(|root| root.exists()) {
        if config.scan_on_startup {
            start_scan(&state, false, "startup");
        }
        configure_watcher(&state, root);
    }

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for ctrl-c: {}", err);
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
