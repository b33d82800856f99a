use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{io::AsyncReadExt, net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use models::event::EventEnvelope;
use services::{
    convert_service::{ConvertOutcome, ConvertService},
    storage::{StorageKind, build_object_store},
    transcoder::FfmpegTranscoder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + one-shot event flag ---
    let (cfg, event) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        storage = %cfg.storage,
        ffmpeg = %cfg.ffmpeg_path.display(),
        "Starting audio-convert"
    );

    // --- Ensure storage directory exists ---
    if cfg.storage == StorageKind::Local && !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir.display());
    }

    // --- Initialize core service ---
    let store = build_object_store(&cfg)?;
    let transcoder = Arc::new(FfmpegTranscoder::new(cfg.ffmpeg_path.clone()));
    let service = ConvertService::new(store, transcoder);

    // --- Handle one-shot mode ---
    if let Some(path) = event {
        return run_once(&service, &path).await;
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Handle a single event read from a file (or stdin for `-`) and exit.
async fn run_once(service: &ConvertService, path: &Path) -> Result<()> {
    let raw = if path == Path::new("-") {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading event from {}", path.display()))?
    };

    let envelope: EventEnvelope = serde_json::from_slice(&raw).context("parsing upload event")?;
    let (event, _) = envelope.into_parts();

    match service.handle(&event).await? {
        ConvertOutcome::Converted(object) => tracing::info!(
            "Converted {}/{} into {} ({} bytes)",
            event.bucket,
            event.name,
            object.name,
            object.size_bytes
        ),
        ConvertOutcome::Skipped(reason) => {
            tracing::info!(?reason, "Skipped {}/{}", event.bucket, event.name)
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, starting graceful shutdown"),
        _ = terminate => tracing::info!("SIGTERM received, starting graceful shutdown"),
    }
}
