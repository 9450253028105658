//! site-storage server binary.
//!
//! Wires together the sandboxed path resolver, resumable chunked uploads with
//! background merge workers, folder/file handlers, and the staging garbage
//! collector. The main entry point builds the Axum router, optionally loads
//! TLS, and starts the HTTP/HTTPS listeners.

mod atomic;
mod background;
mod config;
mod error;
mod files;
mod gc;
mod http;
mod identity;
mod locking;
mod logging;
mod merge;
mod paths;
mod session;
mod storage;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::background::spawn_background_tasks;
use crate::config::{Args, DEFAULT_LOCK_WAIT_TIMEOUT_SECS};
use crate::http::{build_cors_layer, make_request_span};
use crate::identity::IdentityConfig;
use crate::locking::LockManager;
use crate::merge::{MergeConfig, spawn_merge_workers};
use crate::paths::PathResolver;
use crate::storage::Storage;
use crate::upload::{ChunkReceiver, UploadConfig};

shadow!(build);

/// Starts the storage server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let resolver = Arc::new(
        PathResolver::bootstrap(Path::new(&args.storage_dir))
            .await
            .map_err(|err| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("storage root {:?} unusable: {err}", args.storage_dir),
                )
            })?,
    );
    info!(root = ?resolver.root_path(), "storage root ready");

    let locks = Arc::new(LockManager::new(Duration::from_secs(
        DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
    )));
    let upload_config = Arc::new(UploadConfig {
        max_chunk_size: args.max_chunk_size,
        max_chunks: args.max_chunks,
        retention: Duration::from_secs(args.staging_retention_secs),
        gc_interval: Duration::from_secs(args.gc_interval_secs),
    });
    let merge_queue = spawn_merge_workers(
        MergeConfig {
            workers: args.merge_workers,
            queue_capacity: args.merge_queue_capacity,
            max_attempts: args.merge_max_attempts,
            backoff: Duration::from_millis(args.merge_backoff_ms),
        },
        locks.clone(),
    );
    let receiver = Arc::new(ChunkReceiver::new(
        resolver.clone(),
        upload_config.clone(),
        locks.clone(),
        merge_queue.clone(),
    ));
    let storage = Arc::new(Storage::new(resolver.clone()));
    let identity_config = Arc::new(IdentityConfig {
        shared_secret: args.identity_secret.clone(),
        allow_anonymous: args.allow_anonymous,
    });
    spawn_background_tasks(
        resolver.clone(),
        upload_config,
        merge_queue,
        locks.clone(),
    );

    let mut app = Router::new()
        .route(
            "/api/storage/file/{*path}",
            post(upload::upload_chunk)
                .put(files::write_file)
                .get(files::download_file)
                .patch(files::move_file)
                .delete(files::delete_file)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/api/storage/folder", get(files::list_root))
        .route(
            "/api/storage/folder/{*path}",
            get(files::list_folder)
                .post(files::create_folder)
                .patch(files::rename_folder)
                .delete(files::delete_folder),
        )
        .route(
            "/api/storage/upload/{file_id}",
            get(upload::upload_status).delete(upload::abort_upload),
        )
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(identity::identity_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_request_span::<axum::body::Body>)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(receiver))
        .layer(Extension(locks))
        .layer(Extension(identity_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::load_rustls_config(
        args.tls_cert.as_deref().map(Path::new),
        args.tls_key.as_deref().map(Path::new),
    )
    .await?;
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    match tls_config {
        Some(tls_config) => {
            let https_addr = SocketAddr::new(host, args.https_port);
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
