//! AxoGallery server binary.
//!
//! Phones on the same network open the page, pick photos or videos and
//! upload them into a single storage directory. The page doubles as a
//! gallery of everything stored so far; QuickTime and WebM clips are
//! converted to MP4 in the background so every browser can play them.

mod app;
mod atomic;
mod background;
mod config;
mod error;
mod files;
mod frontend;
mod gallery;
mod http;
mod locking;
mod logging;
mod media;
mod naming;
mod net;
mod storage;
mod transcode;
mod upload;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::app::{AppContext, RESERVED_PREFIXES, build_router};
use crate::background::spawn_background_tasks;
use crate::config::{Args, DEFAULT_LOCK_WAIT_TIMEOUT_SECS};
use crate::gallery::GalleryConfig;
use crate::storage::Storage;
use crate::transcode::{TranscodeQueue, TranscodeTracker, Transcoder};

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(
        args.resolve_storage_dir(),
        Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
    ));
    storage.ensure_root().await?;

    let prefix = storage.public_prefix();
    if RESERVED_PREFIXES.contains(&prefix.as_str()) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("storage directory name `{prefix}` collides with a server route"),
        ));
    }

    let tracker = Arc::new(TranscodeTracker::new());
    let queue = Arc::new(TranscodeQueue::start(
        Arc::new(Transcoder::new(args.ffmpeg_bin.clone())),
        tracker.clone(),
        args.transcode_workers,
        args.transcode_queue_size,
    ));
    let gallery = Arc::new(GalleryConfig {
        password: args.password.clone().filter(|pass| !pass.is_empty()),
        unclassified: args.unclassified,
    });
    if gallery.password.is_none() {
        warn!("no password set, the gallery is visible to everyone on the network");
    }

    let app = build_router(AppContext {
        storage: storage.clone(),
        tracker: tracker.clone(),
        queue,
        gallery,
        upload_max_size: args.upload_max_size,
        cors_origins: args.cors_origins.clone(),
    });

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);
    info!(
        "📱 Open http://{}:{} on your phone",
        net::advertised_ip(host),
        args.port
    );
    info!("📂 Saving uploads to {}", storage.root_path().display());

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        storage,
        tracker,
        Duration::from_secs(args.staging_ttl_secs),
    );
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
