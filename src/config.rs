//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR_NAME: &str = "UploadsFromPhone";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_TRANSCODE_WORKERS: usize = 2;
pub const DEFAULT_TRANSCODE_QUEUE_SIZE: usize = 64;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
/// Multipart field name carrying uploaded files.
pub const UPLOAD_FIELD: &str = "file";
/// Upper bound on collision suffixes tried for a single desired name.
pub const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// What the gallery does with files it cannot classify as image or video.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UnclassifiedPolicy {
    /// Leave them out of the gallery (still reachable by direct URL).
    #[default]
    Hide,
    /// Render them as plain download links.
    List,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-gallery", version = VERSION_INFO, about = "AxoGallery phone upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        help = "Storage directory for uploads [default: ~/UploadsFromPhone]"
    )]
    pub storage_dir: Option<PathBuf>,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "AXO_PASSWORD", help = "Password required to view the gallery")]
    pub password: Option<String>,
    #[arg(
        long,
        env = "AXO_FFMPEG_BIN",
        default_value = DEFAULT_FFMPEG_BIN,
        help = "Encoder binary used for video conversion"
    )]
    pub ffmpeg_bin: String,
    #[arg(
        long,
        env = "AXO_TRANSCODE_WORKERS",
        default_value_t = DEFAULT_TRANSCODE_WORKERS,
        help = "Max concurrent video conversions"
    )]
    pub transcode_workers: usize,
    #[arg(
        long,
        env = "AXO_TRANSCODE_QUEUE_SIZE",
        default_value_t = DEFAULT_TRANSCODE_QUEUE_SIZE,
        help = "Max pending video conversions"
    )]
    pub transcode_queue_size: usize,
    #[arg(
        long,
        env = "AXO_UNCLASSIFIED",
        value_enum,
        default_value_t = UnclassifiedPolicy::Hide,
        help = "Gallery policy for non-media files"
    )]
    pub unclassified: UnclassifiedPolicy,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max request body size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age after which orphaned staging files are removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    /// Storage directory, falling back to `~/UploadsFromPhone`.
    pub fn resolve_storage_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage_dir {
            return dir.clone();
        }
        home_dir()
            .map(|home| home.join(DEFAULT_STORAGE_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR_NAME))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
