//! Background conversion of browser-hostile video containers to MP4.
//!
//! Jobs are queued on a bounded channel and executed by a worker pool
//! limited by a semaphore. A job converts the stored file with `ffmpeg`
//! into a hidden sibling and renames the result over the original, so the
//! asset keeps its public URL while its bytes become H.264/AAC MP4. A
//! failed conversion leaves the original untouched.

use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::atomic::{STAGING_NAME_MAX_BYTES, replace_file};
use crate::naming::truncate_on_char_boundary;

const STDERR_TAIL_BYTES: usize = 2048;

/// Conversion progress of a stored asset. Absent once converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeState {
    Queued,
    Running,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub stored_name: String,
    pub source_path: PathBuf,
    /// Always the asset's stored path.
    pub target_path: PathBuf,
}

impl TranscodeJob {
    pub fn for_stored(root: &Path, stored_name: &str) -> Self {
        let path = root.join(stored_name);
        Self {
            stored_name: stored_name.to_string(),
            source_path: path.clone(),
            target_path: path,
        }
    }
}

#[derive(Debug)]
pub enum TranscodeError {
    Spawn(io::Error),
    Exit { code: Option<i32>, stderr: String },
    EmptyOutput,
    Io(io::Error),
}

impl fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscodeError::Spawn(err) => write!(f, "failed to start encoder: {err}"),
            TranscodeError::Exit { code, stderr } => match code {
                Some(code) => write!(f, "encoder exited with status {code}: {stderr}"),
                None => write!(f, "encoder terminated by signal: {stderr}"),
            },
            TranscodeError::EmptyOutput => f.write_str("encoder produced no output"),
            TranscodeError::Io(err) => write!(f, "failed to replace original: {err}"),
        }
    }
}

/// Runs the external encoder with a fixed argument template.
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_bin: String,
}

impl Transcoder {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    /// Hidden `.mp4` sibling of `source` receiving the encoder output.
    pub fn output_path_for(source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".into());
        let stem = truncate_on_char_boundary(&stem, STAGING_NAME_MAX_BYTES);
        let name = format!(".{stem}.tmp.{}.mp4", Uuid::new_v4());
        match source.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn build_args(input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-vcodec".into(),
            "libx264".into(),
            "-acodec".into(),
            "aac".into(),
            "-strict".into(),
            "-2".into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ]
    }

    /// Converts `job.source_path` and moves the result over `job.target_path`.
    pub async fn run(&self, job: &TranscodeJob) -> Result<(), TranscodeError> {
        let output_path = Self::output_path_for(&job.source_path);
        let output = Command::new(&self.ffmpeg_bin)
            .args(Self::build_args(&job.source_path, &output_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(TranscodeError::Spawn)?;

        if !output.status.success() {
            let _ = fs::remove_file(&output_path).await;
            return Err(TranscodeError::Exit {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        match fs::metadata(&output_path).await {
            Ok(metadata) if metadata.len() > 0 => {}
            _ => {
                let _ = fs::remove_file(&output_path).await;
                return Err(TranscodeError::EmptyOutput);
            }
        }

        replace_file(&output_path, &job.target_path)
            .await
            .map_err(TranscodeError::Io)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL_BYTES);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// In-memory conversion state per stored name, read by the gallery.
#[derive(Debug, Default)]
pub struct TranscodeTracker {
    states: Mutex<HashMap<String, TranscodeState>>,
}

impl TranscodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, name: &str, state: TranscodeState) {
        self.states.lock().await.insert(name.to_string(), state);
    }

    pub async fn clear(&self, name: &str) {
        self.states.lock().await.remove(name);
    }

    #[cfg(test)]
    pub async fn get(&self, name: &str) -> Option<TranscodeState> {
        self.states.lock().await.get(name).copied()
    }

    /// Drops states of files no longer present under `root`, returning how many.
    pub async fn prune_missing(&self, root: &Path) -> usize {
        let names: Vec<String> = self.states.lock().await.keys().cloned().collect();
        let mut missing = Vec::new();
        for name in names {
            if !fs::try_exists(root.join(&name)).await.unwrap_or(true) {
                missing.push(name);
            }
        }
        let mut states = self.states.lock().await;
        for name in &missing {
            states.remove(name);
        }
        missing.len()
    }

    pub async fn snapshot(&self) -> HashMap<String, TranscodeState> {
        self.states.lock().await.clone()
    }
}

/// Bounded job queue in front of the transcode worker pool.
pub struct TranscodeQueue {
    tx: mpsc::Sender<TranscodeJob>,
    tracker: Arc<TranscodeTracker>,
}

impl TranscodeQueue {
    /// Spawns the worker pool and returns its submission handle.
    pub fn start(
        transcoder: Arc<Transcoder>,
        tracker: Arc<TranscodeTracker>,
        max_concurrent: usize,
        queue_size: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let queue_size = queue_size.max(1);
        let (tx, rx) = mpsc::channel(queue_size);

        let worker_tracker = tracker.clone();
        tokio::spawn(async move {
            worker_pool(rx, transcoder, worker_tracker, max_concurrent).await;
        });

        info!(max_concurrent, queue_size, "transcode queue started");
        Self { tx, tracker }
    }

    /// Enqueues a job without waiting. A full queue drops the job and
    /// marks the asset failed; its original bytes stay stored.
    pub async fn submit(&self, job: TranscodeJob) -> bool {
        let name = job.stored_name.clone();
        self.tracker.set(&name, TranscodeState::Queued).await;
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(name, "transcode job queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(name, "transcode queue full, keeping original");
                self.tracker.set(&name, TranscodeState::Failed).await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(name, "transcode workers stopped, keeping original");
                self.tracker.set(&name, TranscodeState::Failed).await;
                false
            }
        }
    }
}

async fn worker_pool(
    mut rx: mpsc::Receiver<TranscodeJob>,
    transcoder: Arc<Transcoder>,
    tracker: Arc<TranscodeTracker>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let transcoder = transcoder.clone();
        let tracker = tracker.clone();

        tokio::spawn(async move {
            let _permit = permit;
            process_job(job, &transcoder, &tracker).await;
        });
    }
}

async fn process_job(job: TranscodeJob, transcoder: &Transcoder, tracker: &TranscodeTracker) {
    let start = Instant::now();
    tracker.set(&job.stored_name, TranscodeState::Running).await;
    info!(name = job.stored_name, "starting video conversion");

    match transcoder.run(&job).await {
        Ok(()) => {
            tracker.clear(&job.stored_name).await;
            info!(
                name = job.stored_name,
                duration_ms = start.elapsed().as_millis() as u64,
                "video converted to mp4"
            );
        }
        Err(err) => {
            tracker.set(&job.stored_name, TranscodeState::Failed).await;
            warn!(
                name = job.stored_name,
                path = ?job.source_path,
                duration_ms = start.elapsed().as_millis() as u64,
                error = %err,
                "video conversion failed, original kept"
            );
        }
    }
}
