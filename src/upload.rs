//! Multipart upload ingestion.
//!
//! A request is handled in two phases. Every file part is first streamed
//! into its own hidden staging file; a malformed body at any point discards
//! all of them, so a rejected request leaves nothing behind. The staged
//! parts are then committed in request order under collision-free names and
//! video containers that need it are queued for conversion. A failure in
//! either phase for one part never affects its siblings.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart, RawQuery};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Redirect, Response};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::StagedFile;
use crate::config::UPLOAD_FIELD;
use crate::error::ApiError;
use crate::media::{UploadedAsset, classify, needs_transcode};
use crate::naming::{extension_of, sanitize_upload_name};
use crate::storage::Storage;
use crate::transcode::{TranscodeJob, TranscodeQueue, TranscodeState};

#[derive(Debug, Serialize)]
pub struct FailedPart {
    pub name: String,
    pub reason: String,
}

/// Per-request outcome, one entry per file part.
#[derive(Debug, Default, Serialize)]
pub struct UploadReport {
    pub stored: Vec<UploadedAsset>,
    pub failed: Vec<FailedPart>,
    pub skipped: usize,
}

struct PendingPart {
    desired: String,
    staged: StagedFile,
    size: u64,
}

/// `POST /`：存储后重定向回图库（保留查询串）。
pub async fn upload_form(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(queue): Extension<Arc<TranscodeQueue>>,
    RawQuery(query): RawQuery,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart = multipart.map_err(reject)?;
    ingest(&mut multipart, &storage, &queue).await?;
    let location = match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("/?{query}"),
        None => "/".to_string(),
    };
    Ok(Redirect::to(&location).into_response())
}

/// `POST /api/upload`：返回 JSON 上传报告。
pub async fn upload_api(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(queue): Extension<Arc<TranscodeQueue>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadReport>, ApiError> {
    let mut multipart = multipart.map_err(reject)?;
    Ok(JsonResponse(ingest(&mut multipart, &storage, &queue).await?))
}

/// Stages then commits every file part of `multipart`.
pub async fn ingest(
    multipart: &mut Multipart,
    storage: &Storage,
    queue: &TranscodeQueue,
) -> Result<UploadReport, ApiError> {
    let mut report = UploadReport::default();
    let mut pending = Vec::new();

    if let Err(err) = stage_parts(multipart, storage, &mut pending, &mut report).await {
        let discarded = pending.len();
        for part in pending {
            part.staged.discard().await;
        }
        warn!(discarded, "malformed upload body, discarded staged parts");
        return Err(err);
    }

    for part in pending {
        commit_part(part, storage, queue, &mut report).await;
    }

    info!(
        stored = report.stored.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "upload batch finished"
    );
    Ok(report)
}

async fn stage_parts(
    multipart: &mut Multipart,
    storage: &Storage,
    pending: &mut Vec<PendingPart>,
    report: &mut UploadReport,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some(UPLOAD_FIELD) {
            debug!(field = field.name(), "ignoring non-file field");
            continue;
        }
        let Some(desired) = field.file_name().and_then(sanitize_upload_name) else {
            report.skipped += 1;
            continue;
        };

        let mut atomic = match storage.stage(&desired).await {
            Ok(atomic) => atomic,
            Err(err) => {
                warn!(name = desired, error = %err, "failed to create staging file");
                report.failed.push(FailedPart {
                    name: desired,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let mut size: u64 = 0;
        let mut write_error = None;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    atomic.cleanup().await;
                    return Err(malformed(err));
                }
            };
            if let Err(err) = atomic.file_mut().write_all(&chunk).await {
                write_error = Some(err);
                break;
            }
            size += chunk.len() as u64;
        }

        if let Some(err) = write_error {
            atomic.cleanup().await;
            warn!(name = desired, error = %err, "failed to write upload");
            report.failed.push(FailedPart {
                name: desired,
                reason: err.to_string(),
            });
            continue;
        }

        match atomic.finish().await {
            Ok(staged) => {
                debug!(name = desired, bytes = size, "upload part staged");
                pending.push(PendingPart {
                    desired,
                    staged,
                    size,
                });
            }
            Err(err) => {
                warn!(name = desired, error = %err, "failed to flush upload");
                report.failed.push(FailedPart {
                    name: desired,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(())
}

async fn commit_part(
    part: PendingPart,
    storage: &Storage,
    queue: &TranscodeQueue,
    report: &mut UploadReport,
) {
    let stored_name = match storage.commit(part.staged, &part.desired).await {
        Ok(name) => name,
        Err(err) => {
            warn!(name = part.desired, error = %err, "failed to store upload");
            report.failed.push(FailedPart {
                name: part.desired,
                reason: err.to_string(),
            });
            return;
        }
    };
    info!(
        desired = part.desired,
        stored = stored_name,
        bytes = part.size,
        "upload stored"
    );

    let transcode = if needs_transcode(&stored_name) {
        let job = TranscodeJob::for_stored(storage.root_path(), &stored_name);
        if queue.submit(job).await {
            Some(TranscodeState::Queued)
        } else {
            Some(TranscodeState::Failed)
        }
    } else {
        None
    };

    report.stored.push(UploadedAsset {
        extension: extension_of(&stored_name),
        media_kind: classify(&stored_name),
        url: storage.public_url(&stored_name),
        size: Some(part.size),
        modified: None,
        transcode,
        stored_name,
    });
}

fn reject(rejection: MultipartRejection) -> ApiError {
    ApiError::BadRequest(format!("expected multipart/form-data: {}", rejection.body_text()))
}

fn malformed(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}
