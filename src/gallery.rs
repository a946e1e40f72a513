//! Gallery page and media listing, rebuilt from a fresh directory scan on
//! every request.

use axum::extract::{Extension, Query};
use axum::response::{Html, Json as JsonResponse};
use maud::{DOCTYPE, Markup, html};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::{UPLOAD_FIELD, UnclassifiedPolicy};
use crate::error::ApiError;
use crate::media::{MediaKind, UploadedAsset, classify, stored_extension};
use crate::storage::{Storage, encode_path_segment};
use crate::transcode::{TranscodeState, TranscodeTracker};

const PAGE_TITLE: &str = "Phone Media Upload";

/// Immutable gallery settings.
#[derive(Debug, Clone, Default)]
pub struct GalleryConfig {
    pub password: Option<String>,
    pub unclassified: UnclassifiedPolicy,
}

impl GalleryConfig {
    fn allows(&self, supplied: Option<&str>) -> bool {
        match self.password.as_deref() {
            Some(expected) => supplied == Some(expected),
            None => true,
        }
    }
}

#[derive(Deserialize)]
pub struct GalleryQuery {
    pass: Option<String>,
}

/// Every stored asset, newest-looking first (reverse lexicographic by name).
pub async fn index(
    storage: &Storage,
    tracker: &TranscodeTracker,
) -> Result<Vec<UploadedAsset>, ApiError> {
    let mut entries = storage.scan().await?;
    entries.sort_by(|a, b| b.name.cmp(&a.name));
    let states = tracker.snapshot().await;

    let mut assets = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = storage.root_path().join(&entry.name);
        assets.push(UploadedAsset {
            extension: stored_extension(&path, &entry.name).await,
            media_kind: classify(&entry.name),
            url: storage.public_url(&entry.name),
            size: Some(entry.size),
            modified: entry.modified,
            transcode: states.get(&entry.name).copied(),
            stored_name: entry.name,
        });
    }
    Ok(assets)
}

/// Drops what the gallery does not render under `policy`.
pub fn visible(assets: Vec<UploadedAsset>, policy: UnclassifiedPolicy) -> Vec<UploadedAsset> {
    match policy {
        UnclassifiedPolicy::List => assets,
        UnclassifiedPolicy::Hide => assets
            .into_iter()
            .filter(|asset| asset.media_kind != MediaKind::Unclassified)
            .collect(),
    }
}

/// `GET /`: upload form plus gallery.
pub async fn show_gallery(
    Query(query): Query<GalleryQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(tracker): Extension<Arc<TranscodeTracker>>,
    Extension(config): Extension<Arc<GalleryConfig>>,
) -> Result<Html<String>, ApiError> {
    if !config.allows(query.pass.as_deref()) {
        return Err(ApiError::Unauthorized);
    }
    let assets = visible(index(&storage, &tracker).await?, config.unclassified);
    debug!(count = assets.len(), "render gallery");

    let form_action = match (&config.password, &query.pass) {
        (Some(_), Some(pass)) => format!("/?pass={}", encode_path_segment(pass)),
        _ => "/".to_string(),
    };
    Ok(Html(render_page(&form_action, &assets).into_string()))
}

/// `GET /api/media`: every stored asset as JSON, unclassified included.
pub async fn list_media(
    Query(query): Query<GalleryQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(tracker): Extension<Arc<TranscodeTracker>>,
    Extension(config): Extension<Arc<GalleryConfig>>,
) -> Result<JsonResponse<Vec<UploadedAsset>>, ApiError> {
    if !config.allows(query.pass.as_deref()) {
        return Err(ApiError::Unauthorized);
    }
    Ok(JsonResponse(index(&storage, &tracker).await?))
}

pub fn render_page(form_action: &str, assets: &[UploadedAsset]) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (PAGE_TITLE) }
                link rel="stylesheet" href="/assets/gallery.css";
            }
            body {
                h2 { "📤 Upload from Phone" }
                form action=(form_action) enctype="multipart/form-data" method="post" {
                    input type="file" name=(UPLOAD_FIELD) accept="image/*,video/*" multiple required;
                    br;
                    input type="submit" value="Upload";
                }
                div.gallery {
                    @if assets.is_empty() {
                        p.empty { "No uploads yet." }
                    }
                    @for asset in assets {
                        (render_asset(asset))
                    }
                }
            }
        }
    }
}

fn render_asset(asset: &UploadedAsset) -> Markup {
    html! {
        @match asset.media_kind {
            MediaKind::Image => {
                img src=(asset.url) alt=(asset.stored_name) loading="lazy";
            }
            MediaKind::Video => {
                figure.video {
                    video src=(asset.url) controls preload="metadata" {}
                    @if let Some(state) = asset.transcode {
                        figcaption class=(state_class(state)) { (state_label(state)) }
                    }
                }
            }
            MediaKind::Unclassified => {
                a.file href=(asset.url) download { (asset.stored_name) }
            }
        }
    }
}

fn state_label(state: TranscodeState) -> &'static str {
    match state {
        TranscodeState::Queued | TranscodeState::Running => "converting…",
        TranscodeState::Failed => "not converted",
    }
}

fn state_class(state: TranscodeState) -> &'static str {
    match state {
        TranscodeState::Queued | TranscodeState::Running => "badge converting",
        TranscodeState::Failed => "badge unconverted",
    }
}
