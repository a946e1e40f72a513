//! Media classification by file name and container sniffing.

use serde::Serialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::naming::extension_of;
use crate::transcode::TranscodeState;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov"];
/// Containers browsers do not reliably play inline.
pub const TRANSCODE_EXTENSIONS: &[&str] = &["mov", "webm"];

/// Header bytes handed to `infer` when sniffing a stored video.
const SNIFF_LEN: usize = 262;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Unclassified,
}

/// Classifies a stored name by its extension, case-insensitively.
pub fn classify(name: &str) -> MediaKind {
    let ext = extension_of(name);
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Image
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        MediaKind::Video
    } else {
        MediaKind::Unclassified
    }
}

/// Whether a stored name is handed to the transcode worker.
pub fn needs_transcode(name: &str) -> bool {
    TRANSCODE_EXTENSIONS.contains(&extension_of(name).as_str())
}

/// MIME type of the video container in `header`, if `infer` recognizes one.
pub fn sniff_video_mime(header: &[u8]) -> Option<&'static str> {
    infer::get(header)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Video)
        .map(|kind| kind.mime_type())
}

fn container_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/webm" | "video/x-matroska" => Some("webm"),
        _ => None,
    }
}

/// Sniffed video MIME type of a stored `.mov`/`.webm` file.
///
/// `None` for names that are never converted or bytes `infer` does not know.
pub async fn stored_video_mime(path: &Path, name: &str) -> Option<&'static str> {
    if !needs_transcode(name) {
        return None;
    }
    let mut header = [0u8; SNIFF_LEN];
    let read = match File::open(path).await {
        Ok(mut file) => read_prefix(&mut file, &mut header).await,
        Err(_) => 0,
    };
    sniff_video_mime(&header[..read])
}

/// Extension describing the bytes actually stored under `name`.
///
/// Differs from the name's extension once a `.mov`/`.webm` upload has been
/// converted in place to MP4.
pub async fn stored_extension(path: &Path, name: &str) -> String {
    stored_video_mime(path, name)
        .await
        .and_then(container_extension)
        .map(str::to_string)
        .unwrap_or_else(|| extension_of(name))
}

async fn read_prefix(file: &mut File, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}

/// A stored media file as seen by viewers.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedAsset {
    pub stored_name: String,
    pub extension: String,
    pub media_kind: MediaKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode: Option<TranscodeState>,
}
