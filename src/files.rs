//! 已存储文件的直接下载，支持 Range 请求与缓存相关头。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::media::stored_video_mime;
use crate::storage::Storage;

/// `GET /<upload-dir>/<name>`：返回文件原始字节。
pub async fn serve_file(
    Path(name): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_entry(&name).await?;
    let metadata = fs::metadata(&target).await?;
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let content_type = content_type_for(&target, &name).await;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = modified.map(fmt_http_date) {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value)
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(&target).await?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(name, start, end, length, "range request accepted");
        file.seek(SeekFrom::Start(start)).await?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(name, size = file_size, content_type, "serve file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 按扩展名推断 MIME；可转码容器优先按实际字节判断。
async fn content_type_for(path: &std::path::Path, name: &str) -> String {
    if let Some(mime) = stored_video_mime(path, name).await {
        return mime.to_string();
    }
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Ok(None);
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        // 多段请求退化为完整响应。
        return Ok(None);
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let parse = |part: &str| {
        part.trim()
            .parse::<u64>()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))
    };

    let (start, end) = if start_part.trim().is_empty() {
        let suffix = parse(end_part)?;
        if suffix == 0 {
            return Ok(None);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start = parse(start_part)?;
        let end = if end_part.trim().is_empty() {
            file_size - 1
        } else {
            parse(end_part)?.min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
