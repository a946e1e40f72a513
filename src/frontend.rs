//! 嵌入式静态资源（样式表）服务。

use axum::body::Body as AxumBody;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "assets"]
/// 编译期嵌入的页面资源。
pub struct StaticAssets;

/// `GET /assets/{*path}`：返回嵌入资源。
pub async fn serve_asset(Path(path): Path<String>) -> Result<Response, ApiError> {
    let Some(asset) = StaticAssets::get(&path) else {
        return Err(ApiError::NotFound("not found".into()));
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok((headers, AxumBody::from(asset.data.into_owned())).into_response())
}
