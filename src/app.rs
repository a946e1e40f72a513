//! Router assembly: routes, layers and shared state.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::gallery::GalleryConfig;
use crate::http::{add_security_headers, build_cors_layer, client_ip};
use crate::storage::{Storage, encode_path_segment};
use crate::transcode::{TranscodeQueue, TranscodeTracker};
use crate::{files, frontend, gallery, upload, version};

/// Top-level segments the file route must not shadow.
pub const RESERVED_PREFIXES: &[&str] = &["api", "assets"];

/// Shared state handed to every handler, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub tracker: Arc<TranscodeTracker>,
    pub queue: Arc<TranscodeQueue>,
    pub gallery: Arc<GalleryConfig>,
    /// Request body limit in bytes, 0 disables it.
    pub upload_max_size: u64,
    pub cors_origins: Option<String>,
}

pub fn build_router(ctx: AppContext) -> Router {
    let file_route = format!(
        "/{}/{{name}}",
        encode_path_segment(&ctx.storage.public_prefix())
    );
    let body_limit = if ctx.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(ctx.upload_max_size).unwrap_or(usize::MAX))
    };

    let mut app = Router::new()
        .route(
            "/",
            get(gallery::show_gallery).post(upload::upload_form),
        )
        .route("/api/upload", post(upload::upload_api))
        .route("/api/media", get(gallery::list_media))
        .route("/api/version", get(version::get_version_info))
        .route("/assets/{*path}", get(frontend::serve_asset))
        .route(&file_route, get(files::serve_file))
        .layer(body_limit)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = %client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(ctx.storage))
        .layer(Extension(ctx.tracker))
        .layer(Extension(ctx.queue))
        .layer(Extension(ctx.gallery));

    if let Some(cors_layer) = build_cors_layer(ctx.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{StatusCode, header};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::config::UnclassifiedPolicy;
    use crate::transcode::{TranscodeState, Transcoder};

    const BOUNDARY: &str = "----axo-gallery-test";

    struct TestApp {
        _temp: tempfile::TempDir,
        router: Router,
        storage: Arc<Storage>,
        tracker: Arc<TranscodeTracker>,
    }

    fn make_app(password: Option<&str>) -> TestApp {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("UploadsFromPhone");
        std::fs::create_dir_all(&root).expect("create storage root");
        let storage = Arc::new(Storage::new(root, Duration::from_secs(5)));
        let tracker = Arc::new(TranscodeTracker::new());
        let queue = Arc::new(TranscodeQueue::start(
            Arc::new(Transcoder::new("/nonexistent/ffmpeg-for-tests")),
            tracker.clone(),
            2,
            16,
        ));
        let router = build_router(AppContext {
            storage: storage.clone(),
            tracker: tracker.clone(),
            queue,
            gallery: Arc::new(GalleryConfig {
                password: password.map(str::to_string),
                unclassified: UnclassifiedPolicy::Hide,
            }),
            upload_max_size: 1024 * 1024,
            cors_origins: None,
        });
        TestApp {
            _temp: temp,
            router,
            storage,
            tracker,
        }
    }

    fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, content) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, files: &[(&str, &[u8])]) -> Request<AxumBody> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(multipart_body(files)))
            .expect("request")
    }

    fn get_request(uri: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(uri)
            .body(AxumBody::empty())
            .expect("request")
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    async fn stored_names(response: axum::response::Response) -> Vec<String> {
        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("json report");
        report["stored"]
            .as_array()
            .expect("stored array")
            .iter()
            .map(|asset| asset["stored_name"].as_str().expect("name").to_string())
            .collect()
    }

    #[tokio::test]
    async fn non_multipart_post_is_rejected() {
        let app = make_app(None);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from("{}"))
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.storage.scan().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn same_name_twice_keeps_both_and_round_trips() {
        let app = make_app(None);
        for content in [b"first".as_slice(), b"second".as_slice()] {
            let response = app
                .router
                .clone()
                .oneshot(upload_request("/", &[("x.jpg", content)]))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(
                response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
                Some("/")
            );
        }

        for (name, expected) in [("x.jpg", b"first".as_slice()), ("x_1.jpg", b"second".as_slice())] {
            let response = app
                .router
                .clone()
                .oneshot(get_request(&format!("/UploadsFromPhone/{name}")))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
                Some("image/jpeg")
            );
            assert_eq!(body_bytes(response).await, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_uploads_of_same_clip_are_distinct() {
        let app = make_app(None);
        let (a, b) = tokio::join!(
            app.router
                .clone()
                .oneshot(upload_request("/api/upload", &[("clip.mov", b"clip a")])),
            app.router
                .clone()
                .oneshot(upload_request("/api/upload", &[("clip.mov", b"clip b")])),
        );
        let mut names = stored_names(a.expect("response a")).await;
        names.extend(stored_names(b.expect("response b")).await);
        names.sort();
        assert_eq!(names, ["clip.mov", "clip_1.mov"]);

        let mut contents = Vec::new();
        for name in &names {
            contents.push(std::fs::read(app.storage.root_path().join(name)).expect("read"));
        }
        contents.sort();
        assert_eq!(contents, [b"clip a".to_vec(), b"clip b".to_vec()]);
    }

    #[tokio::test]
    async fn missing_encoder_keeps_original_video_fetchable() {
        let app = make_app(None);
        let response = app
            .router
            .clone()
            .oneshot(upload_request("/api/upload", &[("clip.mov", b"raw mov bytes")]))
            .await
            .expect("response");
        assert_eq!(stored_names(response).await, ["clip.mov"]);

        let mut state = app.tracker.get("clip.mov").await;
        for _ in 0..200 {
            if state == Some(TranscodeState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            state = app.tracker.get("clip.mov").await;
        }
        assert_eq!(state, Some(TranscodeState::Failed));

        let response = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/clip.mov"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"raw mov bytes");

        let page = app
            .router
            .clone()
            .oneshot(get_request("/"))
            .await
            .expect("response");
        let page = String::from_utf8(body_bytes(page).await).expect("utf8");
        assert!(page.contains("not converted"));
    }

    #[tokio::test]
    async fn unrecognized_extension_is_stored_but_hidden() {
        let app = make_app(None);
        let response = app
            .router
            .clone()
            .oneshot(upload_request(
                "/",
                &[("data.xyz", b"payload"), ("blob.qqqz", b"opaque"), ("pic.png", b"png")],
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let fetched = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/data.xyz"))
            .await
            .expect("response");
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(body_bytes(fetched).await, b"payload");

        let fetched = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/blob.qqqz"))
            .await
            .expect("response");
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(
            fetched.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/octet-stream")
        );
        assert_eq!(body_bytes(fetched).await, b"opaque");

        let page = app
            .router
            .clone()
            .oneshot(get_request("/"))
            .await
            .expect("response");
        assert_eq!(page.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(page).await).expect("utf8");
        assert!(page.contains("/UploadsFromPhone/pic.png"));
        assert!(!page.contains("data.xyz"));
        assert!(!page.contains("blob.qqqz"));

        let listing = app
            .router
            .clone()
            .oneshot(get_request("/api/media"))
            .await
            .expect("response");
        let listing: serde_json::Value =
            serde_json::from_slice(&body_bytes(listing).await).expect("json");
        assert_eq!(listing.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn empty_gallery_has_placeholder() {
        let app = make_app(None);
        let page = app
            .router
            .clone()
            .oneshot(get_request("/"))
            .await
            .expect("response");
        assert_eq!(page.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(page).await).expect("utf8");
        assert!(page.contains("No uploads yet."));
    }

    #[tokio::test]
    async fn missing_and_invalid_files() {
        let app = make_app(None);
        let response = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/missing.jpg"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/..%2Fsecret.txt"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn range_requests_return_partial_content() {
        let app = make_app(None);
        std::fs::write(app.storage.root_path().join("clip.mp4"), b"0123456789").expect("write");
        let request = Request::builder()
            .uri("/UploadsFromPhone/clip.mp4")
            .header(header::RANGE, "bytes=2-5")
            .body(AxumBody::empty())
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()),
            Some("bytes 2-5/10")
        );
        assert_eq!(body_bytes(response).await, b"2345");
    }

    #[tokio::test]
    async fn password_gates_only_the_listing() {
        let app = make_app(Some("pw"));
        std::fs::write(app.storage.root_path().join("a.jpg"), b"a").expect("write");

        let denied = app
            .router
            .clone()
            .oneshot(get_request("/"))
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .router
            .clone()
            .oneshot(get_request("/?pass=pw"))
            .await
            .expect("response");
        assert_eq!(allowed.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(allowed).await).expect("utf8");
        assert!(page.contains(r#"action="/?pass=pw""#));

        let file = app
            .router
            .clone()
            .oneshot(get_request("/UploadsFromPhone/a.jpg"))
            .await
            .expect("response");
        assert_eq!(file.status(), StatusCode::OK);

        let response = app
            .router
            .clone()
            .oneshot(upload_request("/?pass=pw", &[("b.jpg", b"b")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()),
            Some("/?pass=pw")
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = make_app(None);
        let big = vec![b'x'; 2 * 1024 * 1024];
        let response = app
            .router
            .clone()
            .oneshot(upload_request("/api/upload", &[("big.jpg", &big)]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(app.storage.scan().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn security_headers_are_set() {
        let app = make_app(None);
        let response = app
            .router
            .clone()
            .oneshot(get_request("/api/version"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).and_then(|v| v.to_str().ok()),
            Some("nosniff")
        );
    }
}
