//! Range-capable static file server over the export tree.
//!
//! Media playback in the front-end depends on correct single-range
//! semantics: a seekable player issues `Range: bytes=a-b` and expects an
//! exact 206 with `Content-Range` and the requested slice. Everything
//! beneath the configured root is served; only `GET` is routed.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::config::SERVE_BUFFER_SIZE;

/// Shared server state: the export root every path resolves against.
struct FileServer {
    root: PathBuf,
}

/// Builds the router serving files beneath `root`.
pub fn router(root: PathBuf) -> Router {
    Router::new()
        .fallback(get(serve_file))
        .with_state(Arc::new(FileServer { root }))
}

/// Binds and serves until the process ends.
pub async fn serve(root: PathBuf, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(addr = %listener.local_addr()?, root = %root.display(), "file server listening");
    axum::serve(listener, router(root)).await
}

async fn serve_file(
    State(server): State<Arc<FileServer>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let requested = server.root.join(uri.path().trim_start_matches('/'));

    let mut file = match tokio::fs::File::open(&requested).await {
        Ok(file) => file,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Could not load file {}", requested.display()),
            )
                .into_response();
        }
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Could not retrieve file info")
                .into_response();
        }
    };

    let content_type = content_type_for(&requested);

    let Some(range) = headers.get(header::RANGE) else {
        // Whole file.
        let stream = ReaderStream::with_capacity(file, SERVE_BUFFER_SIZE);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::from_stream(stream))
            .unwrap();
    };

    let Some((start, end)) = range.to_str().ok().and_then(|raw| parse_range(raw, size)) else {
        return (StatusCode::RANGE_NOT_SATISFIABLE, "Requested range not satisfiable")
            .into_response();
    };

    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Could not seek file").into_response();
    }
    let stream = ReaderStream::with_capacity(file.take(end - start + 1), SERVE_BUFFER_SIZE);

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
        .header(header::CONTENT_LENGTH, end - start + 1)
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Parses a single-range `bytes=a-b` header against a file of `size`.
///
/// `a` is a required decimal; `b` defaults to the last byte. Suffix
/// ranges and range lists are unsatisfiable, as is `a > b` or `b`
/// beyond the file.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = match end.trim() {
        "" => size.checked_sub(1)?,
        explicit => explicit.parse().ok()?,
    };

    (start <= end && end < size).then_some((start, end))
}

/// Extension-based content types, with the `.mp3` override the media
/// player depends on; everything unknown is an octet stream.
fn content_type_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "html" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
