//! Site serving.
//!
//! Every request goes through the same pipeline: resolve the image, admit
//! it, then either serve the file from the cache entry or report that the
//! image is still being fetched.

use std::path::Path;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HOST, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

use super::error::ApiError;
use crate::image::ImageReference;
use crate::scheduler::Availability;
use crate::state::AppState;

/// Body of the response sent while an image is not cached yet.
pub const PROCESSING: &str = "Processing";

pub async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    match render(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(
                path = %path,
                status = err.status.as_u16(),
                error = %err.message,
                "Request failed"
            );
            err.into_response()
        }
    }
}

async fn render(state: &AppState, request: Request) -> Result<Response, ApiError> {
    let host = request_host(&request);
    let resolution = state
        .resolver()
        .resolve(host.as_deref(), request.uri().path())
        .await;
    debug!(
        image = %resolution.image,
        strategy = ?resolution.strategy,
        "Resolved request"
    );

    let reference = ImageReference::parse(&resolution.image)?;
    let admitted = state.admission().admit(&reference).await?;

    match state
        .scheduler()
        .request(&admitted.pinned, &admitted.key)
        .await?
    {
        Availability::Ready(dir) => serve_file(&dir, &resolution.strip_prefix, request).await,
        Availability::Scheduled | Availability::InProgress => {
            Ok((StatusCode::ACCEPTED, Html(PROCESSING)).into_response())
        }
    }
}

/// Serve `request` from `dir` after removing `strip_prefix` from its path.
async fn serve_file(dir: &Path, strip_prefix: &str, request: Request) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    parts.uri = strip_uri(&parts.uri, strip_prefix)?;

    let response = ServeDir::new(dir)
        .oneshot(Request::from_parts(parts, body))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(response.map(Body::new))
}

fn strip_uri(uri: &Uri, strip_prefix: &str) -> Result<Uri, ApiError> {
    let path = uri.path();
    let rest = path
        .strip_prefix(strip_prefix)
        .or_else(|| path.strip_prefix('/'))
        .unwrap_or(path);

    let rewritten = match uri.query() {
        Some(query) => format!("/{rest}?{query}"),
        None => format!("/{rest}"),
    };

    rewritten
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| ApiError::internal(e.to_string()))
}

fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .map(str::to_string)
}
