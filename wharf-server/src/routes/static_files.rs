//! Static files from `<data_dir>/<web_root>`, with an `index.html`
//! fallback for client-side routed pages.

use std::{
    fs::File,
    io,
    path::{Component, Path, PathBuf},
};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
    },
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::debug;

use super::AppState;
use crate::errors::AppError;

const INDEX: &str = "index.html";
const FILE_CACHE_CONTROL: &str = "max-age=0";
const INDEX_CACHE_CONTROL: &str = "max-age=0, private, must-revalidate";

pub async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let root = state.settings.web_dir();
    let method = request.method().clone();
    let wants_html = accepts_html(request.headers());
    let if_none_match = request.headers().get(IF_NONE_MATCH).cloned();

    let tag = match existing_file(&root, request.uri().path()).await {
        Some(path) => etag(path).await,
        None => None,
    };

    if let Some(tag) = &tag
        && matches!(method, Method::GET | Method::HEAD)
        && etag_matches(if_none_match.as_ref(), tag)
    {
        return not_modified(tag);
    }

    let mut response = match ServeDir::new(&root).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };

    if response.status() != StatusCode::NOT_FOUND {
        if let Some(tag) = tag {
            let headers = response.headers_mut();
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(FILE_CACHE_CONTROL));
            headers.insert(ETAG, tag);
        }
        return response;
    }

    if method == Method::GET && wants_html {
        return index(&root, if_none_match.as_ref()).await;
    }

    AppError::not_found("not found").into_response()
}

async fn index(root: &Path, if_none_match: Option<&HeaderValue>) -> Response {
    let path = root.join(INDEX);
    let Ok(body) = tokio::fs::read(&path).await else {
        debug!(path = %path.display(), "no index page to fall back to");
        return AppError::not_found("not found").into_response();
    };

    let mut response = match etag(path).await {
        Some(tag) if etag_matches(if_none_match, &tag) => return not_modified(&tag),
        Some(tag) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(ETAG, tag);
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static(INDEX_CACHE_CONTROL));
            response
        }
        None => Response::new(Body::from(body)),
    };
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn not_modified(tag: &HeaderValue) -> Response {
    (StatusCode::NOT_MODIFIED, [(ETAG, tag.clone())]).into_response()
}

/// True when any media range in `Accept` is `text/html` or `*/*`.
fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|range| range.split(';').next().unwrap_or_default().trim())
        .any(|range| range.eq_ignore_ascii_case("text/html") || range == "*/*")
}

fn etag_matches(if_none_match: Option<&HeaderValue>, tag: &HeaderValue) -> bool {
    let (Some(header), Ok(tag)) = (if_none_match.and_then(|v| v.to_str().ok()), tag.to_str()) else {
        return false;
    };
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == tag)
}

/// The regular file a request path names, if it stays inside `root`.
async fn existing_file(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let relative = Path::new(uri_path.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }

    let path = root.join(relative);
    let metadata = tokio::fs::metadata(&path).await.ok()?;
    metadata.is_file().then_some(path)
}

/// Quoted content hash of the file at `path`.
async fn etag(path: PathBuf) -> Option<HeaderValue> {
    let digest = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(&path)?, &mut hasher)?;
        Ok(hex::encode(&hasher.finalize()[..16]))
    })
    .await
    .ok()?
    .ok()?;

    HeaderValue::from_str(&format!("\"{digest}\"")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(accept).unwrap());
        headers
    }

    #[test]
    fn html_acceptance() {
        assert!(accepts_html(&headers("text/html,application/xhtml+xml;q=0.9")));
        assert!(accepts_html(&headers("application/json, */*;q=0.1")));
        assert!(!accepts_html(&headers("application/json")));
        assert!(!accepts_html(&HeaderMap::new()));
    }

    #[test]
    fn etag_list_matching() {
        let tag = HeaderValue::from_static("\"abc\"");
        let header = HeaderValue::from_static("\"zzz\", \"abc\"");
        assert!(etag_matches(Some(&header), &tag));
        assert!(etag_matches(Some(&HeaderValue::from_static("*")), &tag));
        assert!(!etag_matches(Some(&HeaderValue::from_static("\"zzz\"")), &tag));
        assert!(!etag_matches(None, &tag));
    }

    #[tokio::test]
    async fn traversal_is_not_resolved() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        assert!(existing_file(dir.path(), "/a.txt").await.is_some());
        assert!(existing_file(dir.path(), "/../a.txt").await.is_none());
        assert!(existing_file(dir.path(), "/").await.is_none());
    }
}
