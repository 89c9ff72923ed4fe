//! Static files for dumb-protocol clients.

use std::path::Path;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::handler::AppError;
use super::routes::RouteKind;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const ONE_YEAR_SECS: i64 = 31_536_000;

pub fn set_no_cache(headers: &mut HeaderMap) {
    headers.insert(header::EXPIRES, HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
}

pub fn set_cache_forever(headers: &mut HeaderMap) {
    let now = Utc::now();
    let expires = now + Duration::seconds(ONE_YEAR_SECS);
    if let Ok(date) = HeaderValue::from_str(&now.format(HTTP_DATE).to_string()) {
        headers.insert(header::DATE, date);
    }
    if let Ok(expires) = HeaderValue::from_str(&expires.format(HTTP_DATE).to_string()) {
        headers.insert(header::EXPIRES, expires);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000"),
    );
}

/// Stream `repo_path/file` with the headers its kind calls for.
pub async fn send_file(kind: RouteKind, repo_path: &Path, file: &str) -> Result<Response, AppError> {
    let path = repo_path.join(file);
    let handle = match tokio::fs::File::open(&path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "static file not found");
            return Err(AppError::NotFound);
        }
        Err(e) => {
            return Err(AppError::Internal(
                anyhow::Error::new(e).context(format!("failed to open {}", path.display())),
            ))
        }
    };
    let meta = handle
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if !meta.is_file() {
        return Err(AppError::NotFound);
    }

    let mut response = (
        StatusCode::OK,
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(kind.content_type()));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    if let Ok(modified) = meta.modified() {
        let modified: DateTime<Utc> = modified.into();
        if let Ok(value) = HeaderValue::from_str(&modified.format(HTTP_DATE).to_string()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if kind.cache_forever() {
        set_cache_forever(headers);
    } else {
        set_no_cache(headers);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn text_files_are_not_cached() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let resp = send_file(RouteKind::TextFile, dir.path(), "HEAD").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(resp.headers()[header::PRAGMA], "no-cache");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "21");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ref: refs/heads/main\n");
    }

    #[tokio::test]
    async fn packs_are_cached_forever() {
        let dir = TempDir::new().unwrap();
        let name = format!("objects/pack/pack-{}.pack", "a".repeat(40));
        std::fs::create_dir_all(dir.path().join("objects/pack")).unwrap();
        std::fs::write(dir.path().join(&name), b"PACK").unwrap();

        let resp = send_file(RouteKind::PackFile, dir.path(), &name).await.unwrap();
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "public, max-age=31536000");
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/x-git-packed-objects"
        );
    }

    #[tokio::test]
    async fn info_packs_is_not_cached() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("objects/info")).unwrap();
        std::fs::write(dir.path().join("objects/info/packs"), "P pack-x.pack\n").unwrap();

        let resp = send_file(RouteKind::InfoPacks, dir.path(), "objects/info/packs")
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::PRAGMA], "no-cache");
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "no-cache, max-age=0, must-revalidate"
        );
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            send_file(RouteKind::TextFile, dir.path(), "objects/info/alternates").await,
            Err(AppError::NotFound)
        ));
    }
}
