//! Embedded front-end bundle.
//!
//! The dashboard is compiled into the binary and served from the router's
//! fallback. Unknown paths fall back to `index.html` so client-side routes
//! survive a refresh. HTML is never cached; everything else is fingerprinted
//! by the front-end build and served immutable.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// The embedded bundle as (path, body) pairs.
const ASSETS: &[(&str, &str)] = &[("index.html", INDEX_HTML)];

pub fn serve(path: &str) -> Response {
    let trimmed = path.trim_start_matches('/');
    let lookup = if trimmed.is_empty() { "index.html" } else { trimmed };

    let (path, body) = match ASSETS.iter().find(|(name, _)| *name == lookup) {
        Some((name, body)) => (*name, *body),
        // SPA routing: unknown paths get the application shell.
        None => ("index.html", INDEX_HTML),
    };

    let cache_control = if path.ends_with(".html") {
        "no-cache, no-store, must-revalidate"
    } else {
        "public, max-age=31536000, immutable"
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(path)),
            (header::CACHE_CONTROL, cache_control),
        ],
        body,
    )
        .into_response()
}

pub(crate) fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if path.ends_with(".js") {
        "application/javascript"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".json") {
        "application/json"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else if path.ends_with(".ico") {
        "image/x-icon"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("style.css"), "text/css");
        assert_eq!(content_type_for("favicon.ico"), "image/x-icon");
        assert_eq!(content_type_for("blob.bin"), "application/octet-stream");
    }

    #[test]
    fn test_root_serves_index() {
        let response = serve("/");
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/html"));
    }

    #[test]
    fn test_unknown_path_falls_back_to_index() {
        let response = serve("/some/client/route");
        assert_eq!(response.status(), StatusCode::OK);
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        // The shell is HTML, so it is never cached.
        assert!(cache.contains("no-store"));
    }
}
