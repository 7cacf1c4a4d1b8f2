//! Cross-origin policy for the HTTP surface.
//!
//! The cors layer produces the preflight answers itself; a thin status
//! mapper installed outside it downgrades them from the layer's default
//! `200` to `204 No Content`, which is the wire shape clients of this
//! service expect.

use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// CORS layer for the whole surface: `origins` is `*` or a comma-separated
/// list of exact origins.
pub fn cors_layer(origins: &str) -> CorsLayer {
    let origin = if origins == "*" {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins.split(',').filter_map(|o| o.trim().parse().ok()))
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Rewrite preflight answers to `204 No Content`.
///
/// Install with `axum::middleware::from_fn`, layered *outside*
/// [`cors_layer`] so it sees the short-circuited preflight response. Only
/// responses the cors layer produced are touched: an `OPTIONS` answer from
/// a real handler carries no `Access-Control-Allow-Methods` header and
/// passes through unchanged.
pub async fn preflight_status(req: Request, next: Next) -> Response {
    let options = req.method() == Method::OPTIONS;
    let mut res = next.run(req).await;
    if options
        && res.status() == StatusCode::OK
        && res
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS)
    {
        *res.status_mut() = StatusCode::NO_CONTENT;
    }
    res
}
