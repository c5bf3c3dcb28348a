use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};

// Hardening headers for an API that never serves markup: no sniffing, no
// referrers, and nothing cacheable (responses may carry recipient data).
pub async fn security_headers_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let mut res = next.run(req).await;

    if res.headers().get("x-content-type-options").is_none() {
        res.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
    }
    if res.headers().get("referrer-policy").is_none() {
        res.headers_mut().insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
    }
    if res.headers().get("cache-control").is_none() {
        res.headers_mut().insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store"),
        );
    }

    res
}
