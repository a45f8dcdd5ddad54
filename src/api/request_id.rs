//! Request ID middleware.
//!
//! Every inbound request is assigned an `X-Request-ID`. The ID is:
//!
//! - Accepted from the caller if they already provide a usable `X-Request-ID`
//! - Freshly generated (UUID v4) otherwise
//! - Written back onto the request, so the backend receives the same ID
//! - Echoed back in the `X-Request-ID` response header
//! - Wrapped in a [`tracing`] span so every log line for the request includes it

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument as _;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Axum middleware that assigns an `X-Request-ID` to every request.
///
/// Apply this **inside** `tower_http::TraceLayer` so it runs within the trace span.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let (id, value) = match req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .filter(|v| v.to_str().is_ok_and(|s| !s.trim().is_empty()))
    {
        Some(v) => (v.to_str().unwrap_or_default().to_owned(), v.clone()),
        None => {
            let id = Uuid::new_v4().to_string();
            // A hyphenated UUID is always a valid header value.
            let value = HeaderValue::from_str(&id).unwrap_or(HeaderValue::from_static("invalid"));
            (id, value)
        }
    };

    req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());

    let span = tracing::info_span!("request", id = %id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;

    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}
