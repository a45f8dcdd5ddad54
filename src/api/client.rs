//! Client-facing HTTP surface.
//!
//! This is intentionally a thin layer: the gateway has no routes of its own,
//! so every request lands on a single fallback handler that hands it to
//! [`crate::router::dispatch`]. Errors become responses through
//! [`GatewayError`]'s `IntoResponse` impl.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    response::Response,
    Router,
};

use crate::{error::GatewayError, router::RouterState};

/// Build the client-facing axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new().fallback(gateway).with_state(state)
}

/// Any method, any path: run the pipeline and relay the backend's answer.
pub async fn gateway(
    State(state): State<Arc<RouterState>>,
    req: Request,
) -> Result<Response, GatewayError> {
    crate::router::dispatch(&state, req).await
}
