//! Gateway error taxonomy and its HTTP rendering.
//!
//! Every stage of the pipeline returns `Result<_, GatewayError>`; the variant
//! decides the status code and body through [`IntoResponse`], so stages never
//! build responses by hand. No variant is retried and none is fatal to the
//! process.
//!
//! | Variant | Status |
//! |---|---|
//! | `InvalidApiKey` | 401, fixed body |
//! | `MissingToken`, `TokenValidation`, `KeyMapping` | 401 |
//! | `NoRoute` | 404 |
//! | `RequestBody` | 400 |
//! | `UnknownBackend`, `Upstream` | 502 (504 on upstream timeout) |

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::keys::KeyMappingError;

/// Body sent when the `API-KEY` check fails. Kept byte-for-byte for existing clients.
pub const INVALID_API_KEY_BODY: &str = r#"{"message": "API key inválida"}"#;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `API-KEY` header missing, empty or not on the allow-list.
    #[error("API key inválida")]
    InvalidApiKey,

    /// No `Authorization` header on a path that requires a bearer token.
    #[error("bearer token missing from request")]
    MissingToken,

    /// The identity service rejected the token or could not be reached.
    #[error("token validation failed: {0}")]
    TokenValidation(String),

    /// The token was accepted but the gateway has no service key for the path.
    #[error("service token generation failed: {0}")]
    KeyMapping(#[from] KeyMappingError),

    #[error("no route matches {path}")]
    NoRoute { path: String },

    #[error("backend `{0}` is not configured")]
    UnknownBackend(String),

    #[error("could not read request body: {0}")]
    RequestBody(String),

    /// Transport failure talking to a backend. The source stays out of the
    /// message because it names the backend's internal address.
    #[error("backend `{backend}` request failed")]
    Upstream {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidApiKey
            | Self::MissingToken
            | Self::TokenValidation(_)
            | Self::KeyMapping(_) => StatusCode::UNAUTHORIZED,
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::UnknownBackend(_) => StatusCode::BAD_GATEWAY,
            Self::Upstream { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(%status, error = %self, "request rejected");

        if let Self::InvalidApiKey = self {
            return (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                INVALID_API_KEY_BODY,
            )
                .into_response();
        }

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
