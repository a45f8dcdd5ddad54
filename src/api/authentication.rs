//! Bearer-token authentication stage.
//!
//! Attached to individual routes (`stages = ["authenticate"]`). For each
//! request it runs, in this order:
//!
//! 1. **Bypass**: paths matching the authentication bypass rules continue untouched.
//! 2. **Token presence**: no usable `Authorization` header fails fast with
//!    [`GatewayError::MissingToken`]; the identity service is not called.
//! 3. **Validation**: one `PUT` to the identity service. This is the only await
//!    point; the worker thread is free while it is pending.
//! 4. **Credential issuance**: the path's marker selects a service key, failure
//!    is [`GatewayError::KeyMapping`] (a gateway misconfiguration, not a caller error).
//! 5. **Mutation**: `X-Service-Token` is inserted, replacing any client-supplied value.
//!
//! The stage never retries and never logs the bearer token or the issued credential.

use std::collections::HashMap;

use axum::{
    extract::Request,
    http::{header, HeaderMap},
};
use tracing::{debug, error, warn};

use crate::{
    bypass::BypassRules,
    error::GatewayError,
    identity::{IdentityClient, ValidationOutcome},
    keys::KeyRegistry,
};

/// Header carrying the issued service credential to the backend.
pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// Everything the stage needs, built once at startup.
pub struct Authenticator {
    bypass: BypassRules,
    identity: IdentityClient,
    keys: KeyRegistry,
    /// Marker → raw secret. Never logged.
    secrets: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(
        bypass: BypassRules,
        identity: IdentityClient,
        keys: KeyRegistry,
        secrets: HashMap<String, String>,
    ) -> Self {
        Self {
            bypass,
            identity,
            keys,
            secrets,
        }
    }

    /// Run the stage. `Ok` carries the request to hand to the next stage.
    pub async fn apply(&self, mut req: Request) -> Result<Request, GatewayError> {
        let path = req.uri().path().to_owned();

        if self.bypass.matches(&path) {
            debug!(component = "authentication", %path, "path exempt from token validation");
            return Ok(req);
        }

        let Some(token) = bearer_token(req.headers()) else {
            warn!(component = "authentication", %path, "bearer token missing from request");
            return Err(GatewayError::MissingToken);
        };

        if let ValidationOutcome::Failure(reason) = self.identity.validate(&token, &path).await {
            warn!(component = "authentication", %path, error = %reason, "token validation failed");
            return Err(GatewayError::TokenValidation(reason));
        }

        let issued = self.keys.service_token(&path, &self.secrets).and_then(|token| {
            let marker = token.marker().to_owned();
            token.into_header_value().map(|value| (marker, value))
        });
        let (marker, value) = issued.map_err(|e| {
            error!(
                component = "authentication",
                %path,
                error = %e,
                "service token generation failed"
            );
            GatewayError::KeyMapping(e)
        })?;

        req.headers_mut().insert(SERVICE_TOKEN_HEADER, value);
        debug!(component = "authentication", %path, %marker, "service token issued");
        Ok(req)
    }
}

/// Extract the token from `Authorization`, dropping a leading `Bearer `.
///
/// A header without the prefix is passed through as-is. Absent, non-UTF-8 or
/// blank values yield `None`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match raw.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest.trim(),
        _ => raw,
    };
    (!token.is_empty()).then(|| token.to_owned())
}
