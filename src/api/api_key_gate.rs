//! Coarse `API-KEY` header check, applied to every inbound request.
//!
//! Runs before route matching and before any bearer-token work. A request on a
//! gated path must carry `API-KEY: <tenant>` where `<tenant>` is on the
//! allow-list; otherwise it is answered with `401` and
//! `{"message": "API key inválida"}` and goes no further.
//!
//! The allowed values are tenant identifiers, not secrets, so they are compared
//! with a plain case-sensitive `==`.

use axum::http::HeaderMap;
use tracing::warn;

use crate::{bypass::BypassRules, config::ApiKeyGateConfig, error::GatewayError};

/// Header carrying the tenant identifier.
pub const API_KEY_HEADER: &str = "api-key";

#[derive(Debug, Clone)]
pub struct ApiKeyGate {
    allowed: Vec<String>,
    bypass: BypassRules,
}

impl ApiKeyGate {
    pub fn new(allowed: Vec<String>, bypass: BypassRules) -> Self {
        Self { allowed, bypass }
    }

    pub fn from_config(cfg: &ApiKeyGateConfig) -> Self {
        Self::new(cfg.allowed.clone(), BypassRules::new(cfg.bypass.iter().cloned()))
    }

    /// `false` for documentation and login paths, `true` otherwise.
    pub fn needs_check(&self, path: &str) -> bool {
        !self.bypass.matches(path)
    }

    pub fn is_authorized(&self, provided: &str) -> bool {
        self.allowed.iter().any(|k| k == provided)
    }

    /// Apply the gate to one request.
    pub fn check(&self, path: &str, headers: &HeaderMap) -> Result<(), GatewayError> {
        if !self.needs_check(path) {
            return Ok(());
        }

        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        match provided {
            Some(key) if self.is_authorized(key) => Ok(()),
            Some(_) => {
                warn!(component = "api_key_gate", path, "API key not on allow-list");
                Err(GatewayError::InvalidApiKey)
            }
            None => {
                warn!(component = "api_key_gate", path, "API key header missing");
                Err(GatewayError::InvalidApiKey)
            }
        }
    }
}
