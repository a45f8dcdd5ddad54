//! Service credential issuance.
//!
//! Every request that passes token validation is stamped with an
//! `X-Service-Token` so backends can trust the gateway without re-validating
//! the caller's bearer token. The credential is derived from a per-backend
//! secret, selected by looking for a marker (e.g. `template-core`) inside the
//! request path.
//!
//! The registry holds only markers and transform tags; secrets are passed in
//! by the caller so the lookup stays pure and testable in isolation.

use std::collections::HashMap;

use axum::http::HeaderValue;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::ServiceKeyConfig;

/// How a raw secret is turned into a service credential.
///
/// Each variant is a pure function of the secret. New derivations get a new
/// variant and a new arm in [`Transform::apply`]; the lookup never changes.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Standard (padded) base64 of the secret's UTF-8 bytes.
    #[default]
    Base64,
}

impl Transform {
    pub fn apply(self, secret: &str) -> String {
        match self {
            Self::Base64 => base64::engine::general_purpose::STANDARD.encode(secret.as_bytes()),
        }
    }
}

impl std::fmt::Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Base64 => "base64",
        })
    }
}

/// Why no credential could be issued for a request.
///
/// All variants point at gateway configuration, never at the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyMappingError {
    #[error("no service key mapped for request path [{path}]")]
    UnmappedPath { path: String },

    #[error("service key `{marker}` has no secret configured")]
    MissingSecret { marker: String },

    #[error("service key `{marker}` produced a credential that is not a valid header value")]
    InvalidCredential { marker: String },
}

/// One registered marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKeyEntry {
    pub marker: String,
    pub transform: Transform,
}

/// Issued credential, valid for a single request.
///
/// `Debug` is redacted so the value cannot leak through `{:?}` in a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceToken {
    marker: String,
    value: String,
}

impl ServiceToken {
    /// The marker this credential was issued for.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Convert into a header value flagged as sensitive.
    pub fn into_header_value(self) -> Result<HeaderValue, KeyMappingError> {
        let mut value = HeaderValue::try_from(self.value).map_err(|_| {
            KeyMappingError::InvalidCredential {
                marker: self.marker.clone(),
            }
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl std::fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceToken")
            .field("marker", &self.marker)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Ordered marker table.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    entries: Vec<ServiceKeyEntry>,
}

impl KeyRegistry {
    pub fn new(entries: Vec<ServiceKeyEntry>) -> Self {
        Self { entries }
    }

    /// Build the registry from `[[service_keys]]`, preserving declaration order.
    pub fn from_config(keys: &[ServiceKeyConfig]) -> Self {
        Self::new(
            keys.iter()
                .map(|k| ServiceKeyEntry {
                    marker: k.marker.clone(),
                    transform: k.transform,
                })
                .collect(),
        )
    }

    pub fn entries(&self) -> &[ServiceKeyEntry] {
        &self.entries
    }

    /// Issue the credential for `path`.
    ///
    /// Markers are tried in registration order and the first one contained in
    /// `path` decides; later entries are not looked at.
    ///
    /// # Errors
    /// [`KeyMappingError::UnmappedPath`] when no marker is contained in `path`,
    /// [`KeyMappingError::MissingSecret`] when the winning marker has no entry in `secrets`.
    pub fn service_token(
        &self,
        path: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<ServiceToken, KeyMappingError> {
        let entry = self
            .entries
            .iter()
            .find(|e| path.contains(e.marker.as_str()))
            .ok_or_else(|| KeyMappingError::UnmappedPath {
                path: path.to_owned(),
            })?;

        let secret = secrets
            .get(&entry.marker)
            .ok_or_else(|| KeyMappingError::MissingSecret {
                marker: entry.marker.clone(),
            })?;

        Ok(ServiceToken {
            marker: entry.marker.clone(),
            value: entry.transform.apply(secret),
        })
    }
}
