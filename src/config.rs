//! Configuration types for edge-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens its port. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. There is no hot-reload: the
//! route table, key registry and allow-lists are fixed for the process lifetime.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [identity]
//! backend    = "TEMPLATE-AUTH"
//! base_path  = "template-auth"
//! timeout_ms = 5000
//!
//! [[service_keys]]
//! marker     = "template-core"
//! secret_env = "TEMPLATE_CORE_SECRET"
//!
//! [backends.TEMPLATE-AUTH]
//! base_url = "http://localhost:9001"
//!
//! [backends.TEMPLATE-CORE]
//! base_url = "http://localhost:9002"
//!
//! [[routes]]
//! name    = "TEMPLATE-CORE"
//! path    = "/template-core/api/**"
//! backend = "TEMPLATE-CORE"
//! stages  = ["authenticate"]
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    keys::Transform,
    router::{RoutePattern, Stage},
};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// The remote identity service that validates bearer tokens.
    pub identity: IdentityConfig,

    /// Coarse `API-KEY` header check applied to every request.
    #[serde(default)]
    pub api_key_gate: ApiKeyGateConfig,

    /// Bearer-token pipeline settings for routes carrying the `authenticate` stage.
    #[serde(default)]
    pub authentication: AuthenticationConfig,

    /// Path marker → secret bindings used to mint `X-Service-Token`.
    ///
    /// Order is significant: the first marker contained in the request path wins.
    #[serde(default = "defaults::service_keys")]
    pub service_keys: Vec<ServiceKeyConfig>,

    /// Logical backend name → network address.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Path pattern → backend bindings, matched in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.backends.contains_key(&self.identity.backend),
            "[identity] references unknown backend `{}`",
            self.identity.backend
        );
        anyhow::ensure!(
            self.identity.timeout_ms > 0,
            "[identity] timeout_ms must be greater than zero"
        );

        for (name, backend) in &self.backends {
            anyhow::ensure!(
                backend.base_url.starts_with("http://") || backend.base_url.starts_with("https://"),
                "backend `{}` base_url `{}` must be an http(s) URL",
                name,
                backend.base_url
            );
        }

        // Markers are matched by containment, so an empty one would shadow every later entry.
        let mut markers = HashSet::new();
        for key in &self.service_keys {
            anyhow::ensure!(!key.marker.is_empty(), "[[service_keys]] marker must not be empty");
            anyhow::ensure!(
                markers.insert(key.marker.as_str()),
                "[[service_keys]] marker `{}` is declared twice",
                key.marker
            );
        }

        let mut route_names = HashSet::new();
        for route in &self.routes {
            anyhow::ensure!(
                route_names.insert(route.name.as_str()),
                "route `{}` is declared twice",
                route.name
            );
            anyhow::ensure!(
                self.backends.contains_key(&route.backend),
                "route `{}` references unknown backend `{}`",
                route.name,
                route.backend
            );
            RoutePattern::parse(&route.path)
                .with_context(|| format!("route `{}` has an invalid path", route.name))?;
            anyhow::ensure!(
                !route.stages.contains(&Stage::ApiKeyGate),
                "route `{}` lists `api_key_gate`, which already runs for every request",
                route.name
            );
        }

        Ok(())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for inbound traffic (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log filter used when `RUST_LOG` is not set, e.g. `"edge_gateway=debug"`.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Largest request body buffered for forwarding (default: 10 MiB).
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            log_level: None,
            log_format: LogFormat::default(),
            max_body_bytes: defaults::max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Where and how to reach the identity service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Logical backend name of the identity service (must exist in `[backends]`).
    pub backend: String,

    /// Path segment(s) the identity service is mounted under.
    #[serde(default = "defaults::identity_base_path")]
    pub base_path: String,

    /// Timeout for the validation call in milliseconds.
    ///
    /// Required: there is deliberately no default, every deployment must pick one.
    pub timeout_ms: u64,
}

/// Allow-list and exemptions for the `API-KEY` header check.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyGateConfig {
    /// Accepted `API-KEY` values. These are tenant names, not secrets.
    #[serde(default = "defaults::allowed_api_keys")]
    pub allowed: Vec<String>,

    /// Path substrings exempt from the check.
    #[serde(default = "defaults::api_key_gate_bypass")]
    pub bypass: Vec<String>,
}

impl Default for ApiKeyGateConfig {
    fn default() -> Self {
        Self {
            allowed: defaults::allowed_api_keys(),
            bypass: defaults::api_key_gate_bypass(),
        }
    }
}

/// Settings for the bearer-token stage.
///
/// The bypass list is intentionally separate from [`ApiKeyGateConfig::bypass`];
/// the two default lists differ.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthenticationConfig {
    /// Path substrings that skip token validation entirely.
    #[serde(default = "defaults::authentication_bypass")]
    pub bypass: Vec<String>,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            bypass: defaults::authentication_bypass(),
        }
    }
}

/// A path marker bound to a secret.
///
/// The gateway reads the secret from the environment variable named by
/// `secret_env` at startup, which keeps secrets out of the config file.
///
/// ```toml
/// [[service_keys]]
/// marker     = "template-auth"
/// secret_env = "TEMPLATE_AUTH_SECRET"
/// transform  = "base64"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceKeyConfig {
    /// Substring looked for in the request path.
    pub marker: String,
    /// Name of the environment variable holding the raw secret.
    pub secret_env: String,
    /// How the raw secret is turned into the credential.
    #[serde(default)]
    pub transform: Transform,
}

impl ServiceKeyConfig {
    /// Resolve the secret from the configured environment variable.
    ///
    /// Empty values are treated as unset.
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env).ok().filter(|s| !s.is_empty())
    }
}

/// A named backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Scheme, host and port, e.g. `http://core:8080`. The request path is appended as-is.
    pub base_url: String,

    /// Request timeout in milliseconds (default: 30 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

/// One row of the route table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier, used in logs.
    pub name: String,
    /// Path pattern, e.g. `/template-core/api/**`.
    pub path: String,
    /// Logical backend name (must exist in `[backends]`).
    pub backend: String,
    /// Stages run after the global ones, in order.
    #[serde(default)]
    pub stages: Vec<Stage>,
}

mod defaults {
    use crate::keys::Transform;

    use super::ServiceKeyConfig;

    pub fn port() -> u16 { 8080 }
    pub fn max_body_bytes() -> usize { 10 * 1024 * 1024 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn identity_base_path() -> String { "template-auth".into() }

    pub fn allowed_api_keys() -> Vec<String> {
        vec!["template-core".into(), "template-auth".into()]
    }

    pub fn api_key_gate_bypass() -> Vec<String> {
        vec!["/swagger-ui/".into(), "/api-docs".into(), "/login".into()]
    }

    pub fn authentication_bypass() -> Vec<String> {
        vec!["v3/api-docs".into(), "api/auth/login".into()]
    }

    pub fn service_keys() -> Vec<ServiceKeyConfig> {
        vec![
            ServiceKeyConfig {
                marker: "template-auth".into(),
                secret_env: "TEMPLATE_AUTH_SECRET".into(),
                transform: Transform::Base64,
            },
            ServiceKeyConfig {
                marker: "template-core".into(),
                secret_env: "TEMPLATE_CORE_SECRET".into(),
                transform: Transform::Base64,
            },
        ]
    }
}
