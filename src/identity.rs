//! Client for the remote identity service.
//!
//! The gateway does not interpret bearer tokens itself. It asks the identity
//! service whether a token is acceptable for the requested path and branches on
//! the answer. Every outcome, including transport failures, comes back as a
//! [`ValidationOutcome`] value so the calling stage never has to deal with an
//! error escaping the await point.

use std::time::Duration;

use anyhow::Context;
use reqwest::{redirect, Client, Url};
use serde_json::json;
use tracing::debug;

/// Result of asking the identity service about a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Success,
    /// Carries the upstream status text (e.g. `403 Forbidden`) or the transport error.
    Failure(String),
}

/// HTTP client bound to one identity service instance.
///
/// Built once at startup and shared by every request; [`Client`] holds its
/// connection pool behind an `Arc`, so concurrent validations do not contend.
pub struct IdentityClient {
    client: Client,
    base_url: Url,
    base_path: Vec<String>,
}

impl IdentityClient {
    /// Construct a client for the identity service at `base_url`.
    ///
    /// `base_path` is the prefix the service is mounted under (`template-auth`
    /// produces `/template-auth/api/auth/validate/...`). `timeout` bounds the
    /// whole validation call.
    pub fn new(base_url: &str, base_path: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("parsing identity service URL `{base_url}`"))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "identity service URL `{base_url}` cannot carry a path"
        );

        // A 3xx is an answer in its own right; following it would replay the token elsewhere.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            base_path: base_path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        })
    }

    /// `{base_url}/{base_path}/api/auth/validate/{token}`.
    ///
    /// The token becomes exactly one percent-encoded path segment, so a token
    /// containing `/` or `?` cannot change the target endpoint.
    pub fn validate_url(&self, token: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(&self.base_path)
                .extend(["api", "auth", "validate", token]);
        }
        url
    }

    /// Ask the identity service whether `token` may access `path`.
    ///
    /// `token` must already have its `Bearer ` prefix removed. No retry is
    /// attempted; a dropped future abandons the in-flight request.
    pub async fn validate(&self, token: &str, path: &str) -> ValidationOutcome {
        let url = self.validate_url(token);

        let response = match self
            .client
            .put(url)
            .json(&json!({ "path": path }))
            .send()
            .await
        {
            Ok(response) => response,
            // without_url(): the URL embeds the token and must not reach logs or responses.
            Err(e) => return ValidationOutcome::Failure(e.without_url().to_string()),
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            debug!(%status, path, "identity service rejected token");
            return ValidationOutcome::Failure(status.to_string());
        }

        ValidationOutcome::Success
    }
}
