//! Request routing: the route table and the stage pipeline.
//!
//! Every request goes through the same fixed sequence:
//!
//! 1. the global stages ([`GLOBAL_STAGES`], currently just the API-key gate);
//! 2. route matching against the [`RouteTable`], first match wins;
//! 3. the matched route's own stages, in declaration order;
//! 4. forwarding to the route's backend.
//!
//! A stage either hands the (possibly modified) request on or stops the
//! pipeline with a [`GatewayError`]. Nothing is reordered or skipped; the order
//! is data ([`RouteBinding::pipeline`]) rather than an artefact of layer
//! nesting.

use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use axum::{extract::Request, response::Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    api::{api_key_gate::ApiKeyGate, authentication::Authenticator},
    bypass::BypassRules,
    config::{Config, RouteConfig},
    error::GatewayError,
    identity::IdentityClient,
    keys::KeyRegistry,
    proxy::Forwarder,
};

/// A pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// `API-KEY` allow-list check. Always global.
    ApiKeyGate,
    /// Bearer-token validation and `X-Service-Token` issuance.
    Authenticate,
}

impl Stage {
    async fn apply(self, state: &RouterState, req: Request) -> Result<Request, GatewayError> {
        match self {
            Self::ApiKeyGate => {
                state.api_key_gate.check(req.uri().path(), req.headers())?;
                Ok(req)
            }
            Self::Authenticate => state.authenticator.apply(req).await,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ApiKeyGate => "api_key_gate",
            Self::Authenticate => "authenticate",
        })
    }
}

/// Stages run for every request, before route matching.
pub const GLOBAL_STAGES: &[Stage] = &[Stage::ApiKeyGate];

/// Path pattern of a route.
///
/// `/prefix/**` matches `/prefix` itself and everything below `/prefix/`.
/// A pattern without the wildcard suffix matches only that exact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    Prefix(String),
    Exact(String),
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            pattern.starts_with('/'),
            "path pattern `{pattern}` must start with `/`"
        );
        match pattern.strip_suffix("/**") {
            Some(prefix) => {
                anyhow::ensure!(
                    !prefix.contains('*'),
                    "path pattern `{pattern}` may only use `/**` as a trailing wildcard"
                );
                Ok(Self::Prefix(prefix.to_owned()))
            }
            None => {
                anyhow::ensure!(
                    !pattern.contains('*'),
                    "path pattern `{pattern}` may only use `/**` as a trailing wildcard"
                );
                Ok(Self::Exact(pattern.to_owned()))
            }
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Exact(exact) => path == exact,
        }
    }
}

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(f, "{prefix}/**"),
            Self::Exact(exact) => f.write_str(exact),
        }
    }
}

/// One compiled route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub name: String,
    pub pattern: RoutePattern,
    pub backend: String,
    pub stages: Vec<Stage>,
}

impl RouteBinding {
    /// Every stage a request on this route passes through, in execution order.
    pub fn pipeline(&self) -> impl Iterator<Item = Stage> + '_ {
        GLOBAL_STAGES.iter().chain(self.stages.iter()).copied()
    }
}

/// Ordered, immutable route list.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteBinding>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig]) -> anyhow::Result<Self> {
        let routes = routes
            .iter()
            .map(|r| {
                Ok(RouteBinding {
                    name: r.name.clone(),
                    pattern: RoutePattern::parse(&r.path)
                        .with_context(|| format!("route `{}`", r.name))?,
                    backend: r.backend.clone(),
                    stages: r.stages.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { routes })
    }

    /// First route whose pattern matches `path`.
    pub fn find(&self, path: &str) -> Option<&RouteBinding> {
        self.routes.iter().find(|r| r.pattern.matches(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteBinding> {
        self.routes.iter()
    }
}

/// Shared application state injected into the request handler via [`axum::extract::State`].
///
/// Built once at startup and read-only afterwards, so it is shared across
/// requests without locking.
pub struct RouterState {
    pub api_key_gate: ApiKeyGate,
    pub authenticator: Authenticator,
    pub routes: RouteTable,
    pub forwarder: Forwarder,
}

impl RouterState {
    /// Build the state, reading each service key's secret from its environment variable.
    ///
    /// A missing or empty secret is a startup error: the gateway refuses to run
    /// with a route it could never authenticate.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut secrets = HashMap::new();
        for key in &config.service_keys {
            let secret = key.secret().with_context(|| {
                format!(
                    "service key `{}`: environment variable `{}` is unset or empty",
                    key.marker, key.secret_env
                )
            })?;
            secrets.insert(key.marker.clone(), secret);
        }
        Self::with_secrets(config, secrets)
    }

    /// Build the state from already-resolved secrets (marker → raw secret).
    pub fn with_secrets(config: &Config, secrets: HashMap<String, String>) -> anyhow::Result<Self> {
        let identity_backend = config.backends.get(&config.identity.backend).with_context(|| {
            format!("identity backend `{}` not in config", config.identity.backend)
        })?;

        let identity = IdentityClient::new(
            &identity_backend.base_url,
            &config.identity.base_path,
            Duration::from_millis(config.identity.timeout_ms),
        )?;

        let keys = KeyRegistry::from_config(&config.service_keys);
        for entry in keys.entries() {
            info!(marker = %entry.marker, transform = %entry.transform, "service key registered");
        }
        let authenticator = Authenticator::new(
            BypassRules::new(config.authentication.bypass.iter().cloned()),
            identity,
            keys,
            secrets,
        );

        let routes = RouteTable::from_config(&config.routes)?;
        for route in routes.iter() {
            let stages: Vec<String> = route.pipeline().map(|s| s.to_string()).collect();
            info!(
                route = %route.name,
                pattern = %route.pattern,
                backend = %route.backend,
                stages = %stages.join(" -> "),
                "route registered"
            );
        }

        Ok(Self {
            api_key_gate: ApiKeyGate::from_config(&config.api_key_gate),
            authenticator,
            routes,
            forwarder: Forwarder::new(&config.backends, config.gateway.max_body_bytes)?,
        })
    }
}

/// Run one request through the full pipeline and return the backend's response.
#[tracing::instrument(
    skip_all,
    fields(
        method = %req.method(),
        path = %req.uri().path(),
        route = tracing::field::Empty,
    )
)]
pub async fn dispatch(state: &RouterState, req: Request) -> Result<Response, GatewayError> {
    let req = run_stages(state, GLOBAL_STAGES, req).await?;

    let path = req.uri().path();
    let Some(route) = state.routes.find(path) else {
        warn!(component = "router", path, "no route matches request path");
        return Err(GatewayError::NoRoute {
            path: path.to_owned(),
        });
    };
    tracing::Span::current().record("route", route.name.as_str());

    let req = run_stages(state, &route.stages, req).await?;
    state.forwarder.forward(&route.backend, req).await
}

async fn run_stages(
    state: &RouterState,
    stages: &[Stage],
    mut req: Request,
) -> Result<Request, GatewayError> {
    for stage in stages {
        req = stage.apply(state, req).await?;
    }
    Ok(req)
}

#[cfg(test)]
pub(crate) fn test_config(identity_uri: &str, core_uri: &str) -> Config {
    toml::from_str(&format!(
        r#"
        [identity]
        backend    = "TEMPLATE-AUTH"
        base_path  = "template-auth"
        timeout_ms = 2000

        [backends.TEMPLATE-AUTH]
        base_url = "{identity_uri}"

        [backends.TEMPLATE-CORE]
        base_url = "{core_uri}"

        [[routes]]
        name    = "TEMPLATE-AUTH"
        path    = "/template-auth/api/**"
        backend = "TEMPLATE-AUTH"

        [[routes]]
        name    = "TEMPLATE-CORE"
        path    = "/template-core/api/**"
        backend = "TEMPLATE-CORE"
        stages  = ["authenticate"]
        "#
    ))
    .expect("test config should parse")
}

#[cfg(test)]
pub(crate) fn test_state(identity_uri: &str, core_uri: &str) -> std::sync::Arc<RouterState> {
    let secrets = HashMap::from([
        ("template-auth".to_owned(), "template-auth-secret".to_owned()),
        ("template-core".to_owned(), "template-core-secret".to_owned()),
    ]);
    std::sync::Arc::new(
        RouterState::with_secrets(&test_config(identity_uri, core_uri), secrets)
            .expect("test state should build"),
    )
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::StatusCode,
        response::IntoResponse,
    };
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    // -----------------------------------------------------------------------
    // RoutePattern
    // -----------------------------------------------------------------------

    #[test]
    fn prefix_pattern_matches_prefix_and_descendants() {
        let p = RoutePattern::parse("/template-core/api/**").unwrap();
        assert!(p.matches("/template-core/api"));
        assert!(p.matches("/template-core/api/"));
        assert!(p.matches("/template-core/api/widgets/7"));
        assert!(!p.matches("/template-core/apix"));
        assert!(!p.matches("/template-core/v3/api-docs"));
        assert!(!p.matches("/other/template-core/api/widgets"));
    }

    #[test]
    fn root_wildcard_matches_everything() {
        let p = RoutePattern::parse("/**").unwrap();
        assert!(p.matches("/"));
        assert!(p.matches("/anything/at/all"));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let p = RoutePattern::parse("/status").unwrap();
        assert!(p.matches("/status"));
        assert!(!p.matches("/status/x"));
    }

    #[test]
    fn parse_rejects_relative_and_inner_wildcards() {
        assert!(RoutePattern::parse("template-core/**").is_err());
        assert!(RoutePattern::parse("/a/*/b").is_err());
        assert!(RoutePattern::parse("/a/**/b/**").is_err());
    }

    #[test]
    fn pattern_display_round_trips_source() {
        for src in ["/template-core/api/**", "/status"] {
            assert_eq!(RoutePattern::parse(src).unwrap().to_string(), src);
        }
    }

    // -----------------------------------------------------------------------
    // RouteTable
    // -----------------------------------------------------------------------

    fn route(name: &str, path: &str, stages: Vec<Stage>) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            path: path.into(),
            backend: "B".into(),
            stages,
        }
    }

    #[test]
    fn first_matching_route_wins() {
        let table = RouteTable::from_config(&[
            route("narrow", "/svc/api/admin/**", vec![]),
            route("wide", "/svc/api/**", vec![Stage::Authenticate]),
        ])
        .unwrap();

        assert_eq!(table.find("/svc/api/admin/users").unwrap().name, "narrow");
        assert_eq!(table.find("/svc/api/widgets").unwrap().name, "wide");
        assert!(table.find("/other").is_none());
    }

    #[test]
    fn pipeline_runs_global_stages_before_route_stages() {
        let table =
            RouteTable::from_config(&[route("core", "/c/**", vec![Stage::Authenticate])]).unwrap();
        let stages: Vec<Stage> = table.find("/c/x").unwrap().pipeline().collect();
        assert_eq!(stages, [Stage::ApiKeyGate, Stage::Authenticate]);
    }

    #[test]
    fn route_without_stages_still_passes_the_gate() {
        let table = RouteTable::from_config(&[route("auth", "/a/**", vec![])]).unwrap();
        let stages: Vec<Stage> = table.find("/a/x").unwrap().pipeline().collect();
        assert_eq!(stages, [Stage::ApiKeyGate]);
    }

    // -----------------------------------------------------------------------
    // RouterState
    // -----------------------------------------------------------------------

    #[test]
    fn new_fails_when_secret_env_is_missing() {
        let mut config = test_config("http://127.0.0.1:1", "http://127.0.0.1:1");
        for key in &mut config.service_keys {
            key.secret_env = format!("EDGE_GATEWAY_TEST_UNSET_{}", key.marker.replace('-', "_"));
        }
        let err = RouterState::new(&config).err().expect("should fail");
        assert!(err.to_string().contains("template-auth"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // dispatch: full pipeline against mock identity service and backend
    // -----------------------------------------------------------------------

    fn request(uri: &str, api_key: Option<&str>, bearer: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().method("GET").uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("API-KEY", key);
        }
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn into_parts(result: Result<Response, GatewayError>) -> (StatusCode, String) {
        let response = result.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn authenticated_route_forwards_with_service_token() {
        let identity = MockServer::start().await;
        let core = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/template-auth/api/auth/validate/abc123"))
            .and(body_json(json!({ "path": "/template-core/api/widgets" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&identity)
            .await;
        Mock::given(method("GET"))
            .and(path("/template-core/api/widgets"))
            .and(header("x-service-token", "dGVtcGxhdGUtY29yZS1zZWNyZXQ="))
            .respond_with(ResponseTemplate::new(200).set_body_string("widgets"))
            .expect(1)
            .mount(&core)
            .await;

        let state = test_state(&identity.uri(), &core.uri());
        let req = request("/template-core/api/widgets", Some("template-core"), Some("abc123"));
        let (status, body) = into_parts(dispatch(&state, req).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "widgets");
    }

    #[tokio::test]
    async fn rejected_token_never_reaches_backend() {
        let identity = MockServer::start().await;
        let core = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&identity)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&core)
            .await;

        let state = test_state(&identity.uri(), &core.uri());
        let req = request("/template-core/api/widgets", Some("template-core"), Some("abc123"));
        let (status, body) = into_parts(dispatch(&state, req).await).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(json["message"].as_str().unwrap().contains("403"), "body: {body}");
    }

    #[tokio::test]
    async fn missing_api_key_stops_before_any_outbound_call() {
        let identity = MockServer::start().await;
        let core = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&identity)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&core)
            .await;

        let state = test_state(&identity.uri(), &core.uri());
        let req = request("/template-core/api/widgets", None, Some("abc123"));
        let (status, body) = into_parts(dispatch(&state, req).await).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"message": "API key inválida"}"#);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected_without_validation_call() {
        let identity = MockServer::start().await;
        let core = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&identity)
            .await;

        let state = test_state(&identity.uri(), &core.uri());
        let req = request("/template-core/api/widgets", Some("template-core"), None);
        let (status, _) = into_parts(dispatch(&state, req).await).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_path_is_no_route_once_gate_passes() {
        let state = test_state("http://127.0.0.1:1", "http://127.0.0.1:1");

        let req = request("/reports/api/monthly", Some("template-core"), None);
        let err = dispatch(&state, req).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::NoRoute { ref path } if path == "/reports/api/monthly"
        ));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_path_without_api_key_fails_at_the_gate_first() {
        let state = test_state("http://127.0.0.1:1", "http://127.0.0.1:1");

        let req = request("/reports/api/monthly", None, None);
        let err = dispatch(&state, req).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidApiKey));
    }

    #[tokio::test]
    async fn route_without_authenticate_stage_forwards_without_token() {
        let identity = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&identity)
            .await;
        Mock::given(method("GET"))
            .and(path("/template-auth/api/users/me"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&identity)
            .await;

        let state = test_state(&identity.uri(), "http://127.0.0.1:1");
        let req = request("/template-auth/api/users/me", Some("template-auth"), None);
        let (status, _) = into_parts(dispatch(&state, req).await).await;
        assert_eq!(status, StatusCode::OK);

        let received = identity.received_requests().await.unwrap();
        assert!(received[0].headers.get("x-service-token").is_none());
    }

    #[tokio::test]
    async fn login_path_skips_the_gate() {
        let identity = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/template-auth/api/auth/login"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&identity)
            .await;

        let state = test_state(&identity.uri(), "http://127.0.0.1:1");
        let req = request("/template-auth/api/auth/login", None, None);
        let (status, _) = into_parts(dispatch(&state, req).await).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_backend_after_authentication_is_bad_gateway() {
        let identity = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&identity)
            .await;

        let state = test_state(&identity.uri(), "http://127.0.0.1:1");
        let req = request("/template-core/api/widgets", Some("template-core"), Some("abc123"));
        let err = dispatch(&state, req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
