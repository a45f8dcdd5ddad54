//! Request forwarding to backends.
//!
//! A backend is addressed by its logical name (`TEMPLATE-CORE`); the
//! `[backends]` table resolves that name to a base URL. The inbound request is
//! replayed against `{base_url}{path}?{query}` with its method, headers and body
//! intact, minus hop-by-hop headers. The backend's response, redirects
//! included, is streamed back unchanged.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use bytes::Bytes;
use reqwest::{redirect, Client};
use tracing::{debug, warn};

use crate::{config::BackendConfig, error::GatewayError};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

#[derive(Debug, Clone)]
struct Target {
    base_url: String,
    timeout: Duration,
}

/// Resolves backend names and replays requests against them.
///
/// One [`Client`] serves every backend; per-backend timeouts are applied per
/// request.
pub struct Forwarder {
    client: Client,
    targets: HashMap<String, Target>,
    max_body_bytes: usize,
}

impl Forwarder {
    pub fn new(
        backends: &HashMap<String, BackendConfig>,
        max_body_bytes: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .context("building reqwest client")?;

        let targets = backends
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    Target {
                        base_url: cfg.base_url.trim_end_matches('/').to_string(),
                        timeout: Duration::from_millis(cfg.timeout_ms),
                    },
                )
            })
            .collect();

        Ok(Self {
            client,
            targets,
            max_body_bytes,
        })
    }

    /// Address and timeout for a logical backend name.
    fn resolve(&self, backend: &str) -> Option<&Target> {
        self.targets.get(backend)
    }

    /// Replay `req` against `backend` and return its response.
    ///
    /// # Errors
    /// [`GatewayError::UnknownBackend`] if the name does not resolve,
    /// [`GatewayError::RequestBody`] if the body cannot be read within the size
    /// limit, [`GatewayError::Upstream`] on any transport failure.
    pub async fn forward(&self, backend: &str, req: Request) -> Result<Response, GatewayError> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path();

        let Some(target) = self.resolve(backend) else {
            warn!(component = "proxy", backend, path, "route points at an unconfigured backend");
            return Err(GatewayError::UnknownBackend(backend.to_owned()));
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", target.base_url, path_and_query);

        let body: Bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| {
                warn!(
                    component = "proxy",
                    backend,
                    path,
                    error = %e,
                    "could not read request body"
                );
                GatewayError::RequestBody(e.to_string())
            })?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let host = headers.remove(header::HOST);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        add_forwarded_headers(&mut headers, peer, host);

        debug!(backend, method = %parts.method, %url, "forwarding");

        let response = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .timeout(target.timeout)
            .body(body)
            .send()
            .await
            .map_err(|source| {
                warn!(
                    component = "proxy",
                    backend,
                    %url,
                    error = %source,
                    "backend request failed"
                );
                GatewayError::Upstream {
                    backend: backend.to_owned(),
                    source,
                }
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Remove connection-scoped headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn add_forwarded_headers(
    headers: &mut HeaderMap,
    peer: Option<SocketAddr>,
    host: Option<HeaderValue>,
) {
    if let Some(peer) = peer {
        let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers
        .entry(X_FORWARDED_PROTO)
        .or_insert(HeaderValue::from_static("http"));
}
