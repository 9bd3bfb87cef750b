//! Reverse proxy that load-balances over registered greeter instances.
//!
//! Every request resolves the upstream service through the directory, so
//! instances that come and go are picked up without a restart.

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use naming::{DirectoryLookup, EndpointResolver};
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;

#[derive(Clone)]
pub struct GatewayState {
    resolver: Arc<EndpointResolver>,
    http: reqwest::Client,
    upstream: Arc<str>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(lookup: Arc<dyn DirectoryLookup>, cfg: &GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build gateway HTTP client")?;
        Ok(Self {
            resolver: Arc::new(EndpointResolver::new(lookup)),
            http,
            upstream: Arc::from(cfg.upstream_service.as_str()),
        })
    }
}

/// Every path is forwarded to the upstream service.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(forward).with_state(state)
}

/// Bind `gateway.listen` and proxy until `shutdown` fires.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run(
    cfg: &GatewayConfig,
    lookup: Arc<dyn DirectoryLookup>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind gateway on {}", cfg.listen))?;
    serve(listener, cfg, lookup, shutdown).await
}

/// Proxy on an already bound listener.
///
/// # Errors
/// Returns an error if the HTTP client cannot be built or the server fails.
pub async fn serve(
    listener: TcpListener,
    cfg: &GatewayConfig,
    lookup: Arc<dyn DirectoryLookup>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = GatewayState::new(lookup, cfg)?;
    let local = listener
        .local_addr()
        .context("gateway listener has no local address")?;
    tracing::info!(listen = %local, upstream = %cfg.upstream_service, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("gateway server failed")?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn forward(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = match state.resolver.resolve(&state.upstream).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(upstream = %state.upstream, error = %e, "No upstream to forward to");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e);
        }
    };

    let path = uri.path_and_query().map_or("/", PathAndQuery::as_str);
    let url = format!("http://{}{path}", endpoint.address);
    tracing::debug!(%method, %url, "Forwarding request");

    let mut request = state.http.request(method, &url).body(body);
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        request = request.header(header::CONTENT_TYPE, content_type.clone());
    }

    let upstream = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(%url, error = %e, "Upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, &e);
        }
    };

    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(%url, error = %e, "Upstream response body failed");
            return error_response(StatusCode::BAD_GATEWAY, &e);
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

fn error_response(status: StatusCode, err: &dyn Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
