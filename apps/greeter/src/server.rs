//! Greeter HTTP service and its registration lifecycle.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use naming::{DirectoryClient, Endpoint, Registrar, RegistrarState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

pub const SAY_HELLO_PATH: &str = "/v1/greeter/say_hello";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Clone)]
struct GreeterState {
    /// Address this instance is registered under.
    address: Arc<str>,
}

/// Routes of one greeter instance reachable at `address`.
#[must_use]
pub fn router(address: &str) -> Router {
    Router::new()
        .route(SAY_HELLO_PATH, post(say_hello))
        .with_state(GreeterState {
            address: Arc::from(address),
        })
}

async fn say_hello(
    State(state): State<GreeterState>,
    Json(req): Json<HelloRequest>,
) -> Json<HelloReply> {
    tracing::debug!(name = %req.name, "say_hello");
    Json(HelloReply {
        message: format!("{} world of {}", req.name, state.address),
    })
}

/// Bind `server.listen` and run the greeter until `shutdown` fires.
///
/// # Errors
/// See [`serve`].
pub async fn run(
    cfg: &AppConfig,
    client: Arc<dyn DirectoryClient>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("failed to bind greeter on {}", cfg.server.listen))?;
    serve(listener, cfg, client, shutdown).await
}

/// Serve on `listener`, register, wait, unregister, stop.
///
/// The endpoint is registered once the listener accepts connections and
/// unregistered before the HTTP server stops.
///
/// # Errors
/// Returns an error if the initial registration fails or if the lease cannot
/// be revoked at shutdown. Losing the registration later on is only logged.
pub async fn serve(
    listener: TcpListener,
    cfg: &AppConfig,
    client: Arc<dyn DirectoryClient>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("greeter listener has no local address")?;
    let address = cfg
        .server
        .advertise
        .clone()
        .unwrap_or_else(|| local.to_string());

    let stop_http = CancellationToken::new();
    let app = router(&address);
    let http = tokio::spawn({
        let stop = stop_http.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        }
    });
    tracing::info!(listen = %local, %address, "Greeter listening");

    let endpoint = Endpoint::new(cfg.server.name.clone(), address);
    let mut registrar: Registrar = Registrar::new(client, endpoint, cfg.registrar.clone());
    let outcome = match registrar.register().await {
        Ok(()) => {
            serve_until_shutdown(&registrar, &shutdown).await;
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("initial registration failed")),
    };

    // Also revokes a lease left behind by a half-finished registration.
    let unregistered = registrar.unregister().await;
    stop_http.cancel();
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Greeter server failed"),
        Err(e) => tracing::warn!(error = %e, "Greeter server task failed"),
    }

    outcome?;
    unregistered.context("failed to unregister greeter")?;
    tracing::info!("Greeter stopped");
    Ok(())
}

/// Wait for `shutdown`. A registration that is lost for good is reported
/// but does not stop the instance from serving traffic.
async fn serve_until_shutdown(registrar: &Registrar, shutdown: &CancellationToken) {
    let mut status = registrar.status();
    let lost = tokio::select! {
        () = shutdown.cancelled() => false,
        res = status.wait_for(|s| *s == RegistrarState::Lost) => res.is_ok(),
    };
    if lost {
        tracing::error!(
            key = %registrar.key(),
            "Registration lost, serving without a directory entry until shutdown"
        );
        shutdown.cancelled().await;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt as _;

    #[tokio::test]
    async fn say_hello_names_the_instance() {
        let req = Request::post(SAY_HELLO_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"hello"}"#))
            .unwrap();

        let resp = router("10.0.0.1:50051").oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let reply: HelloReply = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply.message, "hello world of 10.0.0.1:50051");
    }

    #[tokio::test]
    async fn say_hello_rejects_malformed_body() {
        let req = Request::post(SAY_HELLO_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{"))
            .unwrap();

        let resp = router("10.0.0.1:50051").oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }
}
