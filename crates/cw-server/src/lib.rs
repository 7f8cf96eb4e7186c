// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use axum::{
    Router,
    extract::{FromRequest, FromRequestParts, Request, State, ws::WebSocketUpgrade},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::any,
};
use cw_error::RpcError;
use cw_rpc::{BatchClient, RpcSession, RpcTarget, SessionConfig, Value, serve_batch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

pub mod ws;

/// Builds one main capability per connection or batch.
pub type MainFactory = Arc<dyn Fn() -> Arc<dyn RpcTarget> + Send + Sync>;

/// Shared endpoint state.
#[derive(Clone)]
pub struct AppState {
    main_factory: MainFactory,
}

impl AppState {
    /// State whose sessions call `factory` for their main capability.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RpcTarget> + Send + Sync + 'static,
    {
        Self {
            main_factory: Arc::new(factory),
        }
    }

    fn new_main(&self) -> Arc<dyn RpcTarget> {
        (self.main_factory)()
    }
}

/// Build the axum router: `/` and `/rpc` both speak WebSocket and batch.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", any(rpc_endpoint))
        .route("/rpc", any(rpc_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The unified endpoint: `Upgrade: websocket` selects duplex mode, `POST`
/// selects batch mode, anything else is a `400`.
async fn rpc_endpoint(State(state): State<AppState>, request: Request) -> Response {
    let wants_upgrade = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if wants_upgrade {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade
                .on_upgrade(move |socket| ws::serve_socket(socket, state))
                .into_response(),
            Err(rejection) => rejection.into_response(),
        };
    }

    if request.method() == Method::POST {
        let body = match String::from_request(request, &()).await {
            Ok(body) => body,
            Err(rejection) => return rejection.into_response(),
        };
        debug!(target: "cw_server", bytes = body.len(), "batch request");
        let response = serve_batch(state.new_main(), &body).await;
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response();
    }

    (
        StatusCode::BAD_REQUEST,
        "This endpoint only accepts POST or WebSocket requests.",
    )
        .into_response()
}

/// Bind a listener and serve the app until the task is dropped.
///
/// Returns the bound address, useful with a `:0` port.
pub async fn serve(
    bind: &str,
    state: AppState,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let app = build_app(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(target: "cw_server", error = %e, "server stopped");
        }
    });
    info!(target: "cw_server", %addr, "capnweb endpoint listening");
    Ok((addr, handle))
}

// ---------------------------------------------------------------------------
// HTTP batch client
// ---------------------------------------------------------------------------

/// Single-shot batch exchanges against an HTTP endpoint.
pub struct BatchHttpClient {
    url: String,
    http: reqwest::Client,
}

impl BatchHttpClient {
    /// A client posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Post the queued batch and decode the response into per-call
    /// outcomes.
    pub async fn execute(
        &self,
        batch: BatchClient,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(batch.body())
            .send()
            .await
            .map_err(|e| RpcError::disconnected(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::protocol(format!(
                "batch endpoint answered {status}"
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| RpcError::disconnected(e.to_string()))?;
        batch.apply_response(&text)
    }
}

// ---------------------------------------------------------------------------
// WebSocket client
// ---------------------------------------------------------------------------

/// Connect to a capnweb WebSocket endpoint and start a client session.
pub async fn connect(url: &str, config: SessionConfig) -> Result<RpcSession, RpcError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| RpcError::disconnected(format!("websocket connect failed: {e}")))?;
    Ok(ws::client_session(stream, config))
}
