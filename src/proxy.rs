//! Engine-API multiplexing proxy.
//!
//! Sits between a consensus client and two execution clients. Every
//! JSON-RPC POST is forwarded to the primary upstream, whose response is
//! returned to the caller verbatim. When a secondary builder is
//! configured, a filtered copy is dispatched to it fire-and-forget:
//!
//! - `engine_getPayload*` is never sent (the secondary does not own the
//!   primary's payload-identifier namespace);
//! - `engine_forkchoiceUpdated*` has its second parameter overwritten with
//!   JSON `null`, keeping the secondary's chain head synchronized without
//!   triggering build requests it cannot serve;
//! - everything else is copied unchanged.
//!
//! Secondary failures are logged, never propagated; the caller only ever
//! observes the primary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Default multiplexer listen port
pub const DEFAULT_MUX_PORT: u16 = 5656;

/// Default primary upstream
pub const DEFAULT_PRIMARY: &str = "http://localhost:8551";

/// Total deadline for upstream round-trips and for graceful shutdown
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Listen port (0 for an ephemeral port)
    pub port: u16,
    /// Primary upstream URL; its responses are authoritative
    pub primary: String,
    /// Optional secondary builder URL
    pub secondary: Option<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MUX_PORT,
            primary: DEFAULT_PRIMARY.to_string(),
            secondary: None,
        }
    }
}

/// A JSON-RPC request, parsed tolerantly: unknown fields are ignored and
/// params are retained as raw values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<serde_json::Value>,
    /// Request id, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Method name
    pub method: String,
    /// Raw parameter values
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// Compute the body sent to the secondary builder, if any.
///
/// Prefix matching keeps versioned method names
/// (`engine_forkchoiceUpdatedV1/V2/V3`) covered.
pub fn secondary_payload(body: &Bytes, request: &JsonRpcRequest) -> Option<Bytes> {
    if request.method.starts_with("engine_getPayload") {
        debug!(method = %request.method, "not forwarded to secondary");
        return None;
    }
    if request.method.starts_with("engine_forkchoiceUpdated") {
        if request.params.len() < 2 {
            warn!(
                method = %request.method,
                params = request.params.len(),
                "forkchoice update without payload attributes, forwarding unchanged"
            );
            return Some(body.clone());
        }
        let mut stripped = request.clone();
        stripped.params[1] = serde_json::Value::Null;
        match serde_json::to_vec(&stripped) {
            Ok(bytes) => return Some(Bytes::from(bytes)),
            Err(err) => {
                error!(error = %err, "failed to marshal stripped forkchoice update");
                return None;
            }
        }
    }
    Some(body.clone())
}

struct MuxState {
    client: reqwest::Client,
    primary: String,
    secondary: Option<String>,
}

/// A running multiplexer server
pub struct EngineMux {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl EngineMux {
    /// Bind the listen socket and start serving.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound or the HTTP client cannot be
    /// constructed.
    pub async fn serve(config: MuxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        let state = Arc::new(MuxState {
            client,
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
        });

        let app = Router::new().route("/", post(handle)).with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| Error::custom(format!("failed to bind port {}: {e}", config.port)))?;
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            primary = %config.primary,
            secondary = config.secondary.as_deref().unwrap_or("none"),
            "engine multiplexer listening"
        );

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        Ok(Self { addr, cancel, task })
    }

    /// The bound listen address
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gracefully shut the server down, waiting at most ten seconds.
    pub async fn close(self) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(UPSTREAM_TIMEOUT, self.task).await {
            Ok(joined) => {
                joined
                    .map_err(|e| Error::custom(format!("multiplexer task panicked: {e}")))?
                    .map_err(|e| Error::custom(format!("multiplexer serve error: {e}")))?;
                Ok(())
            }
            Err(_) => Err(Error::timeout(UPSTREAM_TIMEOUT.as_secs())),
        }
    }
}

async fn handle(State(state): State<Arc<MuxState>>, headers: HeaderMap, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<JsonRpcRequest>(&body) {
        Ok(request) => Some(request),
        Err(err) => {
            // forwarded anyway; the primary owns protocol validation
            warn!(error = %err, "request body is not well-formed JSON-RPC");
            None
        }
    };

    let primary_response = forward_primary(&state, &headers, body.clone()).await;

    let (status, primary_body) = match primary_response {
        Ok(response) => {
            let status = response.status();
            match response.bytes().await {
                Ok(bytes) => (status, Ok(bytes)),
                Err(err) => {
                    error!(error = %err, "failed to read primary response body");
                    (status, Err(()))
                }
            }
        }
        Err(err) => {
            error!(error = %err, "primary request failed");
            // primary failed outright: nothing reaches the secondary
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // A body-read failure still feeds the secondary; the primary itself
    // accepted the request.
    if let (Some(secondary), Some(request)) = (state.secondary.clone(), &request) {
        if let Some(payload) = secondary_payload(&body, request) {
            dispatch_secondary(Arc::clone(&state), secondary, payload, &headers);
        }
    }

    match primary_body {
        Ok(bytes) => {
            let status = StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response()
        }
        Err(()) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn forward_primary(
    state: &MuxState,
    headers: &HeaderMap,
    body: Bytes,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let mut request = state.client.post(&state.primary).body(body);
    for (name, value) in copy_headers(headers) {
        request = request.header(name, value);
    }
    request.send().await
}

fn dispatch_secondary(state: Arc<MuxState>, url: String, payload: Bytes, headers: &HeaderMap) {
    let forwarded = copy_headers(headers);
    // fire-and-forget: the caller's response is already on its way out
    tokio::spawn(async move {
        let mut request = state.client.post(&url).body(payload);
        for (name, value) in forwarded {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                error!(url = %url, status = %response.status(), "secondary builder rejected request");
            }
            Ok(_) => {}
            Err(err) => {
                error!(url = %url, error = %err, "secondary builder request failed");
            }
        }
    });
}

// HTTP/1.1 hop-by-hop headers, never forwarded upstream
const HOP_BY_HOP: [&str; 8] = [
    "keep-alive",
    "transfer-encoding",
    "te",
    "connection",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

// Caller headers forwarded to both upstreams, the Authorization JWT
// included. Host and content-length are regenerated by the client.
fn copy_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP.contains(&name) && name != "host" && name != "content-length"
        })
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}
