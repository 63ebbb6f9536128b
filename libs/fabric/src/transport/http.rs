use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_core::Envelope;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::codec::{BincodeCodec, Codec, Format};
use crate::error::{Error, Result};
use crate::task::ListenerSlot;
use crate::transport::{InboundSink, Protocol};

/// Path peers push envelopes to
pub const MESSAGE_PATH: &str = "/message";
/// Path answering reachability probes
pub const HEALTH_PATH: &str = "/health";

/// HTTP push transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
    /// Default endpoint, e.g. `http://10.0.0.2:8765`
    pub peer: Option<String>,
    /// Per-recipient endpoints, consulted before `peer`
    pub peers: HashMap<String, String>,
    pub request_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub format: Format,
}

impl HttpConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn with_route(mut self, recipient: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.peers.insert(recipient.into(), endpoint.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Endpoints an envelope for `recipient` goes to
    fn endpoints_for(&self, recipient: &str, broadcast: bool) -> Result<Vec<&str>> {
        let endpoints: Vec<&str> = if broadcast {
            let mut all: Vec<&str> = self
                .peer
                .iter()
                .chain(self.peers.values())
                .map(String::as_str)
                .collect();
            all.sort_unstable();
            all.dedup();
            all
        } else {
            self.peers
                .get(recipient)
                .or(self.peer.as_ref())
                .map(String::as_str)
                .into_iter()
                .collect()
        };

        if endpoints.is_empty() {
            return Err(Error::NoRoute(recipient.to_string()));
        }
        Ok(endpoints)
    }

    /// Endpoints probed by the health check
    fn probe_targets(&self) -> Vec<&str> {
        match &self.peer {
            Some(peer) => vec![peer.as_str()],
            None => self.peers.values().map(String::as_str).collect(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            peer: None,
            peers: HashMap::new(),
            request_timeout_ms: 2000,
            health_timeout_ms: 300,
            format: Format::Bincode,
        }
    }
}

fn url(endpoint: &str, path: &str) -> String {
    format!("{}{}", endpoint.trim_end_matches('/'), path)
}

/// Cross-host delivery: POSTs envelopes to peers and serves an inbound endpoint
///
/// `initialize` binds the listening socket, so a port clash surfaces as a
/// configuration error before anything is registered as available.
pub struct HttpProtocol<C = BincodeCodec> {
    config: HttpConfig,
    codec: C,
    client: OnceLock<reqwest::Client>,
    local_addr: OnceLock<SocketAddr>,
    bound: Mutex<Option<TcpListener>>,
    listener: ListenerSlot,
}

impl HttpProtocol<BincodeCodec> {
    pub fn new(config: HttpConfig) -> Self {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<C: Codec + Clone + 'static> HttpProtocol<C> {
    pub fn with_codec(config: HttpConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            client: OnceLock::new(),
            local_addr: OnceLock::new(),
            bound: Mutex::new(None),
            listener: ListenerSlot::new(),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Address the inbound endpoint is bound to, once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Base URL peers should use to reach this node
    pub fn endpoint(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{addr}"))
    }

    async fn post(&self, client: &reqwest::Client, endpoint: &str, body: Vec<u8>) -> Result<()> {
        let response = client
            .post(url(endpoint, MESSAGE_PATH))
            .header(reqwest::header::CONTENT_TYPE, self.codec.content_type())
            .timeout(self.config.request_timeout())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rejected(status.as_u16()));
        }
        Ok(())
    }

    async fn probe(&self, client: &reqwest::Client, endpoint: &str) -> bool {
        let request = client
            .get(url(endpoint, HEALTH_PATH))
            .timeout(self.config.health_timeout())
            .send();

        match request.await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(%endpoint, error = %e, "peer health probe failed");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: Codec + Clone + 'static> Protocol for HttpProtocol<C> {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn initialize(&self) -> Result<()> {
        let mut bound = self.bound.lock().await;
        if self.local_addr.get().is_some() {
            return Ok(());
        }

        let addr: SocketAddr = self.config.listen_addr.parse().map_err(|e| {
            Error::Config(format!("invalid listen address {:?}: {e}", self.config.listen_addr))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        let _ = self.client.set(client);
        let _ = self.local_addr.set(local_addr);
        *bound = Some(listener);

        tracing::debug!(%local_addr, peer = ?self.config.peer, "http protocol initialized");
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let client = self.client.get().ok_or(Error::NotInitialized)?;
        let endpoints = self
            .config
            .endpoints_for(&envelope.recipient, envelope.is_broadcast())?;
        let body = self.codec.encode(envelope)?;

        for endpoint in endpoints {
            self.post(client, endpoint, body.clone()).await?;
        }
        Ok(())
    }

    async fn start_listening(&self, sink: InboundSink) -> Result<()> {
        let listener = {
            let mut bound = self.bound.lock().await;
            match bound.take() {
                Some(listener) => listener,
                None if self.local_addr.get().is_some() => return Err(Error::AlreadyListening),
                None => return Err(Error::NotInitialized),
            }
        };

        let state = ServerState {
            sink,
            codec: self.codec.clone(),
        };
        let app = Router::new()
            .route(MESSAGE_PATH, post(receive_message::<C>))
            .route(HEALTH_PATH, get(health))
            .with_state(state);

        self.listener
            .start("http-listener", move |signal| async move {
                let shutdown = async move { signal.stopped().await };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "http listener failed");
                }
            })
            .await
    }

    async fn stop_listening(&self) -> Result<()> {
        if self.listener.stop().await {
            tracing::debug!(local_addr = ?self.local_addr(), "http listener stopped");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let Some(client) = self.client.get() else {
            return false;
        };

        let targets = self.config.probe_targets();
        if targets.is_empty() {
            return true;
        }

        for endpoint in targets {
            if self.probe(client, endpoint).await {
                return true;
            }
        }
        false
    }
}

#[derive(Clone)]
struct ServerState<C> {
    sink: InboundSink,
    codec: C,
}

async fn receive_message<C: Codec + Clone + 'static>(
    State(state): State<ServerState<C>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let envelope: Envelope = match state.codec.decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "rejecting malformed envelope");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };

    match state.sink.deliver(envelope).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "kind": "http" }))
}
