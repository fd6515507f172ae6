//! Session handlers for the relay server.
//!
//! This module handles the session lifecycle and inbound frame processing.

use crate::bridge::UpstreamBridge;
use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::{merge_fields, Origin, Router as RelayRouter, RouterConfig, SessionId};
use relay_protocol::{codec, Envelope, EnvelopeCodec, ProtocolError, Topic};
use relay_transport::{ConnectionState, Connector, WebSocketConnector};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Arc<RelayRouter>,
    /// Inbound frame decoder.
    pub codec: EnvelopeCodec,
    /// Server configuration.
    pub config: Config,
    /// Upstream bridge state, once the bridge is running.
    pub upstream: Option<watch::Receiver<ConnectionState>>,
}

impl AppState {
    /// Create new app state, binding the configured mutators.
    ///
    /// # Errors
    ///
    /// Returns an error if a mutator names an invalid topic.
    pub fn new(config: Config) -> Result<Self> {
        let router = RelayRouter::with_config(RouterConfig::from(&config.routing));

        for mutator in &config.mutators {
            let topic = Topic::parse(mutator.topic.as_str())
                .with_context(|| format!("Invalid mutator topic {:?}", mutator.topic))?;
            info!(topic = %topic, fields = mutator.merge.len(), "Binding mutator");
            router
                .mutators()
                .register(topic, merge_fields(mutator.merge.clone()));
        }

        Ok(Self {
            router: Arc::new(router),
            codec: EnvelopeCodec::new(config.transport.max_message_size),
            config,
            upstream: None,
        })
    }

    /// Start the upstream bridge over `connector` and track its state.
    pub fn start_bridge(&mut self, connector: Arc<dyn Connector>) -> JoinHandle<()> {
        let upstream = &self.config.upstream;
        let bridge = UpstreamBridge::new(connector, Arc::clone(&self.router), upstream.retry)
            .with_codec(EnvelopeCodec::new(upstream.max_message_size))
            .with_delay(Duration::from_millis(upstream.delay_ms));
        self.upstream = Some(bridge.state_changes());
        bridge.spawn()
    }

    /// Health report served on `/health`.
    #[must_use]
    pub fn health(&self) -> Value {
        let upstream = self
            .upstream
            .as_ref()
            .map(|state| state.borrow().to_string());
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "upstream": upstream,
            "stats": self.router.stats(),
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let mut state = AppState::new(config.clone())?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Start the upstream bridge if enabled
    let _bridge = if config.upstream.enabled {
        let url = config.upstream_url();
        info!("Upstream producer: {}", url);
        Some(state.start_bridge(Arc::new(WebSocketConnector::new(url))))
    } else {
        info!("Upstream bridge disabled");
        None
    };

    let app = build_app(Arc::new(state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.health())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.codec.max_frame_size())
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one session.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = SessionMetricsGuard::new();

    let (session, mut deliveries) = state.router.connect();
    debug!(session = %session, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Greet with the session id
    let greeting = Envelope::info(json!({
        "session": session,
        "version": env!("CARGO_PKG_VERSION"),
    }));
    match codec::encode(&greeting) {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                debug!(session = %session, "Failed to send greeting");
                state.router.disconnect(session);
                return;
            }
        }
        Err(e) => error!(session = %session, error = %e, "Failed to encode greeting"),
    }

    loop {
        tokio::select! {
            biased;

            // Envelopes routed to this session
            Some(envelope) = deliveries.recv() => {
                match codec::encode(&envelope) {
                    Ok(text) => {
                        metrics::record_message(text.len(), "outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session = %session, topic = %envelope.topic, error = %e, "Failed to encode delivery");
                    }
                }
            }

            // Frames from the session
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let decoded = state.codec.decode_text(&text);
                        ingest(&state, session, text.len(), decoded);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let decoded = state.codec.decode_binary(&data);
                        ingest(&state, session, data.len(), decoded);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(session = %session, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.router.disconnect(session);
    metrics::set_active_topics(state.router.stats().topic_count);

    debug!(session = %session, "WebSocket disconnected");
}

/// Route one decoded frame, dropping it if it was malformed.
fn ingest(
    state: &AppState,
    session: SessionId,
    size: usize,
    decoded: Result<Envelope, ProtocolError>,
) {
    metrics::record_message(size, "inbound");

    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(session = %session, error = %e, "Dropping malformed envelope");
            metrics::record_malformed("session");
            return;
        }
    };

    let is_control = envelope.is_control();
    let start = Instant::now();
    let delivered = state.router.route(Origin::Session(session), envelope);
    metrics::record_route(delivered, start.elapsed().as_secs_f64());

    if is_control {
        metrics::set_active_topics(state.router.stats().topic_count);
    }
}
