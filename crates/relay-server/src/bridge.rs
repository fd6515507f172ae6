//! Upstream bridge.
//!
//! Holds the relay's single outbound connection to the telemetry producer,
//! decodes what it sends (accepting the legacy base64 text encoding too) and
//! hands every envelope to the router as [`Origin::Producer`]. The
//! connection is reopened forever, spaced by a [`RetryPolicy`].

use crate::metrics;
use relay_core::{Origin, Router};
use relay_protocol::{Envelope, EnvelopeCodec};
use relay_transport::{Connection, ConnectionState, Connector, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as Due;
use tracing::{debug, info, warn};

/// Outbound link to the producer.
pub struct UpstreamBridge {
    connector: Arc<dyn Connector>,
    router: Arc<Router>,
    codec: EnvelopeCodec,
    retry: RetryPolicy,
    delay: Duration,
    state: watch::Sender<ConnectionState>,
}

impl UpstreamBridge {
    /// Create a bridge that routes into `router`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, router: Arc<Router>, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            connector,
            router,
            codec: EnvelopeCodec::default(),
            retry,
            delay: Duration::ZERO,
            state,
        }
    }

    /// Hold every envelope for `delay` before routing it.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Decode frames with `codec`.
    #[must_use]
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Watch the connection state.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run the bridge on the current runtime until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let injector = Injector::start(Arc::clone(&self.router), self.delay);
        let mut failures: u32 = 0;

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            metrics::record_upstream_connect();

            match self.connector.connect().await {
                Ok(conn) => {
                    failures = 0;
                    self.state.send_replace(ConnectionState::Open);
                    info!(endpoint = self.connector.endpoint(), "Connected to upstream");
                    self.pump(conn, &injector).await;
                    info!(endpoint = self.connector.endpoint(), "Upstream connection closed");
                }
                Err(e) => {
                    warn!(endpoint = self.connector.endpoint(), error = %e, "Upstream unavailable");
                }
            }

            self.state.send_replace(ConnectionState::Closed);
            let delay = self.retry.delay(failures);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting upstream after delay");
            tokio::time::sleep(delay).await;
            failures = failures.saturating_add(1);
        }
    }

    /// Read frames until the connection ends.
    async fn pump(&self, mut conn: Box<dyn Connection>, injector: &Injector) {
        loop {
            match conn.recv().await {
                Ok(Some(frame)) => {
                    metrics::record_message(frame.len(), "upstream");
                    match frame.decode_lenient(&self.codec) {
                        Ok(envelope) => injector.inject(envelope),
                        Err(e) => {
                            debug!(error = %e, "Dropping malformed upstream frame");
                            metrics::record_malformed("upstream");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Upstream receive failed");
                    break;
                }
            }
        }

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Upstream close failed");
        }
    }
}

/// Hands producer envelopes to the router, optionally after a fixed delay.
///
/// Delayed envelopes are stamped with their due time and released by a
/// single task, so they keep arrival order while reading continues.
enum Injector {
    Immediate(Arc<Router>),
    Delayed {
        delay: Duration,
        queue: mpsc::UnboundedSender<(Due, Envelope)>,
    },
}

impl Injector {
    fn start(router: Arc<Router>, delay: Duration) -> Self {
        if delay.is_zero() {
            return Injector::Immediate(router);
        }

        let (queue, mut pending) = mpsc::unbounded_channel::<(Due, Envelope)>();
        tokio::spawn(async move {
            while let Some((due, envelope)) = pending.recv().await {
                tokio::time::sleep_until(due).await;
                route(&router, envelope);
            }
        });
        Injector::Delayed { delay, queue }
    }

    fn inject(&self, envelope: Envelope) {
        match self {
            Injector::Immediate(router) => route(router, envelope),
            Injector::Delayed { delay, queue } => {
                let due = Due::now() + *delay;
                if queue.send((due, envelope)).is_err() {
                    warn!("Delay queue closed; dropping upstream envelope");
                }
            }
        }
    }
}

fn route(router: &Router, envelope: Envelope) {
    let start = Instant::now();
    let delivered = router.route(Origin::Producer, envelope);
    metrics::record_route(delivered, start.elapsed().as_secs_f64());
}
