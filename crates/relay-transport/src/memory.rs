//! In-process transport.
//!
//! [`MemoryConnector`] hands the far end of every connection it opens to a
//! [`MemoryListener`]. Useful for embedding and for exercising reconnect
//! logic without sockets.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Connection, Connector, RawFrame, TransportError};

const ENDPOINT: &str = "memory://relay";

/// Connector side of an in-process transport.
#[derive(Debug)]
pub struct MemoryConnector {
    listener: mpsc::UnboundedSender<MemoryConnection>,
    attempts: AtomicUsize,
    refusing: AtomicBool,
}

/// Accepting side of an in-process transport.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// Create a connected connector/listener pair.
#[must_use]
pub fn channel() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            listener: tx,
            attempts: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
        },
        MemoryListener { incoming: rx },
    )
}

impl MemoryConnector {
    /// Number of connect attempts made so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connect attempts fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = || TransportError::ConnectFailed {
            endpoint: ENDPOINT.to_string(),
            reason: "connection refused".to_string(),
        };

        if self.refusing.load(Ordering::SeqCst) {
            return Err(refused());
        }

        let (near, far) = MemoryConnection::pair();
        self.listener.send(far).map_err(|_| refused())?;
        trace!("Memory connection opened");
        Ok(Box::new(near))
    }

    fn endpoint(&self) -> &str {
        ENDPOINT
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    ///
    /// Returns `None` once the connector is dropped.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.recv().await
    }

    /// Take an already-opened connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.try_recv().ok()
    }
}

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    outgoing: Option<mpsc::UnboundedSender<RawFrame>>,
    incoming: mpsc::UnboundedReceiver<RawFrame>,
}

impl MemoryConnection {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: Some(a_tx),
                incoming: b_rx,
            },
            Self {
                outgoing: Some(b_tx),
                incoming: a_rx,
            },
        )
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<RawFrame>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn send(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outgoing
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outgoing = None;
        self.incoming.close();
        Ok(())
    }
}
