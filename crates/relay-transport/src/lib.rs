//! # relay-transport
//!
//! Outbound connection layer for the telemetry relay.
//!
//! Both the relay's upstream bridge and the client facade keep exactly one
//! outbound connection alive. They dial through a [`Connector`] and talk
//! over a [`Connection`]:
//!
//! - **WebSocket** - the real network transport
//! - **Memory** - in-process pair, for embedding and tests
//!
//! How long to wait between connect attempts is a [`RetryPolicy`].
//!
//! ```rust,ignore
//! use relay_transport::{Connector, WebSocketConnector};
//!
//! async fn pump(connector: &dyn Connector) {
//!     let mut conn = connector.connect().await?;
//!     while let Some(frame) = conn.recv().await? {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod retry;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use retry::RetryPolicy;
pub use traits::{Connection, ConnectionState, Connector, RawFrame, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
