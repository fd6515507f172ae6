//! # relay-client
//!
//! Consumer-side facade for the telemetry relay.
//!
//! A [`RelayClient`] keeps one connection to the relay open in the
//! background and turns topic subscriptions into local callbacks:
//!
//! ```rust,ignore
//! use relay_client::{ClientOptions, RelayClient};
//!
//! let client = RelayClient::connect("ws://localhost:49322", ClientOptions::default());
//! client.subscribe("game", "goal_scored", |payload| {
//!     println!("goal: {payload}");
//! })?;
//!
//! // Same-process only; never sent to the relay.
//! client.send("local", "overlay_toggle", serde_json::json!(true))?;
//! ```
//!
//! Subscriptions made before the connection opens are queued and sent in
//! order once it does. After a reconnect every known topic is registered
//! again, unless [`ClientOptions::resubscribe_on_reconnect`] is turned off.

mod client;

pub use client::{Callback, ClientError, ClientOptions, RelayClient};
pub use relay_transport::{ConnectionState, RetryPolicy};
