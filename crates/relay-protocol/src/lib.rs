//! # relay-protocol
//!
//! Wire protocol definitions for the telemetry relay.
//!
//! Every message on the wire is an [`Envelope`]: a [`Topic`] of the form
//! `"<channel>:<event>"` plus an opaque JSON payload.
//!
//! ## Reserved channels
//!
//! - `relay` - control functions (`register`, `unregister`, `info`)
//! - `local` - client-side loopback, never sent over the network
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Envelope, Topic};
//! use serde_json::json;
//!
//! let topic = Topic::parse("game:goal_scored").unwrap();
//! let envelope = Envelope::new(topic, json!({"scorer": "X"}));
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod topic;

pub use codec::{decode, encode, EnvelopeCodec, ProtocolError};
pub use envelope::{ControlFunction, Envelope, CONTROL_CHANNEL, LOOPBACK_CHANNEL};
pub use topic::Topic;
