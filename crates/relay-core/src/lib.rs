//! # relay-core
//!
//! Subscription registry and message routing for the telemetry relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **SessionRegistry** - which session listens to which topic
//! - **MutatorPipeline** - per-topic payload rewriting before fan-out
//! - **Router** - control handling and fan-out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session /  │────▶│   Router    │────▶│  Mutators   │────▶│  Registry   │
//! │  Producer   │     └─────────────┘     └─────────────┘     │   lookup    │
//! └─────────────┘                                             └──────┬──────┘
//!                                                                    ▼
//!                                                             fan-out to sessions
//! ```

pub mod mutator;
pub mod registry;
pub mod router;
pub mod session;

pub use mutator::{merge_fields, Mutator, MutatorPipeline};
pub use registry::SessionRegistry;
pub use router::{Router, RouterConfig, RouterStats, SessionReceiver};
pub use session::{Origin, SessionId};
