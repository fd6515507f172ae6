//! Session identity and message origin.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter so ids are never reused while the relay runs.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of this id.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess_{}", self.0)
    }
}

/// Where an envelope entered the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The upstream producer, via the bridge.
    Producer,
    /// A connected session.
    Session(SessionId),
}

impl Origin {
    /// The sending session, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Origin::Producer => None,
            Origin::Session(id) => Some(*id),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Producer => f.write_str("producer"),
            Origin::Session(id) => id.fmt(f),
        }
    }
}
