//! Session registry.
//!
//! Tracks which sessions are subscribed to which topics. Two indexes are kept:
//!
//! - topic -> subscriber set, each set behind its own lock so unrelated
//!   topics never contend with each other;
//! - session -> topic set, so teardown only touches the topics that session
//!   actually subscribed to.

use crate::session::SessionId;
use dashmap::DashMap;
use relay_protocol::Topic;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Subscribers of one topic.
#[derive(Debug, Default)]
struct Subscribers {
    members: HashSet<SessionId>,
    /// Set once the slot is unlinked from the map; writers that raced the
    /// removal retry against a fresh slot.
    retired: bool,
}

type Slot = Arc<RwLock<Subscribers>>;

/// Concurrent topic subscription registry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    topics: DashMap<Topic, Slot>,
    sessions: DashMap<SessionId, HashSet<Topic>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to a topic.
    ///
    /// Returns `false` if the session was already subscribed (a no-op).
    pub fn register(&self, session: SessionId, topic: &Topic) -> bool {
        let added = self
            .sessions
            .entry(session)
            .or_default()
            .insert(topic.clone());

        if !added {
            debug!(session = %session, topic = %topic, "Duplicate registration ignored");
            return false;
        }

        loop {
            let slot = Arc::clone(&*self.topics.entry(topic.clone()).or_default());
            let mut subscribers = slot.write().unwrap_or_else(PoisonError::into_inner);
            if subscribers.retired {
                continue;
            }
            subscribers.members.insert(session);
            break;
        }

        debug!(session = %session, topic = %topic, "Registered");
        true
    }

    /// Unsubscribe a session from a topic.
    ///
    /// Returns `false` if the session was not subscribed (a no-op).
    pub fn unregister(&self, session: SessionId, topic: &Topic) -> bool {
        let removed = self
            .sessions
            .get_mut(&session)
            .map(|mut topics| topics.remove(topic))
            .unwrap_or(false);

        if !removed {
            debug!(session = %session, topic = %topic, "Redundant unregistration ignored");
            return false;
        }

        self.detach(session, topic);
        debug!(session = %session, topic = %topic, "Unregistered");
        true
    }

    /// Remove a session from every topic it subscribed to.
    ///
    /// Returns the number of subscriptions dropped.
    pub fn teardown(&self, session: SessionId) -> usize {
        let Some((_, topics)) = self.sessions.remove(&session) else {
            return 0;
        };

        for topic in &topics {
            self.detach(session, topic);
        }

        debug!(session = %session, subscriptions = topics.len(), "Session torn down");
        topics.len()
    }

    /// Snapshot of the sessions subscribed to a topic.
    ///
    /// The returned list is owned by the caller and is unaffected by
    /// registrations or teardowns that happen while it is being used.
    #[must_use]
    pub fn lookup(&self, topic: &Topic) -> Vec<SessionId> {
        let Some(slot) = self.topics.get(topic).map(|slot| Arc::clone(&*slot)) else {
            return Vec::new();
        };
        let subscribers = slot.read().unwrap_or_else(PoisonError::into_inner);
        subscribers.members.iter().copied().collect()
    }

    /// Whether a session is subscribed to a topic.
    #[must_use]
    pub fn is_registered(&self, session: SessionId, topic: &Topic) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|topics| topics.contains(topic))
    }

    /// Topics a session is subscribed to.
    #[must_use]
    pub fn session_topics(&self, session: SessionId) -> Vec<Topic> {
        self.sessions
            .get(&session)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscriptions held by a session.
    #[must_use]
    pub fn subscription_count(&self, session: SessionId) -> usize {
        self.sessions
            .get(&session)
            .map(|topics| topics.len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of sessions that have registered since their last teardown.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of (session, topic) subscriptions.
    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.sessions.iter().map(|topics| topics.len()).sum()
    }

    /// Remove `session` from the topic's subscriber set, unlinking the slot
    /// when it becomes empty.
    fn detach(&self, session: SessionId, topic: &Topic) {
        let Some(slot) = self.topics.get(topic).map(|slot| Arc::clone(&*slot)) else {
            return;
        };

        let mut subscribers = slot.write().unwrap_or_else(PoisonError::into_inner);
        subscribers.members.remove(&session);

        if subscribers.members.is_empty() {
            subscribers.retired = true;
            self.topics
                .remove_if(topic, |_, current| Arc::ptr_eq(current, &slot));
        }
    }
}
