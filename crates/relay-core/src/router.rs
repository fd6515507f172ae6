//! Message router for the relay.
//!
//! The router owns the session registry and the mutator pipeline. Control
//! messages (`relay:register`, `relay:unregister`) update the sender's
//! subscriptions; every other message is mutated and fanned out to the
//! topic's subscribers.

use crate::mutator::MutatorPipeline;
use crate::registry::SessionRegistry;
use crate::session::{Origin, SessionId};
use dashmap::DashMap;
use relay_protocol::{ControlFunction, Envelope};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Receiving half of a session's delivery queue.
pub type SessionReceiver = mpsc::UnboundedReceiver<Arc<Envelope>>;

type SessionSender = mpsc::UnboundedSender<Arc<Envelope>>;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Do not deliver a session's own messages back to it.
    pub echo_suppression: bool,
    /// Maximum subscriptions per session.
    pub max_subscriptions_per_session: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            echo_suppression: true,
            max_subscriptions_per_session: 256,
        }
    }
}

/// The central message router.
///
/// Shared by reference across every connection handler and the upstream
/// bridge. No method blocks except a mutator call.
pub struct Router {
    registry: SessionRegistry,
    mutators: MutatorPipeline,
    /// Delivery queues of live sessions.
    sessions: DashMap<SessionId, SessionSender>,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            registry: SessionRegistry::new(),
            mutators: MutatorPipeline::new(),
            sessions: DashMap::new(),
            config,
        }
    }

    /// The router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The mutator pipeline.
    #[must_use]
    pub fn mutators(&self) -> &MutatorPipeline {
        &self.mutators
    }

    /// Open a session.
    ///
    /// Returns the new session id and the queue its deliveries arrive on.
    pub fn connect(&self) -> (SessionId, SessionReceiver) {
        let id = SessionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(id, tx);
        debug!(session = %id, "Session opened");
        (id, rx)
    }

    /// Close a session and drop all of its subscriptions.
    pub fn disconnect(&self, session: SessionId) {
        self.sessions.remove(&session);
        let dropped = self.registry.teardown(session);
        debug!(session = %session, subscriptions = dropped, "Session closed");
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_connected(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Route one envelope.
    ///
    /// Returns the number of sessions it was delivered to. Control messages
    /// are never delivered and return 0. Failures are logged, never returned.
    pub fn route(&self, origin: Origin, envelope: Envelope) -> usize {
        match envelope.control_function() {
            Some(function) => {
                self.handle_control(origin, function, &envelope);
                0
            }
            None => self.fan_out(origin, envelope),
        }
    }

    fn handle_control(&self, origin: Origin, function: ControlFunction, envelope: &Envelope) {
        let Some(session) = origin.session() else {
            debug!(function = ?function, "Ignoring control message from producer");
            return;
        };
        if !self.is_connected(session) {
            debug!(session = %session, "Ignoring control message from closed session");
            return;
        }

        match function {
            ControlFunction::Register => {
                for topic in envelope.control_topics() {
                    match topic {
                        Ok(topic) => self.register(session, &topic),
                        Err(e) => debug!(session = %session, error = %e, "Skipping register entry"),
                    }
                }
            }
            ControlFunction::Unregister => {
                for topic in envelope.control_topics() {
                    match topic {
                        Ok(topic) => {
                            self.registry.unregister(session, &topic);
                        }
                        Err(e) => {
                            debug!(session = %session, error = %e, "Skipping unregister entry")
                        }
                    }
                }
            }
            other => {
                trace!(session = %session, function = ?other, "Ignoring control function");
            }
        }
    }

    fn register(&self, session: SessionId, topic: &relay_protocol::Topic) {
        if !self.registry.is_registered(session, topic)
            && self.registry.subscription_count(session) >= self.config.max_subscriptions_per_session
        {
            warn!(
                session = %session,
                topic = %topic,
                limit = self.config.max_subscriptions_per_session,
                "Subscription limit reached"
            );
            return;
        }
        self.registry.register(session, topic);
    }

    fn fan_out(&self, origin: Origin, envelope: Envelope) -> usize {
        let Envelope { topic, payload } = envelope;
        let payload = self.mutators.apply(&topic, payload);

        let targets = self.registry.lookup(&topic);
        if targets.is_empty() {
            trace!(topic = %topic, origin = %origin, "No subscribers");
            return 0;
        }

        let skip = if self.config.echo_suppression {
            origin.session()
        } else {
            None
        };

        let envelope = Arc::new(Envelope::new(topic, payload));
        let mut delivered = 0;

        for target in targets {
            if Some(target) == skip {
                continue;
            }
            // A session may close mid-pass; a missing or closed queue is skipped.
            let sent = self
                .sessions
                .get(&target)
                .is_some_and(|tx| tx.send(Arc::clone(&envelope)).is_ok());
            if sent {
                delivered += 1;
            } else {
                debug!(session = %target, topic = %envelope.topic, "Delivery failed");
            }
        }

        trace!(topic = %envelope.topic, origin = %origin, recipients = delivered, "Routed");
        delivered
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            session_count: self.sessions.len(),
            topic_count: self.registry.topic_count(),
            total_subscriptions: self.registry.total_subscriptions(),
            mutator_count: self.mutators.len(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Number of open sessions.
    pub session_count: usize,
    /// Number of topics with subscribers.
    pub topic_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Number of bound mutators.
    pub mutator_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Topic;
    use serde_json::{json, Value};

    fn envelope(topic: &str, payload: Value) -> Envelope {
        Envelope::new(Topic::parse(topic).unwrap(), payload)
    }

    fn register(router: &Router, session: SessionId, topic: &str) {
        router.route(
            Origin::Session(session),
            Envelope::register(&Topic::parse(topic).unwrap()),
        );
    }

    #[test]
    fn test_producer_message_reaches_only_subscribers() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();
        let (_b, mut rx_b) = router.connect();

        register(&router, a, "game:goal_scored");

        let sent = envelope("game:goal_scored", json!({"scorer": "X"}));
        assert_eq!(router.route(Origin::Producer, sent.clone()), 1);

        assert_eq!(*rx_a.try_recv().unwrap(), sent);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_echo_suppression() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();
        let (b, mut rx_b) = router.connect();

        register(&router, a, "game:update_state");
        register(&router, b, "game:update_state");

        let sent = envelope("game:update_state", json!({"time": 10}));
        assert_eq!(router.route(Origin::Session(a), sent.clone()), 1);

        assert_eq!(*rx_b.try_recv().unwrap(), sent);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_echo_allowed_when_disabled() {
        let router = Router::with_config(RouterConfig {
            echo_suppression: false,
            ..RouterConfig::default()
        });
        let (a, mut rx_a) = router.connect();
        register(&router, a, "game:clock");

        assert_eq!(
            router.route(Origin::Session(a), envelope("game:clock", json!(1))),
            1
        );
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn test_mutator_applied_before_fan_out() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();
        register(&router, a, "game:update_state");
        register(&router, a, "game:clock");

        router
            .mutators()
            .register(Topic::parse("game:update_state").unwrap(), |mut payload| {
                payload["series"] = json!("2-1");
                payload
            });

        router.route(Origin::Producer, envelope("game:update_state", json!({"time": 10})));
        router.route(Origin::Producer, envelope("game:clock", json!({"time": 10})));

        assert_eq!(rx_a.try_recv().unwrap().payload, json!({"time": 10, "series": "2-1"}));
        assert_eq!(rx_a.try_recv().unwrap().payload, json!({"time": 10}));
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let router = Router::new();
        let (a, _rx_a) = router.connect();
        let (b, mut rx_b) = router.connect();
        register(&router, a, "game:clock");
        register(&router, a, "game:goal_scored");
        register(&router, b, "game:clock");

        router.disconnect(a);

        assert!(!router.is_connected(a));
        assert!(router.registry().session_topics(a).is_empty());
        assert_eq!(router.route(Origin::Producer, envelope("game:clock", json!(1))), 1);
        assert_eq!(
            router.route(Origin::Producer, envelope("game:goal_scored", json!(1))),
            0
        );
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_failed_delivery_does_not_abort_fan_out() {
        let router = Router::new();
        let (a, rx_a) = router.connect();
        let (b, mut rx_b) = router.connect();
        register(&router, a, "game:clock");
        register(&router, b, "game:clock");

        // The receiver is gone but the session was never torn down.
        drop(rx_a);

        assert_eq!(router.route(Origin::Producer, envelope("game:clock", json!(1))), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_control_messages_are_not_relayed() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();
        let (b, _rx_b) = router.connect();
        register(&router, a, "relay:register");

        register(&router, b, "game:clock");
        router.route(Origin::Session(b), envelope("relay:whatever", json!(null)));

        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_register_list_and_unregister() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();

        router.route(
            Origin::Session(a),
            envelope("relay:register", json!(["game:clock", "broken", "game:goal_scored"])),
        );
        assert_eq!(router.registry().subscription_count(a), 2);

        router.route(Origin::Session(a), envelope("relay:unregister", json!("game:clock")));
        assert_eq!(router.route(Origin::Producer, envelope("game:clock", json!(1))), 0);
        assert_eq!(
            router.route(Origin::Producer, envelope("game:goal_scored", json!(1))),
            1
        );
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn test_producer_control_is_ignored() {
        let router = Router::new();
        router.route(Origin::Producer, envelope("relay:register", json!("game:clock")));
        assert_eq!(router.registry().topic_count(), 0);
    }

    #[test]
    fn test_closed_session_cannot_register() {
        let router = Router::new();
        let (a, _rx) = router.connect();
        router.disconnect(a);

        register(&router, a, "game:clock");
        assert_eq!(router.registry().topic_count(), 0);
    }

    #[test]
    fn test_subscription_limit() {
        let router = Router::with_config(RouterConfig {
            max_subscriptions_per_session: 2,
            ..RouterConfig::default()
        });
        let (a, _rx) = router.connect();

        register(&router, a, "game:a");
        register(&router, a, "game:b");
        register(&router, a, "game:c");
        // Re-registering an existing topic at the limit is still a no-op, not a rejection.
        register(&router, a, "game:a");

        assert_eq!(router.registry().subscription_count(a), 2);
        assert!(!router.registry().is_registered(a, &Topic::parse("game:c").unwrap()));
    }

    #[test]
    fn test_sender_order_preserved_per_recipient() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect();
        let (b, _) = router.connect();
        register(&router, a, "game:clock");

        for i in 0..50 {
            router.route(Origin::Session(b), envelope("game:clock", json!(i)));
        }
        for i in 0..50 {
            assert_eq!(rx_a.try_recv().unwrap().payload, json!(i));
        }
    }

    #[test]
    fn test_router_stats() {
        let router = Router::new();
        let (a, _rx_a) = router.connect();
        let (b, _rx_b) = router.connect();
        register(&router, a, "game:clock");
        register(&router, a, "game:goal_scored");
        register(&router, b, "game:clock");

        let stats = router.stats();
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.mutator_count, 0);
    }
}
