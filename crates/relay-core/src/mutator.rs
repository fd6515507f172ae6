//! Payload mutators.
//!
//! A mutator rewrites the payload of every message on one topic before it is
//! fanned out, e.g. to append derived metadata the producer knows nothing about.

use dashmap::DashMap;
use relay_protocol::Topic;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// A payload transform bound to one topic.
pub type Mutator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// At most one mutator per topic, last registration wins.
#[derive(Default)]
pub struct MutatorPipeline {
    mutators: DashMap<Topic, Mutator>,
}

impl MutatorPipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a mutator to a topic, replacing any existing one.
    pub fn register<F>(&self, topic: Topic, mutator: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        debug!(topic = %topic, "Mutator registered");
        if self.mutators.insert(topic, Arc::new(mutator)).is_some() {
            debug!("Replaced existing mutator");
        }
    }

    /// Remove the mutator bound to a topic.
    ///
    /// Returns `true` if one was bound.
    pub fn unregister(&self, topic: &Topic) -> bool {
        self.mutators.remove(topic).is_some()
    }

    /// Apply the topic's mutator, or return the payload unchanged.
    ///
    /// The mutator runs without any pipeline lock held.
    #[must_use]
    pub fn apply(&self, topic: &Topic, payload: Value) -> Value {
        let mutator = self.mutators.get(topic).map(|m| Arc::clone(&*m));
        match mutator {
            Some(mutator) => mutator(payload),
            None => payload,
        }
    }

    /// Whether a mutator is bound to the topic.
    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.mutators.contains_key(topic)
    }

    /// Number of bound mutators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    /// Whether no mutators are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }
}

impl std::fmt::Debug for MutatorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorPipeline")
            .field("topics", &self.mutators.iter().map(|e| e.key().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

/// Build a mutator that inserts `fields` into object payloads.
///
/// Existing keys are overwritten. Non-object payloads pass through unchanged.
#[must_use]
pub fn merge_fields(fields: Map<String, Value>) -> impl Fn(Value) -> Value + Send + Sync + 'static {
    move |payload| match payload {
        Value::Object(mut object) => {
            for (key, value) in &fields {
                object.insert(key.clone(), value.clone());
            }
            Value::Object(object)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic(raw: &str) -> Topic {
        Topic::parse(raw).unwrap()
    }

    #[test]
    fn test_apply_without_mutator_is_identity() {
        let pipeline = MutatorPipeline::new();
        let payload = json!({"time": 10});
        assert_eq!(pipeline.apply(&topic("game:update_state"), payload.clone()), payload);
    }

    #[test]
    fn test_mutator_only_applies_to_its_topic() {
        let pipeline = MutatorPipeline::new();
        pipeline.register(topic("game:update_state"), |mut payload| {
            payload["series"] = json!({"blue": 2, "orange": 1});
            payload
        });

        assert_eq!(
            pipeline.apply(&topic("game:update_state"), json!({"time": 10})),
            json!({"time": 10, "series": {"blue": 2, "orange": 1}})
        );
        assert_eq!(
            pipeline.apply(&topic("game:goal_scored"), json!({"time": 10})),
            json!({"time": 10})
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let pipeline = MutatorPipeline::new();
        let clock = topic("game:clock");

        pipeline.register(clock.clone(), |_| json!("first"));
        pipeline.register(clock.clone(), |_| json!("second"));

        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.apply(&clock, json!(null)), json!("second"));

        assert!(pipeline.unregister(&clock));
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.apply(&clock, json!(null)), json!(null));
    }

    #[test]
    fn test_merge_fields() {
        let mut fields = Map::new();
        fields.insert("series".to_string(), json!("2-1"));
        let mutator = merge_fields(fields);

        assert_eq!(mutator(json!({"time": 10})), json!({"time": 10, "series": "2-1"}));
        assert_eq!(mutator(json!([1, 2])), json!([1, 2]));
    }
}
