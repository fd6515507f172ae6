//! Topic names.
//!
//! A topic is the routing key of the relay: `"<channel>:<event>"`.
//! Topics are validated once, when they are constructed, so the rest of the
//! system only ever handles well-formed keys.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between the channel and event halves of a topic.
pub const TOPIC_SEPARATOR: char = ':';

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// A validated `"<channel>:<event>"` topic.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Topic {
    raw: String,
    /// Byte offset of the first separator.
    split: usize,
}

impl Topic {
    /// Parse a topic from its wire form.
    ///
    /// The string is split on the first `:`; both halves must be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidTopic`] if the string is not a well-formed topic.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let invalid = |reason| ProtocolError::InvalidTopic {
            topic: raw.clone(),
            reason,
        };

        if raw.len() > MAX_TOPIC_LENGTH {
            return Err(invalid("topic too long"));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(invalid("topic contains control characters"));
        }
        let split = raw
            .find(TOPIC_SEPARATOR)
            .ok_or_else(|| invalid("missing channel:event separator"))?;
        if split == 0 {
            return Err(invalid("empty channel"));
        }
        if split + TOPIC_SEPARATOR.len_utf8() == raw.len() {
            return Err(invalid("empty event"));
        }

        Ok(Self { raw, split })
    }

    /// Build a topic from its two halves.
    ///
    /// # Errors
    ///
    /// Returns an error if either half is empty or the channel contains a separator.
    pub fn new(channel: &str, event: &str) -> Result<Self, ProtocolError> {
        if channel.contains(TOPIC_SEPARATOR) {
            return Err(ProtocolError::InvalidTopic {
                topic: format!("{channel}{TOPIC_SEPARATOR}{event}"),
                reason: "channel contains separator",
            });
        }
        Self::parse(format!("{channel}{TOPIC_SEPARATOR}{event}"))
    }

    /// Join two halves that are known to be valid (reserved channel names).
    pub(crate) fn from_parts_unchecked(channel: &str, event: &str) -> Self {
        Self {
            raw: format!("{channel}{TOPIC_SEPARATOR}{event}"),
            split: channel.len(),
        }
    }

    /// The channel half.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.raw[..self.split]
    }

    /// The event half.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.raw[self.split + TOPIC_SEPARATOR.len_utf8()..]
    }

    /// The full wire form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this topic belongs to the given channel.
    #[must_use]
    pub fn is_on(&self, channel: &str) -> bool {
        self.channel() == channel
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({:?})", self.raw)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Topic {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for Topic {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> String {
        topic.raw
    }
}

impl std::str::FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_halves() {
        let topic = Topic::parse("game:update_state").unwrap();
        assert_eq!(topic.channel(), "game");
        assert_eq!(topic.event(), "update_state");
        assert!(topic.is_on("game"));
    }

    #[test]
    fn test_topic_splits_on_first_separator() {
        let topic = Topic::parse("sos:version:2").unwrap();
        assert_eq!(topic.channel(), "sos");
        assert_eq!(topic.event(), "version:2");
    }

    #[test]
    fn test_topic_rejects_malformed() {
        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("game").is_err());
        assert!(Topic::parse(":goal").is_err());
        assert!(Topic::parse("game:").is_err());
        assert!(Topic::parse("game:\nx").is_err());
        assert!(Topic::parse(format!("a:{}", "b".repeat(MAX_TOPIC_LENGTH))).is_err());
    }

    #[test]
    fn test_topic_from_parts() {
        let topic = Topic::new("game", "goal_scored").unwrap();
        assert_eq!(topic.as_str(), "game:goal_scored");
        assert!(Topic::new("a:b", "c").is_err());
        assert!(Topic::new("game", "").is_err());
    }

    #[test]
    fn test_topic_serde_as_string() {
        let topic = Topic::parse("game:clock").unwrap();
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"game:clock\"");

        let parsed: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, topic);
        assert!(serde_json::from_str::<Topic>("\"nope\"").is_err());
    }
}
