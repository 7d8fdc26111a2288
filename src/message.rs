use std::fmt;

use chrono::{DateTime, Utc};

use crate::control::OverrideKind;

const PREVIEW_CHARS: usize = 80;

/// A message received on one of the subscribed topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload cut down for log lines
    pub fn preview(&self) -> String {
        preview(&self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.topic, self.preview())
    }
}

/// A message the service wants on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publish {
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

impl fmt::Display for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.topic, preview(&self.payload))?;
        if self.retain {
            f.write_str(" (retained)")?;
        }
        Ok(())
    }
}

/// Everything the service loop reacts to, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(InboundMessage),
    /// An override timer ran out
    OverrideExpired { timer_id: u64, kind: OverrideKind },
    /// The broker accepted the session and subscriptions were requested
    Connected,
    Disconnected(String),
    Shutdown,
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_payloads_are_truncated_in_previews() {
        let message = InboundMessage::new("a/b", "x".repeat(200));
        let shown = message.preview();
        assert_eq!(shown.len(), PREVIEW_CHARS + 3);
        assert!(shown.ends_with("..."));
        assert_eq!(InboundMessage::new("a/b", "ON").to_string(), "a/b <- ON");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(PREVIEW_CHARS + 1);
        assert_eq!(preview(&text).chars().count(), PREVIEW_CHARS + 3);
    }

    #[test]
    fn publish_display_marks_retained() {
        assert_eq!(Publish::retained("t", "p").to_string(), "t -> p (retained)");
        assert_eq!(Publish::transient("t", "p").to_string(), "t -> p");
    }
}
