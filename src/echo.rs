/*!
 # Echo suppression

 The service subscribes to topics it also publishes on (the mode topic). Every
 payload it sends there is remembered here so that the broker's echo is
 recognised and dropped instead of being handled as a fresh command.
*/

use std::collections::{HashMap, VecDeque};

use tracing::trace;

/// Pending echoes kept per topic; older ones are forgotten
pub const MAX_PENDING_PER_TOPIC: usize = 8;

#[derive(Debug, Default)]
pub struct EchoFilter {
    pending: HashMap<String, VecDeque<String>>,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers a payload this process is about to publish
    pub fn record(&mut self, topic: &str, payload: &str) {
        let queue = self.pending.entry(topic.to_string()).or_default();
        if queue.len() == MAX_PENDING_PER_TOPIC {
            queue.pop_front();
        }
        queue.push_back(payload.trim().to_string());
    }

    /// Returns true (and forgets the entry) if the message is our own echo
    pub fn consume(&mut self, topic: &str, payload: &str) -> bool {
        let Some(queue) = self.pending.get_mut(topic) else {
            return false;
        };
        let payload = payload.trim();
        let Some(position) = queue.iter().position(|pending| pending == payload) else {
            return false;
        };
        queue.remove(position);
        if queue.is_empty() {
            self.pending.remove(topic);
        }
        trace!(topic, payload, "Dropped self-originated echo");
        true
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.pending.get(topic).map_or(0, VecDeque::len)
    }
}
