use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::JamError;
use crate::ratelimit::RateLimiter;
use crate::sanitize;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub court_id: String,
    pub subject_id: String,
    pub display_name: String,
    pub text: String,
    pub timestamp_ms: i64,
}

/// Per-court message log with live fanout. Messages are ephemeral: they live
/// in memory until the retention sweep drops them and are not snapshotted.
pub struct ChatStore {
    messages: DashMap<String, Vec<ChatMessage>>,
    channels: DashMap<String, broadcast::Sender<ChatMessage>>,
    retention_ms: i64,
    history_limit: usize,
    max_message_chars: usize,
}

impl ChatStore {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            messages: DashMap::new(),
            channels: DashMap::new(),
            retention_ms: config.retention_hours as i64 * 3_600_000,
            history_limit: config.history_limit,
            max_message_chars: config.max_message_chars,
        }
    }

    /// Admits, records and fans out one message. The limiter key is scoped
    /// `court_id:subject_id` so a noisy user in one court can still talk in
    /// another.
    pub fn post(
        &self,
        limiter: &RateLimiter,
        court_id: &str,
        subject_id: &str,
        display_name: &str,
        text: &str,
    ) -> Result<ChatMessage, JamError> {
        if court_id.trim().is_empty() || subject_id.trim().is_empty() {
            return Err(JamError::Validation(
                "court and subject ids must not be empty".to_string(),
            ));
        }
        let text = sanitize::message(text, self.max_message_chars)?;
        limiter.check(&format!("{}:{}", court_id, subject_id))?;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            court_id: court_id.to_string(),
            subject_id: subject_id.to_string(),
            display_name: display_name.to_string(),
            text,
            timestamp_ms: now_ms(),
        };

        self.messages
            .entry(court_id.to_string())
            .or_default()
            .push(message.clone());

        if let Some(tx) = self.channels.get(court_id) {
            // nobody listening is fine, the log still has it
            let _ = tx.send(message.clone());
        }

        Ok(message)
    }

    /// The most recent messages for a court, oldest first, capped at the
    /// configured history size. Expired messages are pruned on the way out.
    pub fn recent(&self, court_id: &str) -> Vec<ChatMessage> {
        let now = now_ms();
        let Some(mut entry) = self.messages.get_mut(court_id) else {
            return Vec::new();
        };
        let cutoff = now - self.retention_ms;
        entry.retain(|m| m.timestamp_ms > cutoff);
        let skip = entry.len().saturating_sub(self.history_limit);
        entry.iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self, court_id: &str) -> broadcast::Receiver<ChatMessage> {
        self.channels
            .entry(court_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drops messages older than the retention window and idle channels.
    /// Returns how many messages were removed.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(now_ms())
    }

    fn prune_expired_at(&self, now: i64) -> usize {
        let cutoff = now - self.retention_ms;
        let mut removed = 0usize;
        self.messages.retain(|_, log| {
            let before = log.len();
            log.retain(|m| m.timestamp_ms > cutoff);
            removed += before - log.len();
            !log.is_empty()
        });
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        removed
    }

    pub fn message_count(&self) -> usize {
        self.messages.iter().map(|kv| kv.value().len()).sum()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
