use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Recipient marker addressing every reachable node
pub const BROADCAST: &str = "*";

/// Category of an envelope, used for routing and logging only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Error,
    Custom(String),
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => f.write_str("request"),
            MessageKind::Response => f.write_str("response"),
            MessageKind::Event => f.write_str("event"),
            MessageKind::Error => f.write_str("error"),
            MessageKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Message urgency, higher is more urgent
///
/// Carried for logging and metrics. Transports never reorder on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const HIGH: Priority = Priority(3);
    pub const CRITICAL: Priority = Priority(4);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of transport: addressing, opaque payload and delivery metadata
///
/// `id` and `created_at` are fixed at construction. `retry_count` only moves
/// forward through [`Envelope::record_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    created_at: DateTime<Utc>,
    pub priority: Priority,
    pub ttl_seconds: Option<u64>,
    retry_count: u32,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current time
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            payload: payload.into(),
            created_at: Utc::now(),
            priority: Priority::default(),
            ttl_seconds: None,
            retry_count: 0,
            correlation_id: None,
        }
    }

    /// Create an envelope addressed to every node
    pub fn broadcast(sender: impl Into<String>, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(sender, BROADCAST, kind, payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Count one more delivery attempt, returning the new count
    pub fn record_retry(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }

    /// Time elapsed since creation, zero if the clock went backwards
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the TTL window had already closed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => self.age_at(now) > Duration::from_secs(ttl),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Check that an address can name a mailbox
///
/// Addresses end up as directory names, so separators and relative
/// components are refused.
pub fn validate_address(address: &str) -> Result<()> {
    let reason = if address.is_empty() {
        "empty"
    } else if address == "." || address == ".." {
        "relative path component"
    } else if address.contains(['/', '\\', '\0']) {
        "contains a path separator"
    } else {
        return Ok(());
    };

    Err(Error::InvalidAddress {
        address: address.to_string(),
        reason,
    })
}
