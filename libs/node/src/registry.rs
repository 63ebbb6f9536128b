use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_fabric::Protocol;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{Error, Result};

/// Last known reachability of a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Health {
    pub healthy: bool,
    /// When `healthy` was last set, by a probe or by send failures
    pub checked_at: Option<DateTime<Utc>>,
}

/// Per-protocol counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    pub sent: u64,
    pub received: u64,
    pub send_failures: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Record {
    available: bool,
    health: Health,
    stats: ProtocolStats,
}

/// Point-in-time copy of one registration, safe to hand out
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStatus {
    pub name: String,
    pub kind: &'static str,
    pub priority: i32,
    pub available: bool,
    pub healthy: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub stats: ProtocolStats,
}

/// What happened to a record after a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    StillHealthy,
    Demoted,
}

/// A protocol owned by the manager together with its mutable record
///
/// All record fields sit behind one lock, so health flag and timestamp (and
/// the counters) are always read and written together.
pub(crate) struct Registration {
    pub name: String,
    pub priority: i32,
    pub order: usize,
    pub protocol: Arc<dyn Protocol>,
    record: Mutex<Record>,
}

impl Registration {
    fn new(name: String, priority: i32, order: usize, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            name,
            priority,
            order,
            protocol,
            record: Mutex::new(Record::default()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.record.lock().available
    }

    pub fn set_available(&self, available: bool) {
        self.record.lock().available = available;
    }

    fn is_selectable(&self) -> bool {
        let record = self.record.lock();
        record.available && record.health.healthy
    }

    /// Store a probe result; returns the previous health flag
    pub fn set_health(&self, healthy: bool) -> bool {
        let mut record = self.record.lock();
        let was = record.health.healthy;
        record.health = Health {
            healthy,
            checked_at: Some(Utc::now()),
        };
        if healthy && !was {
            record.stats.consecutive_failures = 0;
        }
        was
    }

    pub fn record_sent(&self) {
        let mut record = self.record.lock();
        record.stats.sent += 1;
        record.stats.consecutive_failures = 0;
    }

    pub fn record_received(&self) {
        self.record.lock().stats.received += 1;
    }

    /// Count a failed send, demoting the protocol once `threshold` is reached
    pub fn record_failure(&self, threshold: u32) -> FailureOutcome {
        let mut record = self.record.lock();
        record.stats.send_failures += 1;
        record.stats.consecutive_failures = record.stats.consecutive_failures.saturating_add(1);

        if record.health.healthy && record.stats.consecutive_failures >= threshold {
            record.health = Health {
                healthy: false,
                checked_at: Some(Utc::now()),
            };
            FailureOutcome::Demoted
        } else {
            FailureOutcome::StillHealthy
        }
    }

    pub fn status(&self) -> ProtocolStatus {
        let record = self.record.lock();
        ProtocolStatus {
            name: self.name.clone(),
            kind: self.protocol.kind(),
            priority: self.priority,
            available: record.available,
            healthy: record.health.healthy,
            checked_at: record.health.checked_at,
            stats: record.stats.clone(),
        }
    }
}

/// Ordered set of registrations
///
/// Grows only before the manager starts; afterwards only the per-record
/// state changes.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<Vec<Arc<Registration>>>,
}

impl Registry {
    pub fn insert(&self, name: String, priority: i32, protocol: Arc<dyn Protocol>) -> Result<()> {
        let mut entries = self.entries.write();

        if entries.iter().any(|r| r.name == name) {
            return Err(Error::DuplicateName(name));
        }
        if let Some(existing) = entries.iter().find(|r| r.priority == priority) {
            return Err(Error::DuplicatePriority {
                priority,
                existing: existing.name.clone(),
            });
        }

        let order = entries.len();
        entries.push(Arc::new(Registration::new(name, priority, order, protocol)));
        Ok(())
    }

    pub fn all(&self) -> Vec<Arc<Registration>> {
        self.entries.read().clone()
    }

    pub fn available(&self) -> Vec<Arc<Registration>> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.is_available())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Registration>> {
        self.entries.read().iter().find(|r| r.name == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Highest-priority healthy protocol, earliest registration on ties
    pub fn select(&self) -> Option<Arc<Registration>> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.is_selectable())
            .min_by_key(|r| (std::cmp::Reverse(r.priority), r.order))
            .cloned()
    }

    pub fn statuses(&self) -> Vec<ProtocolStatus> {
        let mut statuses: Vec<(i32, usize, ProtocolStatus)> = self
            .entries
            .read()
            .iter()
            .map(|r| (r.priority, r.order, r.status()))
            .collect();
        statuses.sort_by_key(|(priority, order, _)| (std::cmp::Reverse(*priority), *order));
        statuses.into_iter().map(|(_, _, status)| status).collect()
    }
}
