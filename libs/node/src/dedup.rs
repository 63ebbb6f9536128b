use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Remembers envelope ids seen within a trailing time window
pub(crate) struct DedupWindow {
    window: Duration,
    seen: HashMap<Uuid, Instant>,
    order: VecDeque<(Instant, Uuid)>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`, returning false if it was already seen inside the window
    pub fn first_sighting(&mut self, id: Uuid, now: Instant) -> bool {
        self.evict(now);

        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, now);
        self.order.push_back((now, id));
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, id)) = self.order.front() {
            if now.duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
