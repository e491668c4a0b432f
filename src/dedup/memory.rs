use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::DedupStore;

struct SeenSet {
    by_id: HashMap<i64, Instant>,
    // Insertion order; each id appears at most once while it is in `by_id`.
    order: VecDeque<(i64, Instant)>,
}

impl SeenSet {
    fn evict_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let mut evicted = 0;
        while let Some(&(id, seen_at)) = self.order.front() {
            if now.duration_since(seen_at) < retention {
                break;
            }
            self.order.pop_front();
            self.by_id.remove(&id);
            evicted += 1;
        }
        evicted
    }

    fn evict_overflow(&mut self, max_entries: usize) {
        while self.by_id.len() > max_entries {
            match self.order.pop_front() {
                Some((id, _)) => {
                    self.by_id.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// In-process seen-set bounded by a sliding time window and an entry cap.
pub struct MemoryDedupStore {
    seen: Mutex<SeenSet>,
    retention: Duration,
    max_entries: usize,
}

impl MemoryDedupStore {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(SeenSet {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention,
            max_entries: max_entries.max(1),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    fn admit_now(&self, update_id: i64) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.evict_expired(now, self.retention);

        if seen.by_id.contains_key(&update_id) {
            return false;
        }

        seen.by_id.insert(update_id, now);
        seen.order.push_back((update_id, now));
        seen.evict_overflow(self.max_entries);
        true
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn admit(&self, update_id: i64) -> Result<bool> {
        Ok(self.admit_now(update_id))
    }

    async fn prune(&self) -> Result<usize> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = seen.evict_expired(Instant::now(), self.retention);
        if evicted > 0 {
            debug!(evicted, "Pruned in-memory dedup records");
        }
        Ok(evicted)
    }
}
