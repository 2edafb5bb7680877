use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Lane {
    /// Saga ids in creation order; the head is the only one that may run
    queue: Vec<(DateTime<Utc>, String)>,
    /// A worker task currently owns this lane
    running: bool,
}

/// Per-address saga queues. At most one worker drives a lane at a time,
/// which is what serializes every ledger write for a user.
#[derive(Debug, Default)]
pub struct Lanes {
    lanes: Mutex<HashMap<String, Lane>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a saga. Returns `true` when the caller must start a worker for the lane.
    pub fn push(&self, address: &str, created_at: DateTime<Utc>, id: &str) -> bool {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(address.to_string()).or_default();
        if !lane.queue.iter().any(|(_, queued)| queued == id) {
            let at = lane
                .queue
                .partition_point(|(ts, queued)| (ts, queued.as_str()) <= (&created_at, id));
            lane.queue.insert(at, (created_at, id.to_string()));
        }
        Self::claim(lane)
    }

    /// Start a worker for a lane that has queued work but nobody driving it
    pub fn wake(&self, address: &str) -> bool {
        let mut lanes = self.lanes.lock();
        match lanes.get_mut(address) {
            Some(lane) if !lane.queue.is_empty() => Self::claim(lane),
            _ => false,
        }
    }

    fn claim(lane: &mut Lane) -> bool {
        if lane.running {
            false
        } else {
            lane.running = true;
            true
        }
    }

    /// Head of the lane, or `None` after releasing an empty lane
    pub fn next_or_release(&self, address: &str) -> Option<String> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.get_mut(address)?;
        match lane.queue.first() {
            Some((_, id)) => Some(id.clone()),
            None => {
                lanes.remove(address);
                self.drop_idle_lock(address);
                None
            }
        }
    }

    pub fn remove(&self, address: &str, id: &str) {
        if let Some(lane) = self.lanes.lock().get_mut(address) {
            lane.queue.retain(|(_, queued)| queued != id);
        }
    }

    /// Stop driving a lane whose head cannot make progress right now
    pub fn park(&self, address: &str) {
        if let Some(lane) = self.lanes.lock().get_mut(address) {
            lane.running = false;
        }
    }

    /// Forget an address with no queued work and nobody holding its lock
    pub fn prune(&self, address: &str) {
        let mut lanes = self.lanes.lock();
        if lanes
            .get(address)
            .is_some_and(|lane| lane.queue.is_empty() && !lane.running)
        {
            lanes.remove(address);
        }
        if !lanes.contains_key(address) {
            self.drop_idle_lock(address);
        }
    }

    fn drop_idle_lock(&self, address: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(address);
        }
    }

    /// Async mutex guarding drives and operator actions for one address
    pub fn user_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    /// Sagas queued across all lanes
    pub fn depth(&self) -> usize {
        self.lanes.lock().values().map(|lane| lane.queue.len()).sum()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.lanes.lock().values().all(|lane| !lane.running)
    }

    #[cfg(test)]
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}
