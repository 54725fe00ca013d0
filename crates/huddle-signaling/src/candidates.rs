//! Remote candidates that arrived before their connection could take them.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::ids::ConnectionId;
use crate::message::IceCandidate;

#[derive(Debug)]
struct Queue {
    entries: VecDeque<IceCandidate>,
    last_enqueue: Instant,
}

#[derive(Debug)]
pub struct CandidateBuffer {
    queues: HashMap<ConnectionId, Queue>,
    limit: usize,
}

impl CandidateBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Appends in arrival order. Returns the oldest entry if the queue was
    /// full and had to make room.
    pub fn enqueue(
        &mut self,
        id: &ConnectionId,
        candidate: IceCandidate,
        now: Instant,
    ) -> Option<IceCandidate> {
        let queue = self.queues.entry(id.clone()).or_insert_with(|| Queue {
            entries: VecDeque::new(),
            last_enqueue: now,
        });
        queue.last_enqueue = now;
        let evicted = if queue.entries.len() >= self.limit {
            queue.entries.pop_front()
        } else {
            None
        };
        queue.entries.push_back(candidate);
        evicted
    }

    /// Takes everything queued for `id`; a second call returns nothing.
    pub fn drain(&mut self, id: &ConnectionId) -> Vec<IceCandidate> {
        self.queues
            .remove(id)
            .map(|queue| Vec::from(queue.entries))
            .unwrap_or_default()
    }

    pub fn discard(&mut self, id: &ConnectionId) -> usize {
        self.queues.remove(id).map_or(0, |queue| queue.entries.len())
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.queues.values().map(|queue| queue.entries.len()).sum();
        self.queues.clear();
        dropped
    }

    pub fn pending(&self, id: &ConnectionId) -> usize {
        self.queues.get(id).map_or(0, |queue| queue.entries.len())
    }

    /// Drops queues that `is_orphan` accepts and that have not grown for
    /// longer than `stale_after`. Returns each dropped id with its length.
    pub fn expire(
        &mut self,
        now: Instant,
        stale_after: Duration,
        is_orphan: impl Fn(&ConnectionId) -> bool,
    ) -> Vec<(ConnectionId, usize)> {
        let mut expired = Vec::new();
        self.queues.retain(|id, queue| {
            let stale = now.saturating_duration_since(queue.last_enqueue) > stale_after;
            if stale && is_orphan(id) {
                expired.push((id.clone(), queue.entries.len()));
                false
            } else {
                true
            }
        });
        expired.sort();
        expired
    }
}
