use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use murmuration_protocol::cluster::HubBroadcast;

struct CachedBroadcast {
    broadcast: HubBroadcast,
    queued_at: Instant,
}

/// Bounded, per-Edge replay buffer. An Edge that drops its control
/// connection briefly (a restart, a network blip) doesn't miss mutations
/// made elsewhere in the cluster during the gap — it drains this cache on
/// reconnect instead of needing a full resync. Entries older than the
/// configured TTL, or beyond the per-edge capacity, are dropped; a resync
/// is cheap enough that losing the very oldest entries during a long
/// outage isn't worth unbounded memory.
pub struct EdgeCache {
    capacity: usize,
    ttl: Duration,
    queues: Mutex<HashMap<String, Vec<CachedBroadcast>>>,
}

impl EdgeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, edge_id: &str, broadcast: HubBroadcast) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(edge_id.to_string()).or_default();
        queue.push(CachedBroadcast {
            broadcast,
            queued_at: Instant::now(),
        });
        if queue.len() > self.capacity {
            let overflow = queue.len() - self.capacity;
            queue.drain(0..overflow);
        }
    }

    /// Drain and return everything buffered for `edge_id`, oldest first,
    /// dropping anything that's aged past the TTL.
    pub fn drain(&self, edge_id: &str) -> Vec<HubBroadcast> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.remove(edge_id) else {
            return Vec::new();
        };
        let now = Instant::now();
        queue
            .into_iter()
            .filter(|entry| now.duration_since(entry.queued_at) < self.ttl)
            .map(|entry| entry.broadcast)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order_and_clears() {
        let cache = EdgeCache::new(10, Duration::from_secs(60));
        cache.push("edge-1", HubBroadcast::PeerLeft { edge_id: "a".into() });
        cache.push("edge-1", HubBroadcast::PeerLeft { edge_id: "b".into() });

        let drained = cache.drain("edge-1");
        assert_eq!(drained.len(), 2);
        assert!(cache.drain("edge-1").is_empty());
    }

    #[test]
    fn respects_capacity() {
        let cache = EdgeCache::new(2, Duration::from_secs(60));
        for i in 0..5 {
            cache.push(
                "edge-1",
                HubBroadcast::PeerLeft {
                    edge_id: format!("peer-{i}"),
                },
            );
        }
        assert_eq!(cache.drain("edge-1").len(), 2);
    }
}
