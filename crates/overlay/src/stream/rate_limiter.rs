use std::{collections::HashMap, time::Instant};

use discv5::enr::NodeId;
use parking_lot::Mutex;

/// A token bucket per peer, capping how often inbound OFFERs from a single peer may be
/// accepted. The probe is non-blocking: an exhausted bucket rejects the offer, it never delays
/// it.
pub struct OfferRateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<NodeId, TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl OfferRateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token from `peer`'s bucket. Returns false when the bucket is empty.
    pub fn try_acquire(&self, peer: NodeId) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(peer).or_insert(TokenBucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops state for peers whose buckets have fully refilled. Called opportunistically so the
    /// map does not grow with every peer ever seen.
    pub fn prune(&self) {
        let now = Instant::now();
        let capacity = self.capacity;
        let refill_per_sec = self.refill_per_sec;
        self.buckets.lock().retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            bucket.tokens + elapsed.as_secs_f64() * refill_per_sec < capacity
        });
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;

    #[test]
    fn bucket_exhausts_and_isolates_peers() {
        let limiter = OfferRateLimiter::new(2.0, 0.0);
        let peer_a = NodeId::random();
        let peer_b = NodeId::random();

        assert!(limiter.try_acquire(peer_a));
        assert!(limiter.try_acquire(peer_a));
        assert!(!limiter.try_acquire(peer_a));

        // Another peer's bucket is untouched.
        assert!(limiter.try_acquire(peer_b));
    }

    #[test]
    fn prune_discards_full_buckets() {
        let limiter = OfferRateLimiter::new(1.0, 1000.0);
        let peer = NodeId::random();
        assert!(limiter.try_acquire(peer));

        // With an effectively instant refill the bucket counts as full again.
        std::thread::sleep(std::time::Duration::from_millis(5));
        limiter.prune();
        assert!(limiter.buckets.lock().is_empty());
    }
}
