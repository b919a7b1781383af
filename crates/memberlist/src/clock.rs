use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lamport logical clock. `witness` folds in an externally-observed
/// value without advancing past it; `increment` is the only operation that
/// hands out a fresh, strictly-increasing value to attach to a locally
/// originated event/query.
#[derive(Clone, Default)]
pub struct LClock {
    inner: Arc<AtomicU64>,
}

impl LClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(&self) -> u64 {
        self.inner.load(Ordering::SeqCst)
    }

    /// Sets the clock to at least `observed`, without incrementing further.
    pub fn witness(&self, observed: u64) {
        self.inner.fetch_max(observed, Ordering::SeqCst);
    }

    /// Returns the new value after advancing the clock by one.
    pub fn increment(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Recent-message filter: a bounded ring of `(lamport, name, hash)`
/// keys used to reject already-processed user events and queries.
pub struct RecentFilter {
    capacity: usize,
    order: Mutex<(VecDeque<(u64, String, u64)>, std::collections::HashSet<(u64, String, u64)>)>,
}

impl RecentFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Mutex::new((VecDeque::new(), std::collections::HashSet::new())),
        }
    }

    /// Returns `true` if `key` was newly inserted (i.e. wasn't a duplicate).
    pub fn insert(&self, key: (u64, String, u64)) -> bool {
        let mut g = self.order.lock();
        if g.1.contains(&key) {
            return false;
        }
        g.1.insert(key.clone());
        g.0.push_back(key);
        while g.0.len() > self.capacity {
            if let Some(old) = g.0.pop_front() {
                g.1.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, key: &(u64, String, u64)) -> bool {
        self.order.lock().1.contains(key)
    }
}

/// Tombstone filter: `name -> deadline` (unix micros) used by the Serf
/// layer to evict Left/Failed members once their tombstone expires.
#[derive(Default)]
pub struct TombstoneFilter {
    deadlines: Mutex<HashMap<String, i64>>,
}

impl TombstoneFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, deadline_micros: i64) {
        self.deadlines.lock().insert(name.into(), deadline_micros);
    }

    pub fn remove(&self, name: &str) {
        self.deadlines.lock().remove(name);
    }

    /// Names whose tombstone deadline has elapsed as of `now_micros`.
    pub fn expired(&self, now_micros: i64) -> Vec<String> {
        self.deadlines
            .lock()
            .iter()
            .filter(|(_, &deadline)| now_micros >= deadline)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// FNV-1a, used to build the `hash(payload)` component of user-event and
/// query dedup keys. Not cryptographic; collision resistance only needs
/// to be good enough to avoid spurious drops within one event buffer window.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_never_decreases() {
        let c = LClock::new();
        c.witness(10);
        assert_eq!(c.time(), 10);
        c.witness(3);
        assert_eq!(c.time(), 10);
    }

    #[test]
    fn increment_is_monotonic() {
        let c = LClock::new();
        assert_eq!(c.increment(), 1);
        assert_eq!(c.increment(), 2);
    }

    #[test]
    fn recent_filter_rejects_duplicates() {
        let f = RecentFilter::new(2);
        assert!(f.insert((1, "a".into(), 0)));
        assert!(!f.insert((1, "a".into(), 0)));
    }

    #[test]
    fn recent_filter_evicts_oldest() {
        let f = RecentFilter::new(1);
        f.insert((1, "a".into(), 0));
        f.insert((2, "b".into(), 0));
        assert!(!f.contains(&(1, "a".into(), 0)));
        assert!(f.contains(&(2, "b".into(), 0)));
    }

    #[test]
    fn tombstones_expire() {
        let t = TombstoneFilter::new();
        t.set("n1", 100);
        assert!(t.expired(50).is_empty());
        assert_eq!(t.expired(100), vec!["n1".to_string()]);
    }
}
