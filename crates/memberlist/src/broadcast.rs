use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// A pending gossip message. `on_finished` fires once the
/// retransmit limit is hit and the entry is discarded without being
/// re-enqueued.
pub struct Broadcast {
    pub token: String,
    pub payload: Vec<u8>,
    pub transmits: u32,
    pub enqueued_at: u64,
    pub on_finished: Option<Box<dyn FnOnce() + Send>>,
}

impl Broadcast {
    pub fn new(token: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            token: token.into(),
            payload,
            transmits: 0,
            enqueued_at: 0,
            on_finished: None,
        }
    }

    pub fn with_callback(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(cb));
        self
    }
}

/// Ascending `(transmit_count, enqueue_time)` — entries that have been sent
/// the fewest times go out first; among equals, FIFO.
/// `BinaryHeap` is a max-heap, so this ordering is reversed to make it act
/// as a min-heap on `(transmits, enqueued_at)`.
struct HeapEntry {
    transmits: u32,
    enqueued_at: u64,
    token: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.transmits == other.transmits && self.enqueued_at == other.enqueued_at
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .transmits
            .cmp(&self.transmits)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    entries: HashMap<String, Broadcast>,
    seq: u64,
}

/// Broadcast queue: priority queue of pending outbound messages keyed
/// by a dedup token, ordered by transmit count ascending. Same-token
/// enqueue replaces the older entry.
#[derive(Clone)]
pub struct TransmitQueue {
    inner: Arc<Mutex<Inner>>,
}

impl Default for TransmitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
                seq: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `broadcast`; an existing entry with the same token is
    /// replaced (and its `on_finished`, if any, is silently dropped without
    /// firing — it never reached its retransmit limit, it was superseded).
    pub fn enqueue(&self, mut broadcast: Broadcast) {
        let mut g = self.inner.lock();
        g.seq += 1;
        broadcast.enqueued_at = g.seq;
        let token = broadcast.token.clone();
        g.heap.push(HeapEntry {
            transmits: broadcast.transmits,
            enqueued_at: broadcast.enqueued_at,
            token: token.clone(),
        });
        g.entries.insert(token, broadcast);
    }

    /// `get_broadcasts`: pops entries in `(transmits, enqueued_at)`
    /// order while their cumulative serialized size (plus `overhead` per
    /// element) stays within `limit`. Popped entries have their transmit
    /// count incremented and are either re-inserted or discarded (firing
    /// `on_finished`) once `transmits >= retransmit_limit`.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize, retransmit_limit: u32) -> Vec<Vec<u8>> {
        let mut g = self.inner.lock();
        let mut out = Vec::new();
        let mut used = 0usize;
        let mut deferred = Vec::new();

        while let Some(top) = g.heap.pop() {
            // Stale heap entry (superseded by a newer enqueue of the same
            // token, or already finalized): skip.
            let current_matches = g
                .entries
                .get(&top.token)
                .map(|b| b.transmits == top.transmits && b.enqueued_at == top.enqueued_at)
                .unwrap_or(false);
            if !current_matches {
                continue;
            }

            let size = g.entries.get(&top.token).map(|b| b.payload.len()).unwrap_or(0) + overhead;
            if used + size > limit {
                deferred.push(top);
                break;
            }
            used += size;

            let mut broadcast = g.entries.remove(&top.token).expect("checked above");
            out.push(broadcast.payload.clone());
            broadcast.transmits += 1;

            if broadcast.transmits >= retransmit_limit {
                if let Some(cb) = broadcast.on_finished.take() {
                    cb();
                }
            } else {
                g.heap.push(HeapEntry {
                    transmits: broadcast.transmits,
                    enqueued_at: broadcast.enqueued_at,
                    token: broadcast.token.clone(),
                });
                g.entries.insert(broadcast.token.clone(), broadcast);
            }
        }

        for d in deferred {
            g.heap.push(d);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_transmit_count_then_fifo() {
        let q = TransmitQueue::new();
        q.enqueue(Broadcast::new("a", vec![0; 4]));
        q.enqueue(Broadcast::new("b", vec![0; 4]));
        let first = q.get_broadcasts(0, 4, 100);
        assert_eq!(first, vec![vec![0u8; 4]]);
        let second = q.get_broadcasts(0, 4, 100);
        assert_eq!(second, vec![vec![0u8; 4]]);
        // both now have transmits=1, "a" still enqueued before "b" in this round
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn same_token_replaces_older_entry() {
        let q = TransmitQueue::new();
        q.enqueue(Broadcast::new("tok", vec![1]));
        q.enqueue(Broadcast::new("tok", vec![2]));
        assert_eq!(q.len(), 1);
        let out = q.get_broadcasts(0, 100, 100);
        assert_eq!(out, vec![vec![2]]);
    }

    #[test]
    fn discards_and_fires_callback_at_retransmit_limit() {
        let q = TransmitQueue::new();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();
        q.enqueue(Broadcast::new("tok", vec![1]).with_callback(move || *fired2.lock() = true));
        // retransmit_limit = 1: a single pop should finalize it.
        let _ = q.get_broadcasts(0, 100, 1);
        assert!(*fired.lock());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn respects_size_limit() {
        let q = TransmitQueue::new();
        q.enqueue(Broadcast::new("a", vec![0; 10]));
        q.enqueue(Broadcast::new("b", vec![0; 10]));
        let out = q.get_broadcasts(0, 10, 100);
        assert_eq!(out.len(), 1);
    }
}
