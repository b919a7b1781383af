use crate::node::{Incarnation, Node};

/// The narrow interface the membership engine uses to call back up into
/// the Serf layer: explicit trait injection instead of a cyclic
/// agent/serf/membership object graph. The Serf overlay implements this
/// and is handed to `Membership::new`.
pub trait Delegate: Send + Sync + 'static {
    /// A node was newly installed in the table (first Alive ever seen).
    fn notify_join(&self, node: &Node);
    /// A node left gracefully (self-Dead with `from == name`).
    fn notify_leave(&self, node: &Node);
    /// A node's `meta` blob changed (tags propagated via a fresh Alive).
    fn notify_update(&self, node: &Node);
    /// Two conflicting `Alive` claims for the same name/incarnation arrived
    /// from different addresses.
    fn notify_conflict(&self, existing: &Node, conflicting: &Node);
    /// An Alive was delivered for `node` (refutation opportunities, gossip
    /// of tag changes); called in addition to `notify_join`/`notify_update`.
    fn notify_alive(&self, node: &Node);

    /// Opaque Serf-layer state to embed in an outgoing push/pull exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;
    /// Apply a Serf-layer state blob received during push/pull.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    /// Opaque metadata to attach to a locally originated `Alive` broadcast
    /// (the encoded tag map).
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Additional broadcasts the delegate wants piggy-backed on the next
    /// outgoing probe/gossip packet (Serf's own message types: user events,
    /// queries, leave-intents, ...).
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// A raw application (tag 8, `User`) message arrived; hand it to Serf's
    /// own tagged-union decoder.
    fn notify_msg(&self, msg: &[u8]);

    /// incarnation refutation hook is handled inside the membership engine
    /// itself (only it owns the node table), but Serf is informed so it can
    /// re-broadcast tags alongside the refutation.
    fn ack_incarnation(&self, new_incarnation: Incarnation) {
        let _ = new_incarnation;
    }
}
