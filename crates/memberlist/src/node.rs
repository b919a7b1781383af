use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-node incarnation number: monotonic, owned
/// exclusively by the node it describes. Only that node may increase it.
pub type Incarnation = u32;

/// Alive < Suspect < Dead for tie-breaking equal
/// incarnations during push/pull reconciliation and message handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum NodeState {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
    Left = 3,
}

/// A row of the membership node table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: Incarnation,
    pub state: NodeState,
    /// Unix micros of the last state transition, used only for diagnostics;
    /// never part of conflict resolution (incarnation/state ordering is).
    pub state_change: i64,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    /// Opaque metadata blob owned by the upper (Serf) layer: encoded tags.
    pub meta: Vec<u8>,
}

impl Node {
    pub fn new(name: String, addr: SocketAddr, incarnation: Incarnation) -> Self {
        Self {
            name,
            addr,
            incarnation,
            state: NodeState::Alive,
            state_change: now_micros(),
            protocol_min: 1,
            protocol_max: 1,
            protocol_cur: 1,
            meta: Vec::new(),
        }
    }

    pub fn touch(&mut self, state: NodeState) {
        self.state = state;
        self.state_change = now_micros();
    }

    /// Push/pull reconciliation rule: higher incarnation wins; equal
    /// incarnation, the "worse" (numerically larger) state wins.
    pub fn supersedes(&self, other: &Node) -> bool {
        (self.incarnation, self.state) > (other.incarnation, other.state)
    }
}

pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
