use memberlist::node::{Incarnation, Node, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A member's externally visible lifecycle state. `Suspect` at the SWIM
/// layer is deliberately not exposed here: a member stays `Alive` from the
/// outside until either a graceful leave (`Leaving`/`Left`) or a confirmed
/// failure (`Failed`) lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

impl From<NodeState> for MemberStatus {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Alive | NodeState::Suspect => MemberStatus::Alive,
            NodeState::Dead => MemberStatus::Failed,
            NodeState::Left => MemberStatus::Left,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: Incarnation,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
    pub status_ltime: u64,
}

impl Member {
    pub fn from_node(node: &Node, tags: HashMap<String, String>, status_ltime: u64) -> Self {
        Self {
            name: node.name.clone(),
            addr: node.addr,
            incarnation: node.incarnation,
            status: MemberStatus::from(node.state),
            tags,
            status_ltime,
        }
    }
}
