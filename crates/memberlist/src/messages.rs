use crate::node::Incarnation;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The 1-byte type tag prefixing every packet/stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    User = 8,
    Compress = 9,
    Encrypt = 10,
    Nack = 11,
    HasCrc = 12,
    Err = 13,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use PacketType::*;
        Some(match b {
            0 => Ping,
            1 => IndirectPing,
            2 => Ack,
            3 => Suspect,
            4 => Alive,
            5 => Dead,
            6 => PushPull,
            7 => Compound,
            8 => User,
            9 => Compress,
            10 => Encrypt,
            11 => Nack,
            12 => HasCrc,
            13 => Err,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq: u32,
    pub source: String,
    pub target: String,
    pub target_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub seq: u32,
    /// piggy-backed opaque payload (e.g. Serf's coordinate ping reply);
    /// empty unless the upper layer has something to attach.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nack {
    pub seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: Incarnation,
    pub name: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: Incarnation,
    pub name: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: Incarnation,
    pub name: String,
    pub from: String,
}

/// One row exchanged during push/pull full-state sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: Incarnation,
    pub state: crate::node::NodeState,
    pub meta: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPull {
    pub nodes: Vec<PushNodeState>,
    /// Opaque Serf-layer state blob (`LocalState`/`MergeRemoteState` in the
    /// delegate interface); the membership engine never looks inside it.
    pub user_state: Vec<u8>,
    pub join: bool,
}

/// A batch of small messages piggy-backed on one UDP datagram (tag 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compound {
    pub parts: Vec<Vec<u8>>,
}

/// Tag 8: an opaque message handed up to the delegate (the Serf layer owns
/// its own tagged union inside this envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMsg {
    pub payload: Vec<u8>,
}
