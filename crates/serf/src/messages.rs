use crate::coordinate::Coordinate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveIntent {
    pub ltime: u64,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinIntent {
    pub ltime: u64,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventMsg {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMsg {
    pub ltime: u64,
    pub id: u32,
    pub source: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub ack: bool,
    pub filter_nodes: Vec<String>,
    pub filter_tags: HashMap<String, String>,
    pub relay_factor: u8,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponseMsg {
    pub ltime: u64,
    pub id: u32,
    pub from: String,
    pub payload: Vec<u8>,
    pub ack: bool,
}

/// Ships a `QueryResponseMsg` through an intermediate peer when a query's
/// `relay_factor` is nonzero, so the response still arrives even if the
/// querier and responder can't reach each other directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub dest: SocketAddr,
    pub response: QueryResponseMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub node: String,
    pub member: Option<crate::member::Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyOp {
    Install,
    Use,
    Remove,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub op: KeyOp,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyOpResult {
    Ok(Option<Vec<Vec<u8>>>),
    Err(String),
}

/// Aggregated result of a cluster-wide key operation, one entry per
/// responding node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyResponse {
    pub messages: HashMap<String, String>,
    pub keys: HashMap<String, Vec<Vec<u8>>>,
    pub num_nodes: usize,
    pub num_resp: usize,
    pub num_err: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatePing {
    pub id: u64,
    pub from: String,
    pub coord: Coordinate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatePong {
    pub id: u64,
    pub coord: Coordinate,
}

/// Opaque state folded into the membership layer's push/pull `user_state`
/// blob: just enough for the receiving side to fast-forward its own clocks,
/// since the node table itself already rides the `PushNodeState` rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPullState {
    pub ltime: u64,
    pub event_ltime: u64,
    pub query_ltime: u64,
}

/// The tagged union every Serf-layer message travels as once it's inside a
/// membership `User` packet (tag 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerfMessage {
    LeaveIntent(LeaveIntent),
    JoinIntent(JoinIntent),
    UserEvent(UserEventMsg),
    Query(QueryMsg),
    QueryResponse(QueryResponseMsg),
    Relay(Relay),
    ConflictResponse(ConflictResponse),
    KeyRequest(KeyRequest),
    CoordinatePing(CoordinatePing),
    CoordinatePong(CoordinatePong),
}
