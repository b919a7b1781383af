//! Wire types for the length-framed MessagePack RPC protocol (§4.G). Field
//! names are `PascalCase` on the wire to match the shape spec.md's command
//! table describes (`{Command, Seq}`, `{AuthKey}`, `{Num}`, ...).
use serde::{Deserialize, Serialize};
use serf::{Member, MemberEvent, QueryEventRecord, UserEventRecord};
use std::collections::HashMap;

pub const MIN_IPC_VERSION: i64 = 1;
pub const MAX_IPC_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestHeader {
    pub command: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseHeader {
    pub seq: u64,
    pub error: String,
}

impl ResponseHeader {
    pub fn ok(seq: u64) -> Self {
        Self { seq, error: String::new() }
    }

    pub fn err(seq: u64, message: impl Into<String>) -> Self {
        Self { seq, error: message.into() }
    }

    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpcMember {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: String,
    pub protocol_cur: u8,
}

impl From<Member> for IpcMember {
    fn from(m: Member) -> Self {
        Self {
            name: m.name,
            addr: m.addr.ip().to_string(),
            port: m.addr.port(),
            tags: m.tags,
            status: member_status_str(m.status).to_string(),
            protocol_cur: 1,
        }
    }
}

pub fn member_status_str(status: serf::MemberStatus) -> &'static str {
    use serf::MemberStatus::*;
    match status {
        Alive => "alive",
        Leaving => "leaving",
        Left => "left",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MembersResponse {
    pub members: Vec<IpcMember>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MembersFilteredRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRequest {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub filter_nodes: Vec<String>,
    #[serde(default)]
    pub filter_tags: HashMap<String, String>,
    #[serde(default)]
    pub request_ack: bool,
    #[serde(default)]
    pub relay_factor: u8,
    /// Milliseconds; `0` means "use the agent default".
    #[serde(default)]
    pub timeout: u64,
    pub name: String,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRecord {
    #[serde(rename = "Type")]
    pub ty: String,
    pub from: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl QueryRecord {
    pub fn ack(from: impl Into<String>) -> Self {
        Self { ty: "ack".into(), from: from.into(), payload: Vec::new() }
    }
    pub fn response(from: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { ty: "response".into(), from: from.into(), payload }
    }
    pub fn done() -> Self {
        Self { ty: "done".into(), from: String::new(), payload: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RespondRequest {
    pub id: u32,
    /// Disambiguates `ID` across concurrently querying nodes (spec.md §4.E's
    /// own query correlation tuple is `(LTime, id, source)`; `ID` alone
    /// collides whenever two queriers both happen to be at sequence n).
    /// The client already has this value verbatim from the `QueryRecord`
    /// its `stream` subscription delivered, so this adds no round trip.
    pub ltime: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    pub existing: Vec<String>,
    #[serde(default)]
    pub replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub num: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForceLeaveRequest {
    pub node: String,
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagsRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub delete_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyRequest {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyResponse {
    pub messages: HashMap<String, String>,
    pub keys: HashMap<String, Vec<String>>,
    pub num_nodes: usize,
    pub num_err: usize,
    pub num_resp: usize,
}

impl From<serf::messages::KeyResponse> for KeyResponse {
    fn from(r: serf::messages::KeyResponse) -> Self {
        Self {
            messages: r.messages,
            keys: r
                .keys
                .into_iter()
                .map(|(node, keys)| (node, keys.into_iter().map(|k| hex::encode(k)).collect()))
                .collect(),
            num_nodes: r.num_nodes,
            num_err: r.num_err,
            num_resp: r.num_resp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsResponse {
    pub sections: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCoordinateRequest {
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCoordinateResponse {
    pub coord: Option<serf::Coordinate>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorRequest {
    #[serde(default)]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRequest {
    #[serde(rename = "Type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopRequest {
    pub stop: u64,
}

/// One record delivered over a `stream` subscription (§4.G "Streaming").
/// The three event kinds ride the same connection but are distinguished by
/// the enum tag on the wire, same as `SerfMessage` does for the cluster
/// protocol's own tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StreamRecord {
    Member(MemberEvent),
    User(UserEventRecord),
    Query(QueryEventRecord),
}

