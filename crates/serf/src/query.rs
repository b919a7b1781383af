use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter_nodes: Vec<String>,
    pub filter_tags: HashMap<String, String>,
    pub request_ack: bool,
    pub relay_factor: u8,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Fan-in channels for one outstanding query. Acks and responses arrive
/// independently; both close once the query's timeout elapses and the
/// engine drops its side of the collector.
pub struct QueryHandle {
    pub acks: mpsc::Receiver<String>,
    pub responses: mpsc::Receiver<NodeResponse>,
}

pub(crate) struct QueryCollector {
    pub ack_tx: mpsc::Sender<String>,
    pub response_tx: mpsc::Sender<NodeResponse>,
}
