use crate::member::Member;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberEventType {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEvent {
    pub ty: MemberEventType,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventRecord {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventRecord {
    pub ltime: u64,
    pub id: u32,
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Member(MemberEvent),
    User(UserEventRecord),
    Query(QueryEventRecord),
}

pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Event);
}

struct Registered {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

/// In-process event dispatch: a bounded channel feeding a single dispatcher
/// task that fans each event out to every registered handler. Registration
/// is identity-based and idempotent (the returned token is the only way to
/// deregister); a handler that panics is caught and logged rather than
/// taking the dispatcher down with it.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    next_id: AtomicU64,
    handlers: Arc<parking_lot::Mutex<Vec<Registered>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity);
        let handlers: Arc<parking_lot::Mutex<Vec<Registered>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let dispatch_handlers = handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<Arc<dyn EventHandler>> =
                    dispatch_handlers.lock().iter().map(|r| r.handler.clone()).collect();
                for handler in snapshot {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler.handle(&event);
                    }));
                    if outcome.is_err() {
                        error!("event handler panicked, isolating and continuing");
                    }
                }
            }
        });
        Self {
            tx,
            next_id: AtomicU64::new(1),
            handlers,
        }
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().push(Registered { id, handler });
        id
    }

    pub fn deregister(&self, id: u64) {
        self.handlers.lock().retain(|r| r.id != id);
    }

    /// Enqueues `event`; if the bounded channel is full the event is
    /// dropped rather than blocking the caller, since probe and gossip
    /// tasks must never stall behind a slow handler.
    pub fn publish(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            warn!("event bus full, dropping event");
        }
    }
}
