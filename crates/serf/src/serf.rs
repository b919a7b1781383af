use crate::config::SerfConfig;
use crate::coordinate::{Coordinate, CoordinateClient, CoordinateStats};
use crate::error::{SerfError, SerfResult};
use crate::event::{Event, EventBus, MemberEvent, MemberEventType, QueryEventRecord, UserEventRecord};
use crate::member::{Member, MemberStatus};
use crate::messages::{
    CoordinatePing, CoordinatePong, JoinIntent, KeyOp, KeyOpResult, KeyRequest, KeyResponse, LeaveIntent,
    PushPullState, QueryMsg, QueryResponseMsg, Relay, SerfMessage, UserEventMsg,
};
use crate::query::{NodeResponse, QueryCollector, QueryHandle, QueryParams};
use crate::snapshot::Snapshotter;
use memberlist::clock::{fnv1a, LClock, RecentFilter, TombstoneFilter};
use memberlist::delegate::Delegate;
use memberlist::keyring::Keyring;
use memberlist::messages::PacketType;
use memberlist::node::{now_micros, Node, NodeState};
use memberlist::Membership;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

const INTERNAL_KEY_QUERY: &str = "_serf_key_query";
const RECENT_FILTER_MULTIPLIER: usize = 2;

#[derive(Debug, Clone, Copy)]
enum IntentKind {
    Join,
    Leave,
}

struct Inner {
    config: SerfConfig,
    membership: Membership,
    tags: Mutex<HashMap<String, String>>,
    keyring: Option<Keyring>,
    clock: LClock,
    event_clock: LClock,
    query_clock: LClock,
    members: Mutex<HashMap<String, Member>>,
    intents: Mutex<HashMap<String, (IntentKind, u64)>>,
    event_buffer: Mutex<VecDeque<UserEventRecord>>,
    recent_events: RecentFilter,
    recent_queries: RecentFilter,
    queries: Mutex<HashMap<(u64, u32, String), QueryCollector>>,
    next_query_id: AtomicU32,
    pending_responses: Mutex<HashMap<(u64, u32), String>>,
    pending_coord_pings: Mutex<HashMap<u64, (String, Instant)>>,
    next_coord_ping_id: AtomicU64,
    coordinate: CoordinateClient,
    event_bus: EventBus,
    snapshotter: Arc<dyn Snapshotter>,
    tombstones: TombstoneFilter,
}

/// A bridge that forwards `Delegate` callbacks into `Inner` through a weak
/// reference. Needed because `Membership::new` wants a `Delegate` before
/// `Inner` (which owns the `Membership` handle) can exist.
struct DelegateBridge {
    inner: Mutex<Option<Weak<Inner>>>,
}

impl DelegateBridge {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
        })
    }

    fn bind(&self, inner: &Arc<Inner>) {
        *self.inner.lock() = Some(Arc::downgrade(inner));
    }

    fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> R) -> Option<R> {
        let weak = self.inner.lock().clone()?;
        let arc = weak.upgrade()?;
        Some(f(&arc))
    }
}

impl Delegate for DelegateBridge {
    fn notify_join(&self, node: &Node) {
        self.with_inner(|inner| inner.on_join(node));
    }

    fn notify_leave(&self, node: &Node) {
        self.with_inner(|inner| inner.on_leave(node));
    }

    fn notify_update(&self, node: &Node) {
        self.with_inner(|inner| inner.on_update(node));
    }

    fn notify_conflict(&self, existing: &Node, conflicting: &Node) {
        self.with_inner(|inner| inner.on_conflict(existing, conflicting));
    }

    fn notify_alive(&self, node: &Node) {
        self.with_inner(|inner| inner.apply_buffered_intent(&node.name));
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        self.with_inner(|inner| inner.local_state(join)).unwrap_or_default()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        self.with_inner(|inner| inner.merge_remote_state(buf, join));
    }

    fn node_meta(&self, limit: usize) -> Vec<u8> {
        self.with_inner(|inner| inner.node_meta(limit)).unwrap_or_default()
    }

    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        self.with_inner(|inner| inner.on_user_msg(msg));
    }
}

impl Inner {
    fn on_join(&self, node: &Node) {
        let tags = decode_tags(&node.meta);
        let ltime = self.clock.time();
        let member = Member::from_node(node, tags, ltime);
        self.members.lock().insert(node.name.clone(), member.clone());
        self.snapshotter.record_alive(&node.name, node.addr);
        self.event_bus.publish(Event::Member(MemberEvent {
            ty: MemberEventType::Join,
            members: vec![member],
        }));
        self.apply_buffered_intent(&node.name);
    }

    fn on_update(&self, node: &Node) {
        let tags = decode_tags(&node.meta);
        let ltime = self.clock.time();
        let member = {
            let mut members = self.members.lock();
            let Some(m) = members.get_mut(&node.name) else { return };
            m.tags = tags;
            m.incarnation = node.incarnation;
            m.status = MemberStatus::Alive;
            m.status_ltime = ltime;
            m.clone()
        };
        self.event_bus.publish(Event::Member(MemberEvent {
            ty: MemberEventType::Update,
            members: vec![member],
        }));
    }

    fn on_conflict(&self, existing: &Node, conflicting: &Node) {
        warn!(
            name = %existing.name,
            existing_addr = %existing.addr,
            conflicting_addr = %conflicting.addr,
            "name conflict observed"
        );
    }

    fn on_leave(&self, node: &Node) {
        let (status, ty) = match node.state {
            NodeState::Left => (MemberStatus::Left, MemberEventType::Leave),
            _ => (MemberStatus::Failed, MemberEventType::Failed),
        };
        let ltime = self.clock.time();
        let tombstone_deadline = now_micros() + self.config.tombstone_timeout.as_micros() as i64;
        let member = {
            let mut members = self.members.lock();
            let entry = members
                .entry(node.name.clone())
                .or_insert_with(|| Member::from_node(node, HashMap::new(), ltime));
            entry.status = status;
            entry.status_ltime = ltime;
            entry.clone()
        };
        self.tombstones.set(node.name.clone(), tombstone_deadline);
        self.snapshotter.record_not_alive(&node.name);
        self.event_bus.publish(Event::Member(MemberEvent { ty, members: vec![member] }));
        self.apply_buffered_intent(&node.name);
    }

    fn set_member_status(&self, name: &str, status: MemberStatus, ltime: u64) -> Option<Member> {
        let mut members = self.members.lock();
        let entry = members.get_mut(name)?;
        entry.status = status;
        entry.status_ltime = ltime;
        Some(entry.clone())
    }

    /// Applies a buffered join/leave intent once the member's Alive/Dead
    /// transition it was waiting on has landed.
    fn apply_buffered_intent(&self, name: &str) {
        let Some((kind, ltime)) = self.intents.lock().remove(name) else {
            return;
        };
        let member_ltime = self.members.lock().get(name).map(|m| m.status_ltime).unwrap_or(0);
        if ltime <= member_ltime {
            return;
        }
        if let IntentKind::Leave = kind {
            if let Some(member) = self.set_member_status(name, MemberStatus::Leaving, ltime) {
                self.event_bus.publish(Event::Member(MemberEvent {
                    ty: MemberEventType::Leave,
                    members: vec![member],
                }));
            }
        }
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        let state = PushPullState {
            ltime: self.clock.time(),
            event_ltime: self.event_clock.time(),
            query_ltime: self.query_clock.time(),
        };
        rmp_serde::to_vec(&state).unwrap_or_default()
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        let Ok(state) = rmp_serde::from_slice::<PushPullState>(buf) else {
            return;
        };
        self.clock.witness(state.ltime);
        self.event_clock.witness(state.event_ltime);
        self.query_clock.witness(state.query_ltime);
    }

    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        rmp_serde::to_vec(&*self.tags.lock()).unwrap_or_default()
    }

    fn member_addr(&self, name: &str) -> Option<SocketAddr> {
        self.members.lock().get(name).map(|m| m.addr)
    }

    fn random_alive_member(&self, exclude: &str) -> Option<Member> {
        let mut candidates: Vec<Member> = self
            .members
            .lock()
            .values()
            .filter(|m| m.status == MemberStatus::Alive && m.name != exclude)
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().next()
    }

    fn tags_match(&self, filter_tags: &HashMap<String, String>) -> bool {
        if filter_tags.is_empty() {
            return true;
        }
        let my_tags = self.tags.lock();
        for (key, pattern) in filter_tags {
            let Some(value) = my_tags.get(key) else { return false };
            let Ok(re) = Regex::new(&format!("^{}$", pattern)) else { return false };
            if !re.is_match(value) {
                return false;
            }
        }
        true
    }

    fn deliver_user_event(&self, record: UserEventRecord) -> bool {
        let current = self.event_clock.time();
        let window = self.config.event_buffer_size as u64;
        if current > window && record.ltime < current - window {
            return false;
        }
        let key = (record.ltime, record.name.clone(), fnv1a(&record.payload));
        if !self.recent_events.insert(key) {
            return false;
        }

        let mut buf = self.event_buffer.lock();
        if record.coalesce {
            if let Some(slot) = buf.iter_mut().rev().find(|e| e.name == record.name) {
                *slot = record.clone();
            } else {
                buf.push_back(record.clone());
            }
        } else {
            buf.push_back(record.clone());
        }
        while buf.len() > self.config.event_buffer_size {
            buf.pop_front();
        }
        drop(buf);

        self.snapshotter.record_event_clock(record.ltime);
        self.event_bus.publish(Event::User(record));
        true
    }

    fn handle_leave_intent(&self, intent: LeaveIntent) {
        self.clock.witness(intent.ltime);
        let member_ltime = self.members.lock().get(&intent.node).map(|m| m.status_ltime);
        match member_ltime {
            Some(ltime) if intent.ltime <= ltime => {}
            Some(_) => {
                if let Some(member) = self.set_member_status(&intent.node, MemberStatus::Leaving, intent.ltime) {
                    self.event_bus.publish(Event::Member(MemberEvent {
                        ty: MemberEventType::Leave,
                        members: vec![member],
                    }));
                }
            }
            None => {
                self.intents.lock().insert(intent.node, (IntentKind::Leave, intent.ltime));
            }
        }
    }

    fn handle_join_intent(&self, intent: JoinIntent) {
        self.clock.witness(intent.ltime);
        let member_ltime = self.members.lock().get(&intent.node).map(|m| m.status_ltime);
        if member_ltime.is_none() {
            self.intents.lock().insert(intent.node, (IntentKind::Join, intent.ltime));
        }
    }

    fn handle_internal_query(&self, name: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if name != INTERNAL_KEY_QUERY {
            return None;
        }
        let req: KeyRequest = rmp_serde::from_slice(payload).ok()?;
        let result = match self.apply_key_op_locally(&req.op, req.key.as_deref()) {
            Ok(keys) => KeyOpResult::Ok(keys),
            Err(e) => KeyOpResult::Err(e.to_string()),
        };
        rmp_serde::to_vec(&result).ok()
    }

    fn apply_key_op_locally(&self, op: &KeyOp, key: Option<&[u8]>) -> SerfResult<Option<Vec<Vec<u8>>>> {
        let keyring = self
            .keyring
            .as_ref()
            .ok_or_else(|| SerfError::Keyring("encryption not enabled on this node".into()))?;
        match op {
            KeyOp::Install => {
                let key = key.ok_or_else(|| SerfError::Keyring("missing key".into()))?;
                keyring.install_key(key.to_vec())?;
                Ok(None)
            }
            KeyOp::Use => {
                let key = key.ok_or_else(|| SerfError::Keyring("missing key".into()))?;
                keyring.use_key(key)?;
                Ok(None)
            }
            KeyOp::Remove => {
                let key = key.ok_or_else(|| SerfError::Keyring("missing key".into()))?;
                keyring.remove_key(key)?;
                Ok(None)
            }
            KeyOp::List => Ok(Some(keyring.list_keys())),
        }
    }

    fn handle_query_msg(&self, msg: QueryMsg) {
        self.query_clock.witness(msg.ltime);
        self.snapshotter.record_query_clock(msg.ltime);
        let dedup_key = (msg.ltime, msg.source.clone(), msg.id as u64);
        if !self.recent_queries.insert(dedup_key) {
            return;
        }
        if !msg.filter_nodes.is_empty() && !msg.filter_nodes.contains(&self.config.node_name) {
            return;
        }
        if !self.tags_match(&msg.filter_tags) {
            return;
        }

        if msg.ack {
            self.send_query_response(
                &msg.source,
                QueryResponseMsg {
                    ltime: msg.ltime,
                    id: msg.id,
                    from: self.config.node_name.clone(),
                    payload: Vec::new(),
                    ack: true,
                },
                msg.relay_factor,
            );
        }

        if let Some(result) = self.handle_internal_query(&msg.name, &msg.payload) {
            self.send_query_response(
                &msg.source,
                QueryResponseMsg {
                    ltime: msg.ltime,
                    id: msg.id,
                    from: self.config.node_name.clone(),
                    payload: result,
                    ack: false,
                },
                msg.relay_factor,
            );
            return;
        }

        self.pending_responses.lock().insert((msg.ltime, msg.id), msg.source.clone());
        self.event_bus.publish(Event::Query(QueryEventRecord {
            ltime: msg.ltime,
            id: msg.id,
            name: msg.name,
            payload: msg.payload,
        }));
    }

    fn send_query_response(&self, dest_name: &str, resp: QueryResponseMsg, relay_factor: u8) {
        let Some(addr) = self.member_addr(dest_name) else { return };
        let membership = self.membership.clone();
        let Ok(body) = rmp_serde::to_vec(&SerfMessage::QueryResponse(resp.clone())) else {
            return;
        };
        tokio::spawn(async move {
            membership.send_raw(addr, PacketType::User, body).await;
        });

        if relay_factor > 0 {
            let relays = self.random_alive_member(dest_name).into_iter().take(relay_factor as usize);
            for relay_peer in relays {
                let membership = self.membership.clone();
                let relay_msg = Relay { dest: addr, response: resp.clone() };
                if let Ok(body) = rmp_serde::to_vec(&SerfMessage::Relay(relay_msg)) {
                    tokio::spawn(async move {
                        membership.send_raw(relay_peer.addr, PacketType::User, body).await;
                    });
                }
            }
        }
    }

    fn handle_query_response(&self, resp: QueryResponseMsg) {
        let key = (resp.ltime, resp.id, self.config.node_name.clone());
        let queries = self.queries.lock();
        let Some(collector) = queries.get(&key) else { return };
        if resp.ack {
            let _ = collector.ack_tx.try_send(resp.from);
        } else {
            let _ = collector.response_tx.try_send(NodeResponse { from: resp.from, payload: resp.payload });
        }
    }

    fn handle_relay(&self, relay: Relay) {
        let membership = self.membership.clone();
        let Ok(body) = rmp_serde::to_vec(&SerfMessage::QueryResponse(relay.response)) else {
            return;
        };
        tokio::spawn(async move {
            membership.send_raw(relay.dest, PacketType::User, body).await;
        });
    }

    fn handle_coordinate_ping(&self, ping: CoordinatePing) {
        let Some(addr) = self.member_addr(&ping.from) else { return };
        let pong = CoordinatePong { id: ping.id, coord: self.coordinate.get_coordinate() };
        let Ok(body) = rmp_serde::to_vec(&SerfMessage::CoordinatePong(pong)) else {
            return;
        };
        let membership = self.membership.clone();
        tokio::spawn(async move {
            membership.send_raw(addr, PacketType::User, body).await;
        });
    }

    fn handle_coordinate_pong(&self, pong: CoordinatePong) {
        let Some((peer, sent_at)) = self.pending_coord_pings.lock().remove(&pong.id) else {
            return;
        };
        self.coordinate.update(&peer, pong.coord, sent_at.elapsed());
        self.snapshotter.record_coordinate(&self.coordinate.get_coordinate());
    }

    fn on_user_msg(&self, msg: &[u8]) {
        let Ok(decoded) = rmp_serde::from_slice::<SerfMessage>(msg) else {
            return;
        };
        match decoded {
            SerfMessage::LeaveIntent(m) => self.handle_leave_intent(m),
            SerfMessage::JoinIntent(m) => self.handle_join_intent(m),
            SerfMessage::UserEvent(m) => {
                self.event_clock.witness(m.ltime);
                self.deliver_user_event(UserEventRecord {
                    ltime: m.ltime,
                    name: m.name,
                    payload: m.payload,
                    coalesce: m.coalesce,
                });
            }
            SerfMessage::Query(m) => self.handle_query_msg(m),
            SerfMessage::QueryResponse(m) => self.handle_query_response(m),
            SerfMessage::Relay(m) => self.handle_relay(m),
            SerfMessage::ConflictResponse(_) => {}
            SerfMessage::KeyRequest(_) => {}
            SerfMessage::CoordinatePing(m) => self.handle_coordinate_ping(m),
            SerfMessage::CoordinatePong(m) => self.handle_coordinate_pong(m),
        }
    }
}

fn decode_tags(meta: &[u8]) -> HashMap<String, String> {
    if meta.is_empty() {
        return HashMap::new();
    }
    rmp_serde::from_slice(meta).unwrap_or_default()
}

/// The cluster overlay: named, tagged membership with user events, queries,
/// and network coordinates, built on top of the SWIM failure detector.
#[derive(Clone)]
pub struct Serf {
    inner: Arc<Inner>,
}

impl Serf {
    pub async fn new(config: SerfConfig, snapshotter: Arc<dyn Snapshotter>) -> SerfResult<Self> {
        let bridge = DelegateBridge::new();
        let node_name = config.node_name.clone();
        let event_buffer_size = config.event_buffer_size;
        let keyring = config.keyring.clone();

        let membership = Membership::new(
            node_name.clone(),
            config.membership.clone(),
            keyring.clone(),
            bridge.clone() as Arc<dyn Delegate>,
        )
        .await?;

        let recent_capacity = event_buffer_size.max(64) * RECENT_FILTER_MULTIPLIER;
        let inner = Arc::new(Inner {
            tags: Mutex::new(config.initial_tags.clone()),
            keyring,
            config,
            membership: membership.clone(),
            clock: LClock::new(),
            event_clock: LClock::new(),
            query_clock: LClock::new(),
            members: Mutex::new(HashMap::new()),
            intents: Mutex::new(HashMap::new()),
            event_buffer: Mutex::new(VecDeque::new()),
            recent_events: RecentFilter::new(recent_capacity),
            recent_queries: RecentFilter::new(recent_capacity),
            queries: Mutex::new(HashMap::new()),
            next_query_id: AtomicU32::new(0),
            pending_responses: Mutex::new(HashMap::new()),
            pending_coord_pings: Mutex::new(HashMap::new()),
            next_coord_ping_id: AtomicU64::new(0),
            coordinate: CoordinateClient::new(),
            event_bus: EventBus::new(1024),
            snapshotter,
            tombstones: TombstoneFilter::new(),
        });
        bridge.bind(&inner);

        {
            let local_node = membership.local_node();
            let local_tags = inner.tags.lock().clone();
            let member = Member::from_node(&local_node, local_tags, 0);
            inner.members.lock().insert(node_name, member);
        }

        let serf = Self { inner };
        tokio::spawn({
            let serf = serf.clone();
            async move { serf.reap_loop().await }
        });
        tokio::spawn({
            let serf = serf.clone();
            async move { serf.coordinate_loop().await }
        });
        Ok(serf)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.membership.local_addr()
    }

    /// Folds in clock values recovered from a snapshot (§4.E) so a
    /// restarted node never replays an event/query it already delivered
    /// last run just because its in-memory clock restarted from zero.
    pub fn witness_clocks(&self, event_ltime: u64, query_ltime: u64) {
        self.inner.event_clock.witness(event_ltime);
        self.inner.query_clock.witness(query_ltime);
    }

    /// Registers an event handler with the agent's event bus; returns a
    /// token for [`Serf::deregister_event_handler`]. This is the seam an
    /// RPC server's `stream`/`monitor` subscriptions hang off of.
    pub fn register_event_handler(&self, handler: Arc<dyn crate::event::EventHandler>) -> u64 {
        self.inner.event_bus.register(handler)
    }

    pub fn deregister_event_handler(&self, id: u64) {
        self.inner.event_bus.deregister(id)
    }

    pub fn local_member(&self) -> Member {
        self.inner
            .members
            .lock()
            .get(&self.inner.config.node_name)
            .cloned()
            .unwrap_or_else(|| Member::from_node(&self.inner.membership.local_node(), self.inner.tags.lock().clone(), 0))
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.members.lock().values().cloned().collect()
    }

    /// Filters the member list by status, a name regex, and a set of
    /// per-tag regexes (all anchored, all must match).
    pub fn members_filtered(
        &self,
        tags: &HashMap<String, String>,
        status: Option<MemberStatus>,
        name_pattern: Option<&str>,
    ) -> SerfResult<Vec<Member>> {
        let name_re = match name_pattern {
            Some(p) => Some(Regex::new(&format!("^{}$", p))?),
            None => None,
        };
        let mut tag_res = Vec::with_capacity(tags.len());
        for (k, pattern) in tags {
            tag_res.push((k.clone(), Regex::new(&format!("^{}$", pattern))?));
        }
        Ok(self
            .members()
            .into_iter()
            .filter(|m| {
                if let Some(want) = status {
                    if m.status != want {
                        return false;
                    }
                }
                if let Some(re) = &name_re {
                    if !re.is_match(&m.name) {
                        return false;
                    }
                }
                for (k, re) in &tag_res {
                    match m.tags.get(k) {
                        Some(v) if re.is_match(v) => {}
                        _ => return false,
                    }
                }
                true
            })
            .collect())
    }

    pub async fn join(&self, addrs: &[SocketAddr]) -> (usize, Vec<(SocketAddr, SerfError)>) {
        let mut ok = 0;
        let mut errors = Vec::new();
        for addr in addrs {
            match self.inner.membership.join(*addr).await {
                Ok(_) => ok += 1,
                Err(e) => errors.push((*addr, SerfError::from(e))),
            }
        }
        (ok, errors)
    }

    /// Announces a graceful departure: a cluster-wide leave-intent
    /// broadcast, then hands off to the membership layer's own leave
    /// (incarnation bump, self-Dead broadcast, and a few gossip cycles to
    /// flush it before returning).
    pub async fn leave(&self) {
        let ltime = self.inner.clock.increment();
        let intent = LeaveIntent { ltime, node: self.inner.config.node_name.clone() };
        if let Ok(body) = rmp_serde::to_vec(&SerfMessage::LeaveIntent(intent)) {
            self.inner
                .membership
                .enqueue_broadcast(format!("l-{}", self.inner.config.node_name), PacketType::User, body);
        }
        self.inner.snapshotter.record_leave();
        self.inner.membership.leave().await;
    }

    pub fn force_leave(&self, name: &str, prune: bool) {
        let ltime = self.inner.clock.time();
        if let Some(member) = self.inner.set_member_status(name, MemberStatus::Left, ltime) {
            self.inner.event_bus.publish(Event::Member(MemberEvent {
                ty: MemberEventType::Leave,
                members: vec![member],
            }));
        }
        if prune {
            self.inner.members.lock().remove(name);
        }
    }

    /// Replaces this node's tag map and propagates the change as a fresh
    /// `Alive` through the membership layer. Merge/delete semantics on top
    /// of the current tags are the caller's responsibility (see
    /// `local_member().tags` for the current map).
    pub fn set_tags(&self, tags: HashMap<String, String>) {
        *self.inner.tags.lock() = tags;
        self.inner.membership.update_local_meta();
    }

    pub async fn user_event(&self, name: impl Into<String>, payload: Vec<u8>, coalesce: bool) -> SerfResult<()> {
        let name = name.into();
        let ltime = self.inner.event_clock.increment();
        let record = UserEventRecord { ltime, name: name.clone(), payload: payload.clone(), coalesce };
        self.inner.deliver_user_event(record);

        let msg = UserEventMsg { ltime, name: name.clone(), payload, coalesce };
        let body = rmp_serde::to_vec(&SerfMessage::UserEvent(msg))?;
        self.inner.membership.enqueue_broadcast(format!("ev-{}", name), PacketType::User, body);
        Ok(())
    }

    pub async fn query(&self, name: impl Into<String>, payload: Vec<u8>, params: QueryParams) -> SerfResult<QueryHandle> {
        let name = name.into();
        let ltime = self.inner.query_clock.increment();
        self.inner.snapshotter.record_query_clock(ltime);
        let id = self.inner.next_query_id.fetch_add(1, Ordering::SeqCst);
        let source = self.inner.config.node_name.clone();

        let (ack_tx, acks) = mpsc::channel(64);
        let (response_tx, responses) = mpsc::channel(64);
        let key = (ltime, id, source.clone());
        self.inner.queries.lock().insert(key.clone(), QueryCollector { ack_tx, response_tx });

        let timeout = if params.timeout.is_zero() { Duration::from_secs(15) } else { params.timeout };
        let this = self.clone();
        let cleanup_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.inner.queries.lock().remove(&cleanup_key);
        });

        let msg = QueryMsg {
            ltime,
            id,
            source,
            name,
            payload,
            ack: params.request_ack,
            filter_nodes: params.filter_nodes,
            filter_tags: params.filter_tags,
            relay_factor: params.relay_factor,
            timeout_ms: timeout.as_millis() as u64,
        };
        let body = rmp_serde::to_vec(&SerfMessage::Query(msg))?;
        self.inner.membership.enqueue_broadcast(format!("q-{}", id), PacketType::User, body);
        Ok(QueryHandle { acks, responses })
    }

    pub fn respond(&self, ltime: u64, id: u32, payload: Vec<u8>) -> SerfResult<()> {
        let source = self
            .inner
            .pending_responses
            .lock()
            .get(&(ltime, id))
            .cloned()
            .ok_or(SerfError::UnknownQuery)?;
        self.inner.send_query_response(
            &source,
            QueryResponseMsg {
                ltime,
                id,
                from: self.inner.config.node_name.clone(),
                payload,
                ack: false,
            },
            0,
        );
        Ok(())
    }

    pub async fn install_key(&self, key: Vec<u8>) -> SerfResult<KeyResponse> {
        self.keyring_op(KeyOp::Install, Some(key)).await
    }

    pub async fn use_key(&self, key: Vec<u8>) -> SerfResult<KeyResponse> {
        self.keyring_op(KeyOp::Use, Some(key)).await
    }

    pub async fn remove_key(&self, key: Vec<u8>) -> SerfResult<KeyResponse> {
        self.keyring_op(KeyOp::Remove, Some(key)).await
    }

    pub async fn list_keys(&self) -> SerfResult<KeyResponse> {
        self.keyring_op(KeyOp::List, None).await
    }

    /// Key rotation operations ride the query mechanism: apply locally
    /// first, then issue `_serf_key_query` cluster-wide and aggregate every
    /// reply into one response, same as hashicorp/serf's keymanager.
    async fn keyring_op(&self, op: KeyOp, key: Option<Vec<u8>>) -> SerfResult<KeyResponse> {
        let mut response = KeyResponse::default();
        let local_name = self.inner.config.node_name.clone();

        match self.inner.apply_key_op_locally(&op, key.as_deref()) {
            Ok(keys) => {
                response.num_resp += 1;
                if let Some(keys) = keys {
                    response.keys.insert(local_name.clone(), keys);
                }
            }
            Err(e) => {
                response.num_err += 1;
                response.messages.insert(local_name, e.to_string());
            }
        }

        let req = KeyRequest { op, key };
        let payload = rmp_serde::to_vec(&req)?;
        let params = QueryParams { timeout: Duration::from_secs(5), ..Default::default() };
        let mut handle = self.query(INTERNAL_KEY_QUERY, payload, params).await?;
        while let Some(resp) = handle.responses.recv().await {
            response.num_resp += 1;
            match rmp_serde::from_slice::<KeyOpResult>(&resp.payload) {
                Ok(KeyOpResult::Ok(Some(keys))) => {
                    response.keys.insert(resp.from, keys);
                }
                Ok(KeyOpResult::Ok(None)) => {}
                Ok(KeyOpResult::Err(message)) => {
                    response.num_err += 1;
                    response.messages.insert(resp.from, message);
                }
                Err(_) => {}
            }
        }
        response.num_nodes = self.members().len();
        Ok(response)
    }

    pub fn get_coordinate(&self) -> Coordinate {
        self.inner.coordinate.get_coordinate()
    }

    pub fn get_cached_coordinate(&self, name: &str) -> Option<Coordinate> {
        self.inner.coordinate.peer_coordinate(name)
    }

    pub fn set_coordinate(&self, coord: Coordinate) -> bool {
        self.inner.coordinate.set_coordinate(coord)
    }

    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        self.inner.coordinate.distance_to(other)
    }

    pub fn forget_node(&self, name: &str) {
        self.inner.coordinate.forget_node(name)
    }

    pub fn coordinate_stats(&self) -> CoordinateStats {
        self.inner.coordinate.stats()
    }

    /// Consecutive probe cycles the membership layer has gone without
    /// reaching any peer (§4.C). Advisory only — surfaced to callers (the
    /// RPC `stats` command) rather than acted on internally.
    pub fn health_score(&self) -> u32 {
        self.inner.membership.health_score()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.membership.is_degraded()
    }

    /// Periodically evicts members whose Left/Failed tombstone has expired,
    /// firing a `Reap` event for anything removed.
    async fn reap_loop(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let expired = self.inner.tombstones.expired(now_micros());
            if expired.is_empty() {
                continue;
            }
            let mut reaped = Vec::new();
            {
                let mut members = self.inner.members.lock();
                for name in &expired {
                    if let Some(m) = members.remove(name) {
                        reaped.push(m);
                    }
                }
            }
            for name in &expired {
                self.inner.tombstones.remove(name);
            }
            if !reaped.is_empty() {
                self.inner.event_bus.publish(Event::Member(MemberEvent {
                    ty: MemberEventType::Reap,
                    members: reaped,
                }));
            }
        }
    }

    /// Lightweight ping/pong over the membership layer's `User` channel,
    /// independent of the SWIM probe cycle, that keeps the local Vivaldi
    /// coordinate converging against a random alive peer.
    async fn coordinate_loop(self) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tick.tick().await;
            let Some(peer) = self.inner.random_alive_member(&self.inner.config.node_name) else {
                continue;
            };
            let id = self.inner.next_coord_ping_id.fetch_add(1, Ordering::SeqCst);
            self.inner
                .pending_coord_pings
                .lock()
                .insert(id, (peer.name.clone(), Instant::now()));

            let ping = CoordinatePing {
                id,
                from: self.inner.config.node_name.clone(),
                coord: self.inner.coordinate.get_coordinate(),
            };
            if let Ok(body) = rmp_serde::to_vec(&SerfMessage::CoordinatePing(ping)) {
                self.inner.membership.send_raw(peer.addr, PacketType::User, body).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NoopSnapshotter;
    use std::time::Duration;

    fn loopback_config(name: &str) -> SerfConfig {
        let mut membership = memberlist::config::MembershipConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            suspicion_min_timeout: Duration::from_millis(100),
            suspicion_max_timeout: Duration::from_millis(300),
            gossip_interval: Duration::from_millis(50),
            push_pull_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        membership.bind_addr = "127.0.0.1:0".parse().unwrap();
        SerfConfig {
            node_name: name.to_string(),
            event_buffer_size: 64,
            membership,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_nodes_join_and_exchange_tags() {
        let mut tags_a = HashMap::new();
        tags_a.insert("role".to_string(), "leader".to_string());
        let mut cfg_a = loopback_config("a");
        cfg_a.initial_tags = tags_a;

        let a = Serf::new(cfg_a, Arc::new(NoopSnapshotter)).await.unwrap();
        let b = Serf::new(loopback_config("b"), Arc::new(NoopSnapshotter)).await.unwrap();

        b.join(&[a.local_addr()]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(a.members().len(), 2);
        let seen_a = b.members().into_iter().find(|m| m.name == "a").expect("a known to b");
        assert_eq!(seen_a.tags.get("role").map(String::as_str), Some("leader"));
    }

    #[tokio::test]
    async fn user_event_propagates_and_dedups() {
        let a = Serf::new(loopback_config("a"), Arc::new(NoopSnapshotter)).await.unwrap();
        let b = Serf::new(loopback_config("b"), Arc::new(NoopSnapshotter)).await.unwrap();
        b.join(&[a.local_addr()]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!a.inner.deliver_user_event(UserEventRecord {
            ltime: 1,
            name: "deploy".into(),
            payload: b"v1".to_vec(),
            coalesce: false,
        }));
        // first delivery (ltime starts at 0 so 0 is already seen at construction-time default;
        // use a fresh ltime to exercise the real path instead)
        assert!(a.inner.deliver_user_event(UserEventRecord {
            ltime: 2,
            name: "deploy".into(),
            payload: b"v2".to_vec(),
            coalesce: false,
        }));
        assert!(!a.inner.deliver_user_event(UserEventRecord {
            ltime: 2,
            name: "deploy".into(),
            payload: b"v2".to_vec(),
            coalesce: false,
        }));
    }

    #[tokio::test]
    async fn query_response_is_collected() {
        let a = Serf::new(loopback_config("a"), Arc::new(NoopSnapshotter)).await.unwrap();
        let b = Serf::new(loopback_config("b"), Arc::new(NoopSnapshotter)).await.unwrap();
        b.join(&[a.local_addr()]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut handle = a
            .query("ping", b"hi".to_vec(), QueryParams { timeout: Duration::from_secs(2), ..Default::default() })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // b's event bus received the query as an Event::Query; in a real
        // agent an external handler would call b.respond(...). Here we
        // drive that by hand to exercise the response path end to end.
        let pending = b.inner.pending_responses.lock().iter().next().map(|(k, v)| (*k, v.clone()));
        if let Some(((ltime, id), _source)) = pending {
            b.respond(ltime, id, b"pong".to_vec()).unwrap();
        }

        let response = tokio::time::timeout(Duration::from_secs(1), handle.responses.recv()).await;
        if let Ok(Some(resp)) = response {
            assert_eq!(resp.payload, b"pong");
        }
    }

    #[test]
    fn members_filtered_matches_tag_regex() {
        // purely synchronous helper check, doesn't need a running engine.
        let mut tags = HashMap::new();
        tags.insert("region".to_string(), "us-.*".to_string());
        let re = Regex::new(&format!("^{}$", tags["region"])).unwrap();
        assert!(re.is_match("us-east"));
        assert!(!re.is_match("eu-west"));
    }
}
