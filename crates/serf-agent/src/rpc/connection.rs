//! Per-connection state machine and command dispatch (§4.G, §6). Mirrors the
//! way `memberlist::membership` keeps each peer's protocol state in one
//! place rather than scattering it across the read loop: here the state is
//! handshake/auth progress and the set of live subscriptions instead of
//! SWIM suspicion timers, but the shape — one task owns one connection end
//! to end — is the same.
use crate::config::AgentConfig;
use crate::rpc::framing::{read_frame, read_frame_raw, write_frame, FramingError, FramingResult};
use crate::rpc::protocol::*;
use cluster_util::formats::LogRecord;
use serf::event::{Event, EventHandler};
use serf::{MemberStatus, Serf};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use ax_futures_util::stream::AxStreamExt;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHandshake,
    AwaitingAuth,
    Ready,
}

/// Forwards published events into a connection's per-subscription channel.
/// `EventHandler::handle` is synchronous (the bus calls every handler
/// inline), so delivery is a non-blocking `try_send`: a lagging RPC client
/// drops events rather than stalling gossip-driven dispatch.
struct ForwardToChannel {
    tx: mpsc::Sender<Event>,
}

impl EventHandler for ForwardToChannel {
    fn handle(&self, event: &Event) {
        let _ = self.tx.try_send(event.clone());
    }
}

/// One outstanding subscription (`monitor` or `stream`): a cancel handle the
/// `stop` command or connection teardown fires, plus the event-bus
/// registration it must deregister when torn down.
struct Subscription {
    cancel: oneshot::Sender<()>,
    event_bus_id: Option<u64>,
}

type Writer = Arc<AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Immutable handles shared by every command a connection dispatches, kept
/// together so `dispatch` takes one argument instead of five.
struct Ctx {
    serf: Arc<Serf>,
    config: Arc<AgentConfig>,
    log_tx: broadcast::Sender<LogRecord>,
    writer: Writer,
}

/// Drives one accepted TCP connection until the client disconnects or the
/// agent shuts down. `shutdown` is the server's broadcast receiver: a send
/// on that channel (agent shutdown) cancels every outstanding subscription
/// and closes the stream within the configured grace period.
pub async fn serve(
    stream: TcpStream,
    serf: Arc<Serf>,
    config: Arc<AgentConfig>,
    log_tx: broadcast::Sender<LogRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let boxed_writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
    let writer: Writer = Arc::new(AsyncMutex::new(boxed_writer));
    let max_frame = config.max_rpc_frame_bytes;
    let auth_required = config.rpc_auth_key.is_some();
    let ctx = Ctx { serf: serf.clone(), config, log_tx, writer };

    let mut phase = Phase::AwaitingHandshake;
    let mut authed = !auth_required;
    let mut subscriptions: HashMap<u64, Subscription> = HashMap::new();

    loop {
        let header: RequestHeader = tokio::select! {
            res = read_frame(&mut reader, max_frame) => {
                match res {
                    Ok(h) => h,
                    Err(FramingError::FrameTooLarge) => {
                        let _ = respond_error(&ctx.writer, 0, "frame too large", max_frame).await;
                        break;
                    }
                    Err(_) => break,
                }
            }
            _ = shutdown.recv() => break,
        };

        let body_bytes = if command_has_body(&header.command) {
            match read_frame_raw(&mut reader, max_frame).await {
                Ok(b) => b,
                Err(FramingError::FrameTooLarge) => {
                    let _ = respond_error(&ctx.writer, header.seq, "frame too large", max_frame).await;
                    break;
                }
                Err(_) => break,
            }
        } else {
            Vec::new()
        };

        let close = dispatch(&ctx, &header, &body_bytes, &mut phase, &mut authed, &mut subscriptions).await;

        if close {
            break;
        }
    }

    for (_, sub) in subscriptions.drain() {
        let _ = sub.cancel.send(());
        if let Some(id) = sub.event_bus_id {
            serf.deregister_event_handler(id);
        }
    }
    debug!(?peer, "rpc connection closed");
}

async fn dispatch(
    ctx: &Ctx,
    header: &RequestHeader,
    body_bytes: &[u8],
    phase: &mut Phase,
    authed: &mut bool,
    subscriptions: &mut HashMap<u64, Subscription>,
) -> bool {
    let Ctx { serf, config, log_tx, writer } = ctx;
    let max_frame = config.max_rpc_frame_bytes;
    let seq = header.seq;

    // Handshake/auth gating: "required" replies never close the connection
    // (the client may simply not have sent them yet), but a malformed or
    // wrong handshake/auth value does — a peer that proves it speaks the
    // wrong protocol gets refused outright rather than left on a
    // half-trusted socket.
    if header.command != "handshake" && *phase == Phase::AwaitingHandshake {
        let _ = respond_error(writer, seq, "Handshake required", max_frame).await;
        return false;
    }
    if header.command != "handshake" && header.command != "auth" && !*authed {
        let _ = respond_error(writer, seq, "Authentication required", max_frame).await;
        return false;
    }

    match header.command.as_str() {
        "handshake" => {
            if *phase != Phase::AwaitingHandshake {
                let _ = respond_error(writer, seq, "Duplicate handshake", max_frame).await;
                return true;
            }
            let req: HandshakeRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return true;
                }
            };
            if req.version < MIN_IPC_VERSION || req.version > MAX_IPC_VERSION {
                let _ = respond_error(writer, seq, "Unsupported IPC version", max_frame).await;
                return true;
            }
            *phase = if config.rpc_auth_key.is_some() {
                Phase::AwaitingAuth
            } else {
                Phase::Ready
            };
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            false
        }
        "auth" => {
            let req: AuthRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return true;
                }
            };
            match &config.rpc_auth_key {
                Some(expected) if expected == &req.auth_key => {
                    *authed = true;
                    *phase = Phase::Ready;
                    let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
                    false
                }
                _ => {
                    let _ = respond_error(writer, seq, "Invalid authentication token", max_frame).await;
                    true
                }
            }
        }
        "members" => {
            let members: Vec<IpcMember> = serf.members().into_iter().map(IpcMember::from).collect();
            let _ = respond_ok(writer, seq, Some(&MembersResponse { members }), max_frame).await;
            false
        }
        "members-filtered" => {
            let req: MembersFilteredRequest = rmp_serde::from_slice(body_bytes).unwrap_or_default();
            let status = parse_status(&req.status);
            let name = (!req.name.is_empty()).then_some(req.name.as_str());
            match serf.members_filtered(&req.tags, status, name) {
                Ok(members) => {
                    let members = members.into_iter().map(IpcMember::from).collect();
                    let _ = respond_ok(writer, seq, Some(&MembersResponse { members }), max_frame).await;
                }
                Err(serf::SerfError::InvalidFilter(_)) => {
                    let _ = respond_error(writer, seq, "Invalid filter", max_frame).await;
                }
                Err(e) => {
                    let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
                }
            }
            false
        }
        "event" => {
            let req: EventRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            match serf.user_event(req.name, req.payload, req.coalesce).await {
                Ok(()) => {
                    let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
                }
                Err(e) => {
                    let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
                }
            }
            false
        }
        "join" => {
            let req: JoinRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            let mut addrs = Vec::new();
            for host in &req.existing {
                match cluster_util::net::SocketAddrHelper::from_host_string(host).ok().and_then(|h| h.first()) {
                    Some(a) => addrs.push(a),
                    None => warn!(%host, "join: could not resolve address"),
                }
            }
            let (num, errs) = serf.join(&addrs).await;
            let response = JoinResponse { num: num as i64 };
            if errs.is_empty() {
                let _ = respond_ok(writer, seq, Some(&response), max_frame).await;
            } else {
                let message = errs.iter().map(|(addr, e)| format!("{addr}: {e}")).collect::<Vec<_>>().join("; ");
                let _ = respond_error_with_body(writer, seq, message, Some(&response), max_frame).await;
            }
            false
        }
        "leave" => {
            serf.leave().await;
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            false
        }
        "force-leave" => {
            let req: ForceLeaveRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            serf.force_leave(&req.node, req.prune);
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            false
        }
        "tags" => {
            let req: TagsRequest = rmp_serde::from_slice(body_bytes).unwrap_or_default();
            let mut tags = serf.local_member().tags;
            for name in &req.delete_tags {
                tags.remove(name);
            }
            tags.extend(req.tags);
            serf.set_tags(tags);
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            false
        }
        "query" => {
            let req: QueryRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            let params = serf::QueryParams {
                filter_nodes: req.filter_nodes,
                filter_tags: req.filter_tags,
                request_ack: req.request_ack,
                relay_factor: req.relay_factor,
                timeout: if req.timeout == 0 {
                    config.default_query_timeout
                } else {
                    std::time::Duration::from_millis(req.timeout)
                },
            };
            match serf.query(req.name, req.payload, params).await {
                Ok(handle) => {
                    let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
                    spawn_query_stream(writer.clone(), seq, handle, max_frame);
                }
                Err(e) => {
                    let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
                }
            }
            false
        }
        "respond" => {
            let req: RespondRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            match serf.respond(req.ltime, req.id, req.payload) {
                Ok(()) => {
                    let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
                }
                Err(e) => {
                    let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
                }
            }
            false
        }
        "install-key" => {
            keyring_command(writer, seq, body_bytes, max_frame, |k| serf.install_key(k)).await;
            false
        }
        "use-key" => {
            keyring_command(writer, seq, body_bytes, max_frame, |k| serf.use_key(k)).await;
            false
        }
        "remove-key" => {
            keyring_command(writer, seq, body_bytes, max_frame, |k| serf.remove_key(k)).await;
            false
        }
        "list-keys" => {
            match serf.list_keys().await {
                Ok(resp) => {
                    let _ = respond_ok(writer, seq, Some(&KeyResponse::from(resp)), max_frame).await;
                }
                Err(e) => {
                    let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
                }
            }
            false
        }
        "get-coordinate" => {
            let req: GetCoordinateRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            let coord = if req.node == serf.local_member().name {
                Some(serf.get_coordinate())
            } else {
                serf.get_cached_coordinate(&req.node)
            };
            let ok = coord.is_some();
            let _ = respond_ok(writer, seq, Some(&GetCoordinateResponse { coord, ok }), max_frame).await;
            false
        }
        "stats" => {
            let mut sections = HashMap::new();
            let mut agent = HashMap::new();
            agent.insert("name".to_string(), serf.local_member().name);
            let mut serf_section = HashMap::new();
            serf_section.insert("members".to_string(), serf.members().len().to_string());
            serf_section.insert("health_score".to_string(), serf.health_score().to_string());
            serf_section.insert("degraded".to_string(), serf.is_degraded().to_string());
            let coord_stats = serf.coordinate_stats();
            let mut coord_section = HashMap::new();
            coord_section.insert("resets".to_string(), coord_stats.resets.to_string());
            coord_section.insert(
                "samples_per_node".to_string(),
                serde_json::to_string(&coord_stats.samples_per_node).unwrap_or_default(),
            );
            sections.insert("agent".to_string(), agent);
            sections.insert("serf".to_string(), serf_section);
            sections.insert("coordinate".to_string(), coord_section);
            let _ = respond_ok(writer, seq, Some(&StatsResponse { sections }), max_frame).await;
            false
        }
        "monitor" => {
            if subscriptions.contains_key(&seq) {
                let _ = respond_error(writer, seq, "Monitor exists", max_frame).await;
                return false;
            }
            let req: MonitorRequest = rmp_serde::from_slice(body_bytes).unwrap_or(MonitorRequest { log_level: String::new() });
            let min_level = crate::logging::parse_level(if req.log_level.is_empty() { "info" } else { &req.log_level });
            let (cancel_tx, cancel_rx) = oneshot::channel();
            subscriptions.insert(seq, Subscription { cancel: cancel_tx, event_bus_id: None });
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            spawn_monitor_stream(writer.clone(), seq, log_tx.subscribe(), min_level, cancel_rx, max_frame);
            false
        }
        "stream" => {
            if subscriptions.contains_key(&seq) {
                let _ = respond_error(writer, seq, "Stream exists", max_frame).await;
                return false;
            }
            let req: StreamRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            let matcher = match StreamFilter::parse(&req.ty) {
                Ok(m) => m,
                Err(msg) => {
                    let _ = respond_error(writer, seq, msg, max_frame).await;
                    return false;
                }
            };
            let (tx, rx) = mpsc::channel(config.event_buffer_size);
            let handler = Arc::new(ForwardToChannel { tx });
            let event_bus_id = serf.register_event_handler(handler);
            let (cancel_tx, cancel_rx) = oneshot::channel();
            subscriptions.insert(seq, Subscription { cancel: cancel_tx, event_bus_id: Some(event_bus_id) });
            let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
            spawn_event_stream(writer.clone(), seq, rx, matcher, cancel_rx, max_frame);
            false
        }
        "stop" => {
            let req: StopRequest = match rmp_serde::from_slice(body_bytes) {
                Ok(r) => r,
                Err(e) => {
                    let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
                    return false;
                }
            };
            match subscriptions.remove(&req.stop) {
                Some(sub) => {
                    let _ = sub.cancel.send(());
                    if let Some(id) = sub.event_bus_id {
                        serf.deregister_event_handler(id);
                    }
                    let _ = respond_ok::<()>(writer, seq, None, max_frame).await;
                }
                None => {
                    let _ = respond_error(writer, seq, "Stream does not exist", max_frame).await;
                }
            }
            false
        }
        other => {
            let _ = respond_error(writer, seq, format!("Unknown command: {other}"), max_frame).await;
            false
        }
    }
}

/// §4.G's command table: only these rows carry a request body. `members`,
/// `leave`, `list-keys`, and `stats` are "—" and a conformant client sends no
/// body frame for them — reading one unconditionally would consume the next
/// command's header instead and desync the connection.
fn command_has_body(command: &str) -> bool {
    matches!(
        command,
        "handshake"
            | "auth"
            | "members-filtered"
            | "event"
            | "query"
            | "respond"
            | "join"
            | "force-leave"
            | "tags"
            | "install-key"
            | "use-key"
            | "remove-key"
            | "get-coordinate"
            | "monitor"
            | "stream"
            | "stop"
    )
}

fn parse_status(s: &str) -> Option<MemberStatus> {
    match s {
        "alive" => Some(MemberStatus::Alive),
        "leaving" => Some(MemberStatus::Leaving),
        "left" => Some(MemberStatus::Left),
        "failed" => Some(MemberStatus::Failed),
        _ => None,
    }
}

async fn keyring_command<F, Fut>(
    writer: &Writer,
    seq: u64,
    body_bytes: &[u8],
    max_frame: usize,
    op: F,
) where
    F: FnOnce(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = serf::SerfResult<serf::messages::KeyResponse>>,
{
    let req: KeyRequest = match rmp_serde::from_slice(body_bytes) {
        Ok(r) => r,
        Err(e) => {
            let _ = respond_error(writer, seq, format!("decode error: {e}"), max_frame).await;
            return;
        }
    };
    match op(req.key).await {
        Ok(resp) => {
            let _ = respond_ok(writer, seq, Some(&KeyResponse::from(resp)), max_frame).await;
        }
        Err(e) => {
            let _ = respond_error(writer, seq, e.to_string(), max_frame).await;
        }
    }
}

async fn respond_ok<T: serde::Serialize>(
    writer: &Writer,
    seq: u64,
    body: Option<&T>,
    max_frame: usize,
) -> FramingResult<()> {
    let mut w = writer.lock().await;
    write_frame(&mut *w, &ResponseHeader::ok(seq), max_frame).await?;
    if let Some(body) = body {
        write_frame(&mut *w, body, max_frame).await?;
    }
    Ok(())
}

async fn respond_error(
    writer: &Writer,
    seq: u64,
    message: impl Into<String>,
    max_frame: usize,
) -> FramingResult<()> {
    let mut w = writer.lock().await;
    write_frame(&mut *w, &ResponseHeader::err(seq, message), max_frame).await
}

/// Like `respond_error`, but still writes the command's response body
/// afterwards. `join` is the one command whose table row keeps its body
/// (`{Num}`, the partial success count) meaningful even when `Error` is
/// populated for an aggregate peer failure (§4.G, §7).
async fn respond_error_with_body<T: serde::Serialize>(
    writer: &Writer,
    seq: u64,
    message: impl Into<String>,
    body: Option<&T>,
    max_frame: usize,
) -> FramingResult<()> {
    let mut w = writer.lock().await;
    write_frame(&mut *w, &ResponseHeader::err(seq, message), max_frame).await?;
    if let Some(body) = body {
        write_frame(&mut *w, body, max_frame).await?;
    }
    Ok(())
}

/// Parsed form of the `stream` command's `Type` filter: `*`, `member-join`,
/// `member-leave`, `member-failed`, `member-update`, `member-reap`,
/// `user[:name]`, or `query[:name]`.
enum StreamFilter {
    All,
    Member(Option<serf::event::MemberEventType>),
    User(Option<String>),
    Query(Option<String>),
}

impl StreamFilter {
    fn parse(ty: &str) -> Result<Self, String> {
        use serf::event::MemberEventType::*;
        if ty == "*" {
            return Ok(Self::All);
        }
        if let Some(name) = ty.strip_prefix("user:") {
            return Ok(Self::User(Some(name.to_string())));
        }
        if ty == "user" {
            return Ok(Self::User(None));
        }
        if let Some(name) = ty.strip_prefix("query:") {
            return Ok(Self::Query(Some(name.to_string())));
        }
        if ty == "query" {
            return Ok(Self::Query(None));
        }
        let member_ty = match ty {
            "member-join" => Some(Join),
            "member-leave" => Some(Leave),
            "member-failed" => Some(Failed),
            "member-update" => Some(Update),
            "member-reap" => Some(Reap),
            _ => return Err(format!("Unknown stream type: {ty}")),
        };
        Ok(Self::Member(member_ty))
    }

    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Self::All, _) => true,
            (Self::Member(None), Event::Member(_)) => true,
            (Self::Member(Some(t)), Event::Member(m)) => &m.ty == t,
            (Self::User(None), Event::User(_)) => true,
            (Self::User(Some(name)), Event::User(u)) => &u.name == name,
            (Self::Query(None), Event::Query(_)) => true,
            (Self::Query(Some(name)), Event::Query(q)) => &q.name == name,
            _ => false,
        }
    }
}

fn spawn_event_stream(
    writer: Writer,
    seq: u64,
    rx: mpsc::Receiver<Event>,
    matcher: StreamFilter,
    cancel: oneshot::Receiver<()>,
    max_frame: usize,
) {
    tokio::spawn(async move {
        let stream = ReceiverStream::new(rx).take_until_signaled(cancel);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            if !matcher.matches(&event) {
                continue;
            }
            let record = match event {
                Event::Member(m) => StreamRecord::Member(m),
                Event::User(u) => StreamRecord::User(u),
                Event::Query(q) => StreamRecord::Query(q),
            };
            if respond_ok(&writer, seq, Some(&record), max_frame).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_monitor_stream(
    writer: Writer,
    seq: u64,
    rx: broadcast::Receiver<LogRecord>,
    min_level: cluster_util::formats::LogSeverity,
    cancel: oneshot::Receiver<()>,
    max_frame: usize,
) {
    tokio::spawn(async move {
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).take_until_signaled(cancel);
        tokio::pin!(stream);
        while let Some(record) = stream.next().await {
            let Ok(record) = record else { continue };
            if !crate::logging::admits(&min_level, &record.severity) {
                continue;
            }
            if respond_ok(&writer, seq, Some(&record), max_frame).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_query_stream(
    writer: Writer,
    seq: u64,
    mut handle: serf::QueryHandle,
    max_frame: usize,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ack = handle.acks.recv() => {
                    match ack {
                        Some(from) => {
                            if respond_ok(&writer, seq, Some(&QueryRecord::ack(from)), max_frame).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                resp = handle.responses.recv() => {
                    match resp {
                        Some(r) => {
                            if respond_ok(&writer, seq, Some(&QueryRecord::response(r.from, r.payload)), max_frame).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                else => break,
            }
        }
        let _ = respond_ok(&writer, seq, Some(&QueryRecord::done()), max_frame).await;
    });
}
