use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chat_proto::{BoundedString, ChatError, Frame, Opcode, SanitizeMode, StatusCode, read_frame, sanitize};
use tracing::{debug, warn};

use crate::pool::WorkerPool;
use crate::registry::{ConnState, ConnectionInner, ConnectionRecord, ConnectionRegistry};

/// How long a connection may go without any task updating its
/// `last_active` timestamp before the idle auditor evicts it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// What kind of frame an outbound task is carrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundKind {
    Status,
    Deliver,
}

/// A pre-encoded frame ready to be written verbatim to a peer's socket.
#[derive(Debug)]
pub struct OutboundFrame {
    pub kind: OutboundKind,
    pub buf: Vec<u8>,
}

/// What triggered this run of the state machine.
#[derive(Debug)]
pub enum Direction {
    Inbound,
    Outbound(OutboundFrame),
    Heartbeat,
}

/// Per-task payload. Holds `Arc` handles rather than raw references so a
/// record, the registry, and the pool all outlive every task that might
/// still reference them.
pub struct TaskArgs {
    pub direction: Direction,
    pub record: Arc<ConnectionRecord>,
    pub registry: Arc<ConnectionRegistry>,
    pub pool: Arc<WorkerPool>,
}

/// What a single step of the state machine decided to do next. Internal to
/// this module: `run` translates it into either dropping `args` (`Done`) or
/// resubmitting them (`Requeue`).
enum Action {
    Done,
    Requeue,
}

/// Submits `args` to the pool, incrementing `pending_jobs` first so the
/// invariant "`pending_jobs` counts submitted-but-unconsumed references"
/// holds even for the instant between this increment and the pool actually
/// running the job.
pub fn spawn_task(args: TaskArgs) {
    args.record.pending_jobs.fetch_add(1, Ordering::AcqRel);
    let pool = Arc::clone(&args.pool);
    pool.submit(Box::new(move || run(args)));
}

/// Entry gate plus dispatch for one task execution. Decrements
/// `pending_jobs` unconditionally (the one counterpart to every increment in
/// `spawn_task`), then tries to acquire the connection's mutex without
/// blocking; on contention, requeues the same args untouched so ordering is
/// preserved against whatever already holds the lock.
fn run(args: TaskArgs) {
    let prev = args.record.pending_jobs.fetch_sub(1, Ordering::AcqRel);
    chat_utils::safe_assert!(
        prev >= 1,
        "pending_jobs underflow for token {:?}: was {prev} before this run's decrement",
        args.record.token
    );

    let mut guard = match args.record.inner.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            spawn_task(args);
            return;
        }
    };

    if !matches!(args.direction, Direction::Heartbeat) {
        guard.last_active = Instant::now();
    }

    let action = dispatch(&args, &mut guard);
    drop(guard);

    if matches!(action, Action::Requeue) {
        spawn_task(args);
    }
}

fn transition(args: &TaskArgs, inner: &mut ConnectionInner, new: ConnState) {
    debug!(token = ?args.record.token, from = ?inner.state, to = ?new, "connection state transition");
    args.record.set_state(inner, new);
}

fn dispatch(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    match (inner.state, &args.direction) {
        (ConnState::Error, _) => handle_error(args, inner),
        (ConnState::Closing, _) => handle_closing(args, inner),

        (ConnState::PreRegister, Direction::Inbound) => handle_pre_register(args, inner),
        (ConnState::Available, Direction::Inbound) => handle_available_inbound(args, inner),
        (ConnState::SendStat, Direction::Outbound(frame)) if frame.kind == OutboundKind::Status => {
            handle_send_stat(args, inner, &frame.buf)
        }
        (ConnState::Available, Direction::Outbound(frame)) if frame.kind == OutboundKind::Deliver => {
            // Marks the deliver as in-flight and lets the next run through
            // this same task perform the actual write; this mirrors the
            // spec's two-phase Available->SendMsg->write transition.
            transition(args, inner, ConnState::SendMsg);
            Action::Requeue
        }
        (ConnState::SendMsg, Direction::Outbound(frame)) if frame.kind == OutboundKind::Deliver => {
            handle_send_msg(args, inner, &frame.buf)
        }
        (ConnState::PendingStatus, Direction::Inbound) => handle_pending_status(args, inner),
        (ConnState::PendingStatus, Direction::Outbound(_)) => Action::Requeue,

        (state, Direction::Heartbeat) => handle_heartbeat(args, inner, state),

        // No table entry: e.g. a self-addressed greeting Deliver arriving
        // before the registration Status has been written. Requeue and let
        // the state catch up.
        _ => Action::Requeue,
    }
}

/// Reads one frame off the peer socket, expecting `expected`. Any I/O or
/// framing problem, or an opcode that doesn't match `expected`, is reported
/// as a `ChatError`.
fn read_expecting(inner: &mut ConnectionInner, expected: Opcode) -> Result<Frame, ChatError> {
    let mut opcode_buf = [0u8; 1];
    std::io::Read::read_exact(&mut inner.stream, &mut opcode_buf)
        .map_err(|_| ChatError::Framing(chat_proto::FramingError::PartialFrame))?;
    let opcode = Opcode::classify(opcode_buf[0])?;
    if opcode != expected {
        return Err(ChatError::Framing(chat_proto::FramingError::UnexpectedFrame));
    }
    Ok(read_frame(opcode, &mut inner.stream)?)
}

/// Strips a single trailing NUL appended by [`chat_proto::sanitize`]. The
/// NUL is a sanitiser storage convention, not part of the wire protocol, so
/// anything forwarded onto the wire or into a human-readable notice goes
/// through this first.
fn strip_trailing_nul(bs: &BoundedString) -> BoundedString {
    let bytes = bs.as_bytes();
    let trimmed = match bytes.last() {
        Some(0) => &bytes[..bytes.len() - 1],
        _ => bytes,
    };
    BoundedString::from_slice(trimmed).expect("trimming a slice cannot exceed its own capacity")
}

fn username_display(username: &BoundedString) -> String {
    strip_trailing_nul(username).to_string_lossy().into_owned()
}

fn enter_error(args: &TaskArgs, inner: &mut ConnectionInner, reason: &str) -> Action {
    warn!(token = ?args.record.token, reason, "connection entering error state");
    let msg = sanitize(reason.as_bytes(), SanitizeMode::Permissive).unwrap_or_default();
    inner.status_msg = msg;
    transition(args, inner, ConnState::Error);
    Action::Requeue
}

fn handle_pre_register(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    let frame = match read_expecting(inner, Opcode::Register) {
        Ok(frame) => frame,
        Err(err) => return enter_error(args, inner, &err.to_string()),
    };
    let Frame::Register { username } = frame else {
        return enter_error(args, inner, "expected a registration frame");
    };

    let Some(sanitized) = sanitize(username.as_bytes(), SanitizeMode::Strict) else {
        return enter_error(args, inner, "username rejected after sanitisation");
    };

    if args.registry.find_by_username(sanitized.as_bytes()).is_some() {
        return enter_error(args, inner, "username already in use");
    }

    inner.username = Some(sanitized);
    transition(args, inner, ConnState::SendStat);

    let display_name = username_display(&sanitized);
    let others = args.registry.list_usernames_excluding(args.record.token);
    let greeting = format!("Logged in as {display_name}.\nCurrent Clients: \n{others}");
    spawn_self_outbound(
        args,
        OutboundKind::Deliver,
        chat_proto::encode_deliver(args.registry.server_identity(), &BoundedString::from(greeting.as_str())),
    );

    spawn_self_outbound(
        args,
        OutboundKind::Status,
        chat_proto::encode_status(StatusCode::Good, &BoundedString::new()),
    );

    let join_notice = format!("{display_name} has joined the server.");
    broadcast(args, *args.registry.server_identity(), BoundedString::from(join_notice.as_str()));

    Action::Done
}

fn handle_available_inbound(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    let mut opcode_buf = [0u8; 1];
    if std::io::Read::read_exact(&mut inner.stream, &mut opcode_buf).is_err() {
        return enter_error(args, inner, "socket closed or errored mid-frame");
    }
    let opcode = match Opcode::classify(opcode_buf[0]) {
        Ok(opcode) => opcode,
        Err(err) => return enter_error(args, inner, &err.to_string()),
    };

    match opcode {
        Opcode::Send => {
            let frame = match read_frame(opcode, &mut inner.stream) {
                Ok(frame) => frame,
                Err(err) => return enter_error(args, inner, &err.to_string()),
            };
            let Frame::Send { message } = frame else { unreachable!("opcode classified as Send") };
            let Some(sanitized) = sanitize(message.as_bytes(), SanitizeMode::Permissive) else {
                return enter_error(args, inner, "message rejected after sanitisation");
            };

            let from = inner
                .username
                .as_ref()
                .map(|u| BoundedString::from(username_display(u).as_str()))
                .unwrap_or_else(|| *args.registry.server_identity());
            broadcast(args, from, strip_trailing_nul(&sanitized));

            transition(args, inner, ConnState::SendStat);
            spawn_self_outbound(
                args,
                OutboundKind::Status,
                chat_proto::encode_status(StatusCode::Good, &BoundedString::new()),
            );
            Action::Done
        }
        Opcode::Status => enter_error(args, inner, "unexpected status frame while available"),
        Opcode::Register => enter_error(args, inner, "already registered"),
        Opcode::Deliver => enter_error(args, inner, "client may not send a deliver frame"),
    }
}

fn handle_send_stat(args: &TaskArgs, inner: &mut ConnectionInner, buf: &[u8]) -> Action {
    if let Err(err) = inner.stream.write_all(buf) {
        return enter_error(args, inner, &ChatError::Io(err).to_string());
    }
    transition(args, inner, ConnState::Available);
    if let Err(err) = args.record.rearm_locked(args.registry.mio_registry(), inner) {
        return enter_error(args, inner, &ChatError::Io(err).to_string());
    }
    Action::Done
}

fn handle_send_msg(args: &TaskArgs, inner: &mut ConnectionInner, buf: &[u8]) -> Action {
    if let Err(err) = inner.stream.write_all(buf) {
        return enter_error(args, inner, &ChatError::Io(err).to_string());
    }
    transition(args, inner, ConnState::PendingStatus);
    if let Err(err) = args.record.rearm_locked(args.registry.mio_registry(), inner) {
        return enter_error(args, inner, &ChatError::Io(err).to_string());
    }
    Action::Done
}

fn handle_pending_status(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    let frame = match read_expecting(inner, Opcode::Status) {
        Ok(frame) => frame,
        Err(err) => return enter_error(args, inner, &err.to_string()),
    };
    let Frame::Status { code, .. } = frame else {
        return enter_error(args, inner, "expected a status frame");
    };
    match code {
        StatusCode::Good => {
            transition(args, inner, ConnState::Available);
            if let Err(err) = args.record.rearm_locked(args.registry.mio_registry(), inner) {
                return enter_error(args, inner, &ChatError::Io(err).to_string());
            }
            Action::Done
        }
        StatusCode::Error => enter_error(args, inner, "peer reported a status error"),
    }
}

fn handle_heartbeat(args: &TaskArgs, inner: &mut ConnectionInner, state: ConnState) -> Action {
    if matches!(state, ConnState::Closing | ConnState::Error) {
        return Action::Done;
    }
    if inner.last_active.elapsed() > IDLE_TIMEOUT {
        debug!(token = ?args.record.token, "evicting idle connection");
        return enter_error(args, inner, "Disconnected for inactivity.");
    }
    Action::Done
}

fn handle_error(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    let buf = chat_proto::encode_status(StatusCode::Error, &inner.status_msg);
    let _ = inner.stream.write_all(&buf);
    transition(args, inner, ConnState::Closing);
    Action::Requeue
}

fn handle_closing(args: &TaskArgs, inner: &mut ConnectionInner) -> Action {
    if args.record.pending_jobs.load(Ordering::Acquire) != 0 {
        return Action::Requeue;
    }

    let message = match &inner.username {
        Some(username) => format!("{} has left the server.", username_display(username)),
        None => "An unregistered user has left the server.".to_string(),
    };
    broadcast(args, *args.registry.server_identity(), BoundedString::from(message.as_str()));

    args.record.disarm_locked(args.registry.mio_registry(), inner);
    args.registry.remove(args.record.token);
    debug!(token = ?args.record.token, "connection closed and removed from registry");
    Action::Done
}

/// Submits an outbound task addressed back to `args.record` itself (the
/// registration Status/greeting, or a Send's own acknowledgement).
fn spawn_self_outbound(args: &TaskArgs, kind: OutboundKind, buf: Vec<u8>) {
    let task = TaskArgs {
        direction: Direction::Outbound(OutboundFrame { kind, buf }),
        record: Arc::clone(&args.record),
        registry: Arc::clone(&args.registry),
        pool: Arc::clone(&args.pool),
    };
    spawn_task(task);
}

/// Fans a `Deliver(from, message)` out to every eligible recipient other
/// than the sender. Each recipient gets its own `TaskArgs`; per-recipient
/// FIFO and at-most-one-in-flight are then enforced exactly as for any other
/// task against that record.
pub(crate) fn broadcast(args: &TaskArgs, from: BoundedString, message: BoundedString) {
    let recipients = args.registry.recipients_excluding(args.record.token);
    debug!(token = ?args.record.token, recipient_count = recipients.len(), "broadcasting deliver");
    for recipient in recipients {
        let buf = chat_proto::encode_deliver(&from, &message);
        let task = TaskArgs {
            direction: Direction::Outbound(OutboundFrame { kind: OutboundKind::Deliver, buf }),
            record: recipient,
            registry: Arc::clone(&args.registry),
            pool: Arc::clone(&args.pool),
        };
        spawn_task(task);
    }
}
