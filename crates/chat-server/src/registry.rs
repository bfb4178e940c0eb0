use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chat_proto::BoundedString;
use mio::net::TcpStream;
use mio::{Interest, Token};

/// The `from` identity used on every server-originated notice.
pub const SERVER_IDENTITY: &str = "[Server]";

/// Per-connection lifecycle, driven one step at a time by the state-machine
/// task (see `crate::task`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    PreRegister = 0,
    Available = 1,
    SendStat = 2,
    SendMsg = 3,
    PendingStatus = 4,
    Error = 5,
    Closing = 6,
}

impl ConnState {
    fn from_u8(byte: u8) -> Self {
        match byte {
            0 => ConnState::PreRegister,
            1 => ConnState::Available,
            2 => ConnState::SendStat,
            3 => ConnState::SendMsg,
            4 => ConnState::PendingStatus,
            5 => ConnState::Error,
            6 => ConnState::Closing,
            other => unreachable!("invalid ConnState tag {other}"),
        }
    }
}

/// Everything guarded by a `ConnectionRecord`'s single mutex: the socket
/// handle, all mutable chat-protocol state, and I/O bookkeeping.
pub struct ConnectionInner {
    pub stream: TcpStream,
    pub state: ConnState,
    pub username: Option<BoundedString>,
    pub status_msg: BoundedString,
    pub last_active: Instant,
    /// Whether the peer descriptor currently holds a readable-interest
    /// registration with the readiness instance. Tracked so re-arm is
    /// idempotent: re-registering an already-armed token is an error in mio.
    pub armed: bool,
}

/// Per-peer state. Owned by the registry; referenced by `Arc` clones held in
/// `crate::task::TaskArgs` while a task executes, so the record cannot be
/// freed while work against it is outstanding.
pub struct ConnectionRecord {
    pub token: Token,
    pub peer_addr: SocketAddr,
    /// Number of task references submitted-but-not-yet-run-to-completion for
    /// this record. The entry gate decrements it; every requeue increments
    /// it back. Only destroyed once this reaches zero and the state is
    /// `Closing`.
    pub pending_jobs: AtomicI64,
    /// Mirrors `inner.state`, updated alongside it under the connection
    /// mutex. Lets the broadcast fan-out (`ConnectionRegistry::recipients_excluding`)
    /// filter out `Closing`/`Error` peers while holding only the registry
    /// mutex, never this record's.
    state_tag: AtomicU8,
    pub inner: Mutex<ConnectionInner>,
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("token", &self.token)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionRecord {
    pub fn new(token: Token, stream: TcpStream, peer_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            token,
            peer_addr,
            pending_jobs: AtomicI64::new(0),
            state_tag: AtomicU8::new(ConnState::PreRegister as u8),
            inner: Mutex::new(ConnectionInner {
                stream,
                state: ConnState::PreRegister,
                username: None,
                status_msg: BoundedString::new(),
                last_active: Instant::now(),
                armed: true,
            }),
        })
    }

    /// Lock-free read of the current state, for use by callers (the
    /// broadcast fan-out) that must not acquire this record's mutex while
    /// holding the registry's.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state_tag.load(Ordering::Acquire))
    }

    /// Updates both the authoritative `inner.state` and its lock-free
    /// mirror. Always called with `inner` already locked by the caller.
    pub fn set_state(&self, inner: &mut ConnectionInner, new: ConnState) {
        inner.state = new;
        self.state_tag.store(new as u8, Ordering::Release);
    }

    /// Removes the peer descriptor's readable-interest registration.
    /// Idempotent. Used by the dispatcher, which must disarm a descriptor
    /// without contending with a task already holding this record's mutex
    /// for the duration of its own I/O; since this call performs no socket
    /// I/O itself (just an `epoll_ctl`-style syscall), taking the lock here
    /// is brief and does not violate the "never hold both locks across
    /// blocking I/O" rule.
    pub fn disarm(&self, mio_registry: &mio::Registry) {
        let mut inner = self.inner.lock().unwrap();
        self.disarm_locked(mio_registry, &mut inner);
    }

    /// Same as [`Self::disarm`], for a caller that already holds `inner`'s
    /// guard (the state-machine task, which must not re-lock its own
    /// mutex).
    pub fn disarm_locked(&self, mio_registry: &mio::Registry, inner: &mut ConnectionInner) {
        if inner.armed {
            let _ = mio_registry.deregister(&mut inner.stream);
            inner.armed = false;
        }
    }

    /// Re-registers the peer descriptor for readable-edge-triggered
    /// interest, for a caller that already holds `inner`'s guard.
    pub fn rearm_locked(
        &self,
        mio_registry: &mio::Registry,
        inner: &mut ConnectionInner,
    ) -> std::io::Result<()> {
        if !inner.armed {
            mio_registry.register(&mut inner.stream, self.token, Interest::READABLE)?;
            inner.armed = true;
        }
        Ok(())
    }
}

/// Ordered set of connections plus the shared handles the dispatcher and
/// tasks need to act on them.
pub struct ConnectionRegistry {
    mio_registry: mio::Registry,
    server_identity: BoundedString,
    records: Mutex<Vec<Arc<ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new(mio_registry: mio::Registry) -> Self {
        Self {
            mio_registry,
            server_identity: BoundedString::from(SERVER_IDENTITY),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn mio_registry(&self) -> &mio::Registry {
        &self.mio_registry
    }

    pub fn server_identity(&self) -> &BoundedString {
        &self.server_identity
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends under the registry mutex.
    pub fn insert(&self, record: Arc<ConnectionRecord>) {
        self.records.lock().unwrap().push(record);
    }

    /// Unlinks by token, preserving the remaining order. Returns the
    /// removed record, if present, so the caller can drop its last
    /// reference once it is done with the `ConnectionInner` guard.
    pub fn remove(&self, token: Token) -> Option<Arc<ConnectionRecord>> {
        let mut records = self.records.lock().unwrap();
        let pos = records.iter().position(|r| r.token == token)?;
        Some(records.remove(pos))
    }

    /// Linear scan by token, for the dispatcher translating a readiness
    /// event back into the record it targets.
    pub fn find_by_token(&self, token: Token) -> Option<Arc<ConnectionRecord>> {
        self.records.lock().unwrap().iter().find(|r| r.token == token).cloned()
    }

    /// Linear scan comparing full byte slices once lengths match (an
    /// explicit length check first rules out a false "zero-size compare is
    /// always equal" match). Never returns a record in `Closing`. Takes an
    /// owned snapshot of the registry first and releases the registry mutex
    /// before locking any individual record, so this never holds the
    /// registry mutex across a per-connection lock acquisition.
    pub fn find_by_username(&self, name: &[u8]) -> Option<Arc<ConnectionRecord>> {
        let snapshot: Vec<Arc<ConnectionRecord>> = self.records.lock().unwrap().clone();
        snapshot.into_iter().find(|record| {
            if matches!(record.state(), ConnState::Closing) {
                return false;
            }
            let inner = record.inner.lock().unwrap();
            inner.username.as_ref().is_some_and(|u| u.len() == name.len() && u.as_bytes() == name)
        })
    }

    /// Renders `u1, u2, …` for every non-`PreRegister` record other than
    /// `exclude`. Excluding the caller's own token lets a just-registered
    /// connection ask for "everyone else" without re-locking its own
    /// (already locked) record.
    pub fn list_usernames_excluding(&self, exclude: Token) -> String {
        let snapshot: Vec<Arc<ConnectionRecord>> = self.records.lock().unwrap().clone();
        let mut names = Vec::new();
        for record in snapshot {
            if record.token == exclude || matches!(record.state(), ConnState::PreRegister) {
                continue;
            }
            let inner = record.inner.lock().unwrap();
            if let Some(username) = &inner.username {
                names.push(username.to_string_lossy().into_owned());
            }
        }
        names.join(", ")
    }

    /// Snapshot of every record currently registered, regardless of state.
    /// Used by the idle auditor, which lets the heartbeat task itself decide
    /// (under the record's own mutex) whether a given state is eligible for
    /// eviction.
    pub fn all_records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.records.lock().unwrap().clone()
    }

    /// Snapshot of every record other than `exclude` that is eligible to
    /// receive a broadcast (not `Closing` or `Error`). Filters using the
    /// lock-free state mirror only, so this holds just the registry mutex,
    /// per the broadcast fan-out's locking contract.
    pub fn recipients_excluding(&self, exclude: Token) -> Vec<Arc<ConnectionRecord>> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .filter(|r| r.token != exclude)
            .filter(|r| !matches!(r.state(), ConnState::Closing | ConnState::Error))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(token: usize) -> Arc<ConnectionRecord> {
        let (stream, _addr) = loopback_stream();
        ConnectionRecord::new(Token(token), stream, "127.0.0.1:0".parse().unwrap())
    }

    // A connected, non-blocking TcpStream pair good enough to sit inside a
    // ConnectionRecord for registry-only tests (no I/O is exercised here).
    fn loopback_stream() -> (TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let _ = listener.accept().unwrap();
        (TcpStream::from_std(client), addr)
    }

    #[test]
    fn insert_and_remove_preserves_order() {
        let poll = mio::Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let a = make_record(1);
        let b = make_record(2);
        let c = make_record(3);
        registry.insert(a.clone());
        registry.insert(b.clone());
        registry.insert(c.clone());
        assert_eq!(registry.len(), 3);
        registry.remove(Token(2));
        let remaining = registry.recipients_excluding(Token(9999));
        assert_eq!(remaining.iter().map(|r| r.token).collect::<Vec<_>>(), vec![Token(1), Token(3)]);
    }

    #[test]
    fn find_by_username_requires_exact_length_match() {
        let poll = mio::Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let record = make_record(1);
        {
            let mut inner = record.inner.lock().unwrap();
            inner.username = Some(BoundedString::from("ali"));
            record.set_state(&mut inner, ConnState::Available);
        }
        registry.insert(record);
        assert!(registry.find_by_username(b"ali").is_some());
        assert!(registry.find_by_username(b"al").is_none());
        assert!(registry.find_by_username(b"alice").is_none());
    }

    #[test]
    fn find_by_username_skips_closing_records() {
        let poll = mio::Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let record = make_record(1);
        {
            let mut inner = record.inner.lock().unwrap();
            inner.username = Some(BoundedString::from("ali"));
            record.set_state(&mut inner, ConnState::Closing);
        }
        registry.insert(record);
        assert!(registry.find_by_username(b"ali").is_none());
    }

    #[test]
    fn recipients_excluding_skips_error_and_closing() {
        let poll = mio::Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let available = make_record(1);
        let errored = make_record(2);
        let closing = make_record(3);
        {
            let mut inner = available.inner.lock().unwrap();
            available.set_state(&mut inner, ConnState::Available);
        }
        {
            let mut inner = errored.inner.lock().unwrap();
            errored.set_state(&mut inner, ConnState::Error);
        }
        {
            let mut inner = closing.inner.lock().unwrap();
            closing.set_state(&mut inner, ConnState::Closing);
        }
        registry.insert(available.clone());
        registry.insert(errored);
        registry.insert(closing);

        let recipients = registry.recipients_excluding(Token(9999));
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].token, available.token);
    }
}
