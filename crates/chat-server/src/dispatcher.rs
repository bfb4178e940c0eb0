use std::io;
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGALRM, SIGINT};
use signal_hook_mio::v1_0::Signals;
use tracing::{debug, info, warn};

use crate::auditor::audit;
use crate::pool::WorkerPool;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::task::{Direction, TaskArgs, spawn_task};

const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const FIRST_PEER_TOKEN: usize = 2;

/// What a single readiness wake-up resolved to. `run` loops on `Continue`
/// and stops on `Shutdown`.
enum WakeResult {
    Continue,
    Shutdown,
}

/// The single-threaded readiness demultiplexer plus event classifier
/// (§4.5-4.6 of the wire spec). Owns the `mio::Poll` instance, the listening
/// socket, and the signal channel; hands every peer readiness event off to
/// the worker pool as a task and never itself touches a connection's mutex.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    signals: Signals,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<WorkerPool>,
    max_connections: usize,
    next_token: usize,
}

impl Dispatcher {
    /// Takes ownership of an already-created `Poll` (the caller, `server::begin_server`,
    /// keeps its own clone of `poll.registry()` to hand to `ConnectionRegistry`
    /// before this constructor runs) and registers the listener and the
    /// signal channel against it.
    pub fn new(
        poll: Poll,
        mut listener: TcpListener,
        registry: Arc<ConnectionRegistry>,
        pool: Arc<WorkerPool>,
        max_connections: usize,
    ) -> io::Result<Self> {
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGINT, SIGALRM])?;
        poll.registry().register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            signals,
            registry,
            pool,
            max_connections,
            next_token: FIRST_PEER_TOKEN,
        })
    }

    /// Runs the dispatcher loop until `SIGINT` is observed. Blocks inside
    /// `Poll::poll` between wake-ups; every worker thread runs in parallel
    /// while this thread is parked there.
    pub fn run(&mut self) {
        loop {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // The only error that tears down the whole server: the
                // readiness wait itself failed for a reason other than a
                // signal interrupting the syscall.
                warn!(%err, "readiness wait failed; shutting down");
                return;
            }

            match self.handle_ready_batch() {
                WakeResult::Continue => continue,
                WakeResult::Shutdown => return,
            }
        }
    }

    fn handle_ready_batch(&mut self) -> WakeResult {
        // `Events` from the last `poll` call; collect tokens first since
        // `self.events` is borrowed immutably while the loop body below
        // needs `&mut self`.
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();

        for token in tokens {
            match token {
                SIGNAL_TOKEN => {
                    if let WakeResult::Shutdown = self.drain_signals() {
                        return WakeResult::Shutdown;
                    }
                }
                LISTENER_TOKEN => self.accept_new_peers(),
                peer_token => self.dispatch_peer_event(peer_token),
            }
        }
        WakeResult::Continue
    }

    /// Reads every pending signal off the self-pipe. `SIGINT` stops the
    /// dispatcher; `SIGALRM` (the periodic tick) runs the idle auditor and
    /// the loop keeps going.
    fn drain_signals(&mut self) -> WakeResult {
        for signal in self.signals.pending() {
            match signal {
                SIGINT => {
                    info!("SIGINT received, disarming signal channel and stopping dispatcher");
                    let _ = self.poll.registry().deregister(&mut self.signals);
                    return WakeResult::Shutdown;
                }
                SIGALRM => audit(&self.registry, &self.pool),
                other => debug!(signal = other, "ignoring unexpected signal"),
            }
        }
        WakeResult::Continue
    }

    /// Accepts every pending connection on the listener. `mio`'s listener
    /// readiness is edge-triggered, so a single `accept` per notification
    /// can leave later arrivals unnoticed until the next unrelated
    /// wake-up; this drains the accept queue to `WouldBlock` instead.
    fn accept_new_peers(&mut self) {
        loop {
            let (mut stream, peer_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            };

            if self.registry.len() >= self.max_connections {
                warn!(%peer_addr, max = self.max_connections, "connection ceiling reached, dropping peer");
                drop(stream);
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                warn!(%err, %peer_addr, "failed to register new peer socket");
                continue;
            }

            let record = ConnectionRecord::new(token, stream, peer_addr);
            self.registry.insert(record);
            debug!(?token, %peer_addr, "accepted new peer");
        }
    }

    /// Disarms the peer's descriptor (enforcing at-most-one-in-flight
    /// without this thread ever touching the connection's mutex) and hands
    /// one `Inbound` task to the pool.
    fn dispatch_peer_event(&mut self, token: Token) {
        let Some(record) = self.registry.find_by_token(token) else {
            debug!(?token, "readiness event for a token no longer in the registry");
            return;
        };
        record.disarm(self.poll.registry());
        let args = TaskArgs {
            direction: Direction::Inbound,
            record,
            registry: Arc::clone(&self.registry),
            pool: Arc::clone(&self.pool),
        };
        spawn_task(args);
    }
}
