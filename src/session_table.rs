use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::MonotonicClock;
use crate::config::EngineConfig;
use crate::engine::peek_conv;
use crate::error::SessionError;
use crate::output_port::OutputPort;
use crate::session::{Session, SessionState};

pub type NewSessionHook = Box<dyn FnMut(&mut Session) + Send>;

/// the largest possible UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// The SessionTable maps conversation ids to sessions. It demultiplexes inbound datagrams,
///  creating sessions for unknown conversations if it is configured to, and runs the periodic
///  sweep that evicts inactive sessions and drives the others.
///
/// A conversation id is bound to the address of the first datagram that carried it. Later
///  datagrams with the same id are routed to that session regardless of their source address,
///  which is only acceptable on trusted networks.
pub struct SessionTable {
    sessions: FxHashMap<u32, Session>,
    config: EngineConfig,
    timeout_ms: Option<u32>,
    accept_new_sessions: bool,
    new_session_hook: Option<NewSessionHook>,
}

impl SessionTable {
    pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;

    /// `timeout_ms` of `None` disables eviction for inactivity.
    pub fn new(config: EngineConfig, timeout_ms: Option<u32>, accept_new_sessions: bool) -> SessionTable {
        SessionTable {
            sessions: Default::default(),
            config,
            timeout_ms,
            accept_new_sessions,
            new_session_hook: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// applies to sessions created afterwards
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    pub fn timeout_ms(&self) -> Option<u32> {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: Option<u32>) {
        self.timeout_ms = timeout_ms;
    }

    /// The hook runs for every session the table creates, after it is registered and before it
    ///  ingests the datagram that caused its creation. This is the place to install callbacks and
    ///  per-session tuning.
    pub fn set_new_session_hook(&mut self, hook: NewSessionHook) {
        self.new_session_hook = Some(hook);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, conv: u32) -> Option<&Session> {
        self.sessions.get(&conv)
    }

    pub fn get_mut(&mut self, conv: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&conv)
    }

    pub fn insert(&mut self, session: Session) -> Result<(), SessionError> {
        match self.sessions.entry(session.conv()) {
            Entry::Occupied(_) => Err(SessionError::AlreadyConnected),
            Entry::Vacant(e) => {
                e.insert(session);
                Ok(())
            }
        }
    }

    /// Closes the session (firing its close callback) and removes it. Returns `false` if there
    ///  was no session for `conv`.
    pub fn close_session(&mut self, conv: u32) -> bool {
        match self.sessions.remove(&conv) {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close();
        }
    }

    /// Routes a datagram to its session, returning the conversation id it was routed to.
    ///  Datagrams too short for a segment header, with the reserved conversation id 0, or for an
    ///  unknown conversation when new sessions are not accepted, are dropped.
    pub fn on_datagram(&mut self, now_ms: u32, datagram: &[u8], from: SocketAddr, output: &Arc<dyn OutputPort>) -> Option<u32> {
        let Some(conv) = peek_conv(datagram) else {
            debug!("datagram of {} bytes from {:?} is too short for a segment header - dropping", datagram.len(), from);
            return None;
        };
        if conv == 0 {
            debug!("datagram from {:?} with conversation id 0 - dropping", from);
            return None;
        }

        let session = match self.sessions.entry(conv) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                if !self.accept_new_sessions {
                    debug!(conv, "datagram from {:?} for unknown conversation - dropping", from);
                    return None;
                }

                let session = match Session::new(conv, from, output.clone(), &self.config, now_ms) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(conv, "could not create session for {:?}: {}", from, e);
                        return None;
                    }
                };
                info!(conv, peer = ?from, "new session");
                let session = e.insert(session);
                if let Some(hook) = &mut self.new_session_hook {
                    hook(&mut *session);
                }
                session
            }
        };

        match session.ingest(now_ms, datagram) {
            Ok(()) => {
                session.drain();
            }
            Err(e) => {
                warn!(conv, "dropping datagram from {:?}: {}", from, e);
            }
        }

        if session.state() == SessionState::Disconnected {
            trace!(conv, "session closed while handling a datagram - removing it");
            self.sessions.remove(&conv);
        }
        Some(conv)
    }

    /// One pass over all sessions: sessions that timed out or whose link is dead are closed and
    ///  removed, all others get a tick and are drained.
    pub fn sweep(&mut self, now_ms: u32) {
        let timeout_ms = self.timeout_ms;
        self.sessions.retain(|&conv, session| {
            if let Some(timeout_ms) = timeout_ms {
                if session.is_timed_out(now_ms, timeout_ms) {
                    warn!(conv, peer = ?session.peer_addr(), "session timed out after {} ms of inactivity", timeout_ms);
                    session.close();
                    return false;
                }
            }
            if session.is_dead_link() {
                warn!(conv, peer = ?session.peer_addr(), "dead link - closing session");
                session.close();
                return false;
            }

            session.tick(now_ms);
            session.drain();
            session.state() != SessionState::Disconnected
        });
    }

    /// The single-task event loop: datagrams from `socket` are routed as they arrive, and the
    ///  sweep runs every `sweep_interval`, until `shutdown` is cancelled.
    pub async fn drive(&mut self, socket: &UdpSocket, output: &Arc<dyn OutputPort>, clock: &MonotonicClock, sweep_interval: Duration, shutdown: &CancellationToken) {
        info!("starting event loop");

        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep(clock.now_ms());
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            trace!("received {} bytes from {:?}", len, from);
                            self.on_datagram(clock.now_ms(), &buf[..len], from, output);
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
            }
        }

        info!("event loop stopped");
    }
}
