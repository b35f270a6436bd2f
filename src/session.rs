use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::clock::elapsed_since;
use crate::config::EngineConfig;
use crate::engine::kcp::KcpEngine;
use crate::engine::{ReliableEngine, SAFE_DATAGRAM_SIZE};
use crate::error::SessionError;
use crate::output_port::OutputPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Receives every completely reassembled message. The session is passed in so the callback can
///  reply or close it.
pub type DataCallback = Box<dyn FnMut(&mut Session, &[u8]) + Send>;
pub type CloseCallback = Box<dyn FnOnce(&Session) + Send>;

/// A Session is one conversation with one peer: it owns the conversation's engine exclusively,
///  tracks lifecycle state and inactivity, and offers two send paths - reliable through the
///  engine, and best-effort straight to the socket.
///
/// There is no handshake: a session is `Connected` as soon as it is created. `Disconnected` is
///  terminal.
pub struct Session {
    conv: u32,
    peer: SocketAddr,
    state: SessionState,
    last_active: u32,
    engine: Box<dyn ReliableEngine>,
    output: Arc<dyn OutputPort>,
    data_callback: Option<DataCallback>,
    close_callback: Option<CloseCallback>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.conv)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("last_active", &self.last_active)
            .finish()
    }
}

impl Session {
    /// Creates a session backed by a [KcpEngine] whose output goes to `peer` through `output`.
    pub fn new(conv: u32, peer: SocketAddr, output: Arc<dyn OutputPort>, config: &EngineConfig, now_ms: u32) -> Result<Session, SessionError> {
        if conv == 0 {
            return Err(SessionError::InvalidConversationId);
        }

        let mut engine = KcpEngine::new(conv, peer, output.clone());
        config.apply_to(&mut engine)
            .map_err(SessionError::Config)?;

        Session::with_engine(Box::new(engine), peer, output, now_ms)
    }

    /// Creates a session around an engine that was set up by the caller, including its output
    ///  sink.
    pub fn with_engine(engine: Box<dyn ReliableEngine>, peer: SocketAddr, output: Arc<dyn OutputPort>, now_ms: u32) -> Result<Session, SessionError> {
        let conv = engine.conv();
        if conv == 0 {
            return Err(SessionError::InvalidConversationId);
        }

        let mut session = Session {
            conv,
            peer,
            state: SessionState::Connecting,
            last_active: now_ms,
            engine,
            output,
            data_callback: None,
            close_callback: None,
        };
        session.establish();
        Ok(session)
    }

    fn establish(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Connected;
        info!(conv = self.conv, peer = ?self.peer, "session connected");
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn last_active_ms(&self) -> u32 {
        self.last_active
    }

    pub fn set_data_callback(&mut self, callback: impl FnMut(&mut Session, &[u8]) + Send + 'static) {
        self.data_callback = Some(Box::new(callback));
    }

    pub fn set_close_callback(&mut self, callback: impl FnOnce(&Session) + Send + 'static) {
        self.close_callback = Some(Box::new(callback));
    }

    pub(crate) fn set_boxed_callbacks(&mut self, data_callback: Option<DataCallback>, close_callback: Option<CloseCallback>) {
        if data_callback.is_some() {
            self.data_callback = data_callback;
        }
        if close_callback.is_some() {
            self.close_callback = close_callback;
        }
    }

    pub fn set_min_rto(&mut self, min_rto_ms: u32) {
        self.engine.set_min_rto(min_rto_ms);
    }

    pub fn set_fast_resend(&mut self, threshold: u32) {
        self.engine.set_fast_resend(threshold);
    }

    pub fn set_stream_mode(&mut self, stream: bool) {
        self.engine.set_stream_mode(stream);
    }

    pub fn set_dead_link(&mut self, max_retransmits: u32) {
        self.engine.set_dead_link(max_retransmits);
    }

    /// Queues `buf` for reliable, ordered delivery. Nothing goes on the wire before the next
    ///  [Session::tick].
    pub fn send_reliable(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            debug!(conv = self.conv, state = ?self.state, "reliable send on a session that is not connected");
            return Err(SessionError::NotConnected);
        }

        self.engine.submit(buf)
            .map_err(|e| {
                warn!(conv = self.conv, len = buf.len(), "engine rejected message: {}", e);
                SessionError::ResourceExhausted(e)
            })
    }

    /// Sends `buf` as a single datagram, bypassing the engine: no ordering, no retransmission,
    ///  no fragmentation. The peer's engine receives these bytes as input, so they are subject
    ///  to its validation.
    pub fn send_unreliable(&self, buf: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            debug!(conv = self.conv, state = ?self.state, "unreliable send on a session that is not connected");
            return Err(SessionError::NotConnected);
        }

        if buf.len() > SAFE_DATAGRAM_SIZE {
            warn!(conv = self.conv, len = buf.len(), "direct send of {} bytes exceeds the safe datagram size of {} bytes and may be fragmented or dropped", buf.len(), SAFE_DATAGRAM_SIZE);
        }
        self.output.send_to(self.peer, buf);
        Ok(())
    }

    /// Feeds a datagram received from the peer into the engine. Inactivity tracking counts only
    ///  datagrams the engine accepted.
    pub fn ingest(&mut self, now_ms: u32, datagram: &[u8]) -> Result<(), SessionError> {
        trace!(conv = self.conv, len = datagram.len(), "ingesting datagram");
        self.engine.input(datagram)
            .map_err(SessionError::Protocol)?;
        self.last_active = now_ms;
        Ok(())
    }

    /// Passes every complete message to the data callback, in delivery order, and returns the
    ///  number of messages taken from the engine. Messages arriving without a callback are
    ///  discarded. Draining stops early if the callback closes the session.
    pub fn drain(&mut self) -> usize {
        let mut num_drained = 0;
        while self.state == SessionState::Connected {
            let Some(message) = self.engine.recv() else {
                break;
            };
            num_drained += 1;

            match self.data_callback.take() {
                Some(mut callback) => {
                    callback(&mut *self, &message[..]);
                    // the callback may have installed a replacement for itself, or closed the session
                    if self.data_callback.is_none() && self.state == SessionState::Connected {
                        self.data_callback = Some(callback);
                    }
                }
                None => {
                    debug!(conv = self.conv, len = message.len(), "no data callback - discarding message");
                }
            }
        }
        num_drained
    }

    /// Advances the engine's clock, flushing ACKs, queued messages and retransmissions.
    pub fn tick(&mut self, now_ms: u32) {
        self.engine.update(now_ms);
    }

    /// The time at which the engine next needs a tick. The fixed-period sweep does not use this.
    pub fn next_update_hint(&self, now_ms: u32) -> u32 {
        self.engine.check(now_ms)
    }

    /// number of reliable segments that are queued or unacknowledged
    pub fn waiting_count(&self) -> usize {
        self.engine.waiting_count()
    }

    pub fn is_dead_link(&self) -> bool {
        self.engine.is_dead_link()
    }

    pub fn is_timed_out(&self, now_ms: u32, timeout_ms: u32) -> bool {
        elapsed_since(now_ms, self.last_active) > timeout_ms
    }

    /// Closes the session immediately, discarding whatever the engine has not delivered yet. The
    ///  close callback fires on the first call only.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Disconnecting | SessionState::Disconnected => return,
            SessionState::Connecting | SessionState::Connected => {}
        }

        self.state = SessionState::Disconnecting;
        let unacknowledged = self.engine.waiting_count();
        if unacknowledged > 0 {
            info!(conv = self.conv, unacknowledged, "closing session with unacknowledged segments - discarding them");
        }
        self.state = SessionState::Disconnected;
        info!(conv = self.conv, peer = ?self.peer, "session disconnected");

        self.data_callback = None;
        if let Some(callback) = self.close_callback.take() {
            callback(self);
        }
    }
}
