use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use kcp::Kcp;
use tracing::{debug, error, trace, warn};

use crate::engine::{peek_conv, ReliableEngine, CMD_PUSH, CMD_WINS, KCP_OVERHEAD, MAX_MTU, MIN_MTU};
use crate::error::EngineError;
use crate::output_port::OutputPort;

const DEFAULT_MTU: usize = 1400;

/// A message may not need this many fragments or more: the fragment counter must fit into the
///  receiver's default window.
const MAX_FRAGMENTS: usize = 128;

fn to_engine_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// The engine's write side. Every datagram the engine flushes goes to the session's peer through
///  the shared [OutputPort], which copies it and never fails from the engine's point of view.
#[derive(Clone)]
pub struct PeerWriter {
    peer: SocketAddr,
    output: Arc<dyn OutputPort>,
}

impl Write for PeerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        trace!("engine output: {} bytes to {:?}", buf.len(), self.peer);
        self.output.send_to(self.peer, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Tuning that was applied so far. The underlying engine fixes its framing mode at creation, so
///  switching modes means building a fresh engine and replaying this on it.
#[derive(Debug, Clone, Default)]
struct Tuning {
    nodelay: Option<(bool, i32, i32, bool)>,
    window: Option<(u16, u16)>,
    mtu: Option<usize>,
    min_rto: Option<u32>,
    fast_resend: Option<u32>,
    dead_link: Option<u32>,
}

impl Tuning {
    fn apply(&self, kcp: &mut Kcp<PeerWriter>) {
        if let Some((nodelay, interval, resend, no_cwnd)) = self.nodelay {
            kcp.set_nodelay(nodelay, interval, resend, no_cwnd);
        }
        if let Some((send_window, recv_window)) = self.window {
            kcp.set_wndsize(send_window, recv_window);
        }
        if let Some(mtu) = self.mtu {
            if let Err(e) = kcp.set_mtu(mtu) {
                error!("engine rejected previously accepted mtu {}: {}", mtu, e);
            }
        }
        if let Some(min_rto) = self.min_rto {
            kcp.set_rx_minrto(min_rto);
        }
        if let Some(threshold) = self.fast_resend {
            kcp.set_fast_resend(threshold);
        }
        if let Some(max_retransmits) = self.dead_link {
            kcp.set_maximum_resend_times(max_retransmits);
        }
    }
}

/// [ReliableEngine] on top of the `kcp` crate, the ikcp ARQ state machine ported to Rust. The
///  engine is passive: time comes in through `update`, datagrams through `input`, and flushed
///  datagrams go out through a [PeerWriter].
pub struct KcpEngine {
    kcp: Kcp<PeerWriter>,
    writer: PeerWriter,
    tuning: Tuning,
    mtu: usize,
    stream: bool,
    /// set once data went through the engine in either direction, which pins the framing mode
    in_use: bool,
}

impl KcpEngine {
    pub fn new(conv: u32, peer: SocketAddr, output: Arc<dyn OutputPort>) -> KcpEngine {
        let writer = PeerWriter { peer, output };
        KcpEngine {
            kcp: Kcp::new(conv, writer.clone()),
            writer,
            tuning: Tuning::default(),
            mtu: DEFAULT_MTU,
            stream: false,
            in_use: false,
        }
    }

    pub fn is_stream_mode(&self) -> bool {
        self.stream
    }
}

impl ReliableEngine for KcpEngine {
    fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    fn set_nodelay(&mut self, nodelay: bool, interval: u32, fast_resend: u32, congestion_control_off: bool) {
        let params = (nodelay, to_engine_int(interval), to_engine_int(fast_resend), congestion_control_off);
        self.kcp.set_nodelay(params.0, params.1, params.2, params.3);
        self.tuning.nodelay = Some(params);
    }

    fn set_window_size(&mut self, send_window: u16, recv_window: u16) {
        self.kcp.set_wndsize(send_window, recv_window);
        self.tuning.window = Some((send_window, recv_window));
    }

    fn set_mtu(&mut self, mtu: usize) -> Result<(), EngineError> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(EngineError::InvalidMtu(mtu));
        }
        self.kcp.set_mtu(mtu)
            .map_err(|_| EngineError::InvalidMtu(mtu))?;
        self.mtu = mtu;
        self.tuning.mtu = Some(mtu);
        Ok(())
    }

    fn set_min_rto(&mut self, min_rto: u32) {
        self.kcp.set_rx_minrto(min_rto);
        self.tuning.min_rto = Some(min_rto);
    }

    fn set_fast_resend(&mut self, threshold: u32) {
        self.kcp.set_fast_resend(threshold);
        self.tuning.fast_resend = Some(threshold);
    }

    fn set_stream_mode(&mut self, stream: bool) {
        if stream == self.stream {
            return;
        }
        let conv = self.kcp.conv();
        if self.in_use {
            warn!(conv, "framing mode can only be changed before any data was exchanged - ignoring");
            return;
        }

        debug!(conv, stream, "switching framing mode");
        let mut kcp = if stream {
            Kcp::new_stream(conv, self.writer.clone())
        }
        else {
            Kcp::new(conv, self.writer.clone())
        };
        self.tuning.apply(&mut kcp);
        self.kcp = kcp;
        self.stream = stream;
    }

    fn set_dead_link(&mut self, max_retransmits: u32) {
        self.kcp.set_maximum_resend_times(max_retransmits);
        self.tuning.dead_link = Some(max_retransmits);
    }

    fn submit(&mut self, buf: &[u8]) -> Result<(), EngineError> {
        let mss = self.mtu - KCP_OVERHEAD;
        let fragments = buf.len().div_ceil(mss).max(1);
        if fragments >= MAX_FRAGMENTS {
            return Err(EngineError::WindowExceeded { fragments, window: MAX_FRAGMENTS as u16 });
        }

        self.in_use = true;
        self.kcp.send(buf)
            .map_err(EngineError::Rejected)?;
        Ok(())
    }

    fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
        let Some(conv) = peek_conv(datagram) else {
            return Err(EngineError::Truncated(datagram.len()));
        };
        let expected = self.kcp.conv();
        if conv != expected {
            return Err(EngineError::ConvMismatch { expected, actual: conv });
        }
        let cmd = datagram[4];
        if !(CMD_PUSH..=CMD_WINS).contains(&cmd) {
            return Err(EngineError::UnknownCommand(cmd));
        }

        self.in_use = true;
        self.kcp.input(datagram)
            .map_err(EngineError::Rejected)?;
        Ok(())
    }

    fn update(&mut self, now_ms: u32) {
        if let Err(e) = self.kcp.update(now_ms) {
            error!(conv = self.kcp.conv(), "engine flush failed: {}", e);
        }
    }

    fn check(&self, now_ms: u32) -> u32 {
        self.kcp.check(now_ms)
    }

    fn recv(&mut self) -> Option<Bytes> {
        // fails while the queue is empty or the next message is incomplete
        let size = self.kcp.peeksize().ok()?;

        let mut message = vec![0u8; size];
        match self.kcp.recv(&mut message) {
            Ok(len) => {
                message.truncate(len);
                Some(Bytes::from(message))
            }
            Err(e) => {
                warn!(conv = self.kcp.conv(), "engine reported a message of {} bytes but could not deliver it: {}", size, e);
                None
            }
        }
    }

    fn waiting_count(&self) -> usize {
        self.kcp.wait_snd()
    }

    fn is_dead_link(&self) -> bool {
        self.kcp.is_dead_link()
    }
}
