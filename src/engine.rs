//! The reliable-transport engine is the part that actually provides ordered, retransmitted
//!  delivery for a single conversation. The session layer treats it as an external collaborator
//!  and talks to it only through [ReliableEngine]; [kcp::KcpEngine] adapts the `kcp` crate to
//!  that contract.
//!
//! Every datagram starts with the conversation id (u32, little endian) as part of the engine's
//!  24 byte segment header:
//!
//! ```ascii
//! 0:  conv (u32 LE)
//! 4:  cmd (u8): 81 PUSH, 82 ACK, 83 WASK (window probe), 84 WINS (window size tell)
//! 5:  frg (u8): number of fragments following this one in the same message, 0 in stream mode
//! 6:  wnd (u16 LE): sender's free receive window
//! 8:  ts (u32 LE): send timestamp, echoed in the ACK for RTT measurement
//! 12: sn (u32 LE): segment sequence number
//! 16: una (u32 LE): first sequence number the sender has not yet received
//! 20: len (u32 LE): payload length
//! 24: payload
//! ```
//!
//! A datagram may contain several segments back to back, up to the configured MTU.

pub mod kcp;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::EngineError;

/// length of a segment header, and therefore the minimum length of any valid datagram
pub const KCP_OVERHEAD: usize = 24;

/// segment commands run from PUSH to WINS, see the table above
pub const CMD_PUSH: u8 = 81;
pub const CMD_WINS: u8 = 84;

pub const MIN_MTU: usize = 50;
/// the largest UDP payload over IPV4
pub const MAX_MTU: usize = 65_507;

/// the largest UDP payload that is guaranteed to avoid IP fragmentation on an Ethernet path
///  without optional IPV4 headers
pub const SAFE_DATAGRAM_SIZE: usize = 1472;

/// Reads the conversation id from a datagram's fixed header offset, or `None` if the datagram is
///  too short to carry a segment header.
pub fn peek_conv(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < KCP_OVERHEAD {
        return None;
    }
    let raw: [u8; 4] = datagram[..4].try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// The engine contract. An engine is owned exclusively by one session and touched only from the
///  session-processing context, so none of the methods need to be thread safe. Output datagrams
///  are handed to a sink the engine received when it was created, synchronously during
///  [ReliableEngine::update].
#[cfg_attr(test, automock)]
pub trait ReliableEngine: Send + 'static {
    fn conv(&self) -> u32;

    fn set_nodelay(&mut self, nodelay: bool, interval: u32, fast_resend: u32, congestion_control_off: bool);
    fn set_window_size(&mut self, send_window: u16, recv_window: u16);
    fn set_mtu(&mut self, mtu: usize) -> Result<(), EngineError>;
    fn set_min_rto(&mut self, min_rto: u32);
    fn set_fast_resend(&mut self, threshold: u32);
    fn set_stream_mode(&mut self, stream: bool);
    fn set_dead_link(&mut self, max_retransmits: u32);

    /// queues a message for reliable delivery - nothing is sent before the next `update`
    fn submit(&mut self, buf: &[u8]) -> Result<(), EngineError>;
    /// feeds a datagram received from the peer
    fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError>;
    /// advances the engine's clock, flushing ACKs, new segments and retransmissions
    fn update(&mut self, now_ms: u32);
    /// the time at which `update` needs to be called next
    fn check(&self, now_ms: u32) -> u32;
    /// the next completely reassembled message, if any
    fn recv(&mut self) -> Option<Bytes>;
    /// number of segments that are queued or in flight without acknowledgement
    fn waiting_count(&self) -> usize;
    fn is_dead_link(&self) -> bool;
}
