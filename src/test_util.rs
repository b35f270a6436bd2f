use std::net::SocketAddr;
use std::sync::Mutex;

use crate::engine::{CMD_PUSH, KCP_OVERHEAD};
use crate::output_port::OutputPort;

/// Captures everything sent through it, for tests that shuttle datagrams between sessions by hand
#[derive(Default)]
pub struct RecordingOutputPort {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingOutputPort {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputPort for RecordingOutputPort {
    fn send_to(&self, to: SocketAddr, buf: &[u8]) {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// a syntactically valid PUSH segment for `conv` carrying `payload` with sequence number `sn`
pub fn push_datagram(conv: u32, sn: u32, payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(KCP_OVERHEAD + payload.len());
    result.extend_from_slice(&conv.to_le_bytes());
    result.push(CMD_PUSH);
    result.push(0);
    result.extend_from_slice(&128u16.to_le_bytes());
    result.extend_from_slice(&0u32.to_le_bytes());
    result.extend_from_slice(&sn.to_le_bytes());
    result.extend_from_slice(&0u32.to_le_bytes());
    result.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    result.extend_from_slice(payload);
    result
}
