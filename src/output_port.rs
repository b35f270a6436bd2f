#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace, warn};

/// This is the abstraction for putting bytes on the shared socket. Both the engine's output path
///  and the best-effort direct path go through it, so they share transmission semantics and
///  failure visibility.
///
/// Sending is fire-and-forget: implementations copy the buffer before returning, and failures are
///  logged rather than reported to the caller. The layers above already tolerate loss.
#[cfg_attr(test, automock)]
pub trait OutputPort: Send + Sync + 'static {
    fn send_to(&self, to: SocketAddr, buf: &[u8]);
}

/// number of datagrams waiting for the writer task before further datagrams are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// [OutputPort] for a tokio [UdpSocket]. Sending copies the buffer and hands it to a writer task
///  that owns the socket's send side, preserving submission order. If the socket falls behind and
///  the queue is full, datagrams are dropped like on a congested network.
pub struct UdpOutputPort {
    sender: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl UdpOutputPort {
    /// Spawns the writer task on the current tokio runtime. The task terminates when the port is
    ///  dropped.
    pub fn spawn(socket: Arc<UdpSocket>) -> UdpOutputPort {
        UdpOutputPort::with_capacity(socket, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(socket: Arc<UdpSocket>, capacity: usize) -> UdpOutputPort {
        let (sender, mut receiver) = mpsc::channel::<(SocketAddr, Bytes)>(capacity.max(1));

        tokio::spawn(async move {
            while let Some((to, buf)) = receiver.recv().await {
                trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
                if let Err(e) = socket.send_to(&buf, to).await {
                    error!("error sending UDP datagram to {:?}: {}", to, e);
                }
            }
            debug!("output port closed - writer task terminates");
        });

        UdpOutputPort { sender }
    }
}

impl OutputPort for UdpOutputPort {
    fn send_to(&self, to: SocketAddr, buf: &[u8]) {
        match self.sender.try_send((to, Bytes::copy_from_slice(buf))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("UDP send queue is full - dropping datagram of {} bytes to {:?}", buf.len(), to);
            }
            Err(TrySendError::Closed(_)) => {
                error!("writer task for UDP socket is gone - dropping datagram to {:?}", to);
            }
        }
    }
}
