use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::MonotonicClock;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::output_port::{OutputPort, UdpOutputPort};
use crate::session::Session;
use crate::session_table::SessionTable;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn parse_ip(ip: &str) -> Result<IpAddr, SessionError> {
    ip.parse()
        .map_err(|_| SessionError::InvalidAddress(ip.to_string()))
}

pub(crate) fn duration_to_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

struct Listener {
    socket: Arc<UdpSocket>,
    output: Arc<dyn OutputPort>,
}

/// The Server owns one UDP socket shared by any number of sessions. Every datagram with an
///  unknown conversation id creates a session attributed to its sender.
///
/// Usage: configure, `bind_and_listen`, then `run` (or `run_until` with an external shutdown
///  token). All session handling and callbacks happen on the task that runs the loop.
pub struct Server {
    table: SessionTable,
    sweep_interval: Duration,
    listener: Option<Listener>,
    clock: MonotonicClock,
    shutdown: CancellationToken,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            table: SessionTable::new(EngineConfig::default(), Some(SessionTable::DEFAULT_TIMEOUT_MS), true),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            listener: None,
            clock: MonotonicClock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine configuration for sessions created from now on. Existing sessions keep theirs.
    pub fn configure(&mut self, config: EngineConfig) -> anyhow::Result<()> {
        config.validate()?;
        info!("engine configuration: {:?}", config);
        self.table.set_config(config);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        self.table.config()
    }

    /// inactivity after which a session is evicted
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.table.set_timeout_ms(Some(duration_to_ms(timeout)));
    }

    pub fn set_sweep_interval(&mut self, sweep_interval: Duration) {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
    }

    pub fn set_new_connection_hook(&mut self, hook: impl FnMut(&mut Session) + Send + 'static) {
        self.table.set_new_session_hook(Box::new(hook));
    }

    /// Binds the shared socket. Port 0 picks an ephemeral port; the actual address is returned.
    ///  Sessions send through the socket they were created on, so a server binds only once.
    pub async fn bind_and_listen(&mut self, ip: &str, port: u16) -> Result<SocketAddr, SessionError> {
        if let Some(listener) = &self.listener {
            warn!("already listening on {:?}", listener.socket.local_addr().ok());
            return Err(SessionError::AlreadyListening);
        }
        let ip = parse_ip(ip)?;
        let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await
            .map_err(|e| {
                error!("could not bind UDP socket to {}:{}: {}", ip, port, e);
                SessionError::TransportIo(e)
            })?;
        let local_addr = socket.local_addr()?;
        info!("listening on {:?}", local_addr);

        let socket = Arc::new(socket);
        self.listener = Some(Listener {
            output: Arc::new(UdpOutputPort::spawn(socket.clone())),
            socket,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()
            .and_then(|l| l.socket.local_addr().ok())
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// the session is valid until the next time the loop runs
    pub fn session_mut(&mut self, conv: u32) -> Option<&mut Session> {
        self.table.get_mut(conv)
    }

    pub fn close_session(&mut self, conv: u32) -> bool {
        self.table.close_session(conv)
    }

    /// A token that stops [Server::run] when cancelled, e.g. from a signal handler task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops [Server::run]. The server's own token stays cancelled, so a subsequent `run` returns
    ///  immediately - use `run_until` with a fresh token to restart.
    pub fn stop(&self) {
        info!("stopping server");
        self.shutdown.cancel();
    }

    pub async fn run(&mut self) -> Result<(), SessionError> {
        let shutdown = self.shutdown.clone();
        self.run_until(shutdown).await
    }

    /// Runs the event loop until `shutdown` is cancelled. Sessions survive the loop's end and are
    ///  driven again by the next run.
    pub async fn run_until(&mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let Some(listener) = &self.listener else {
            return Err(SessionError::NotListening);
        };

        self.table.drive(&listener.socket, &listener.output, &self.clock, self.sweep_interval, &shutdown).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use crate::client::Client;

    #[rstest]
    #[case::hostname("localhost")]
    #[case::garbage("1.2.3")]
    #[case::empty("")]
    fn test_bind_rejects_invalid_address(#[case] ip: &str) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut server = Server::new();
            assert!(matches!(server.bind_and_listen(ip, 0).await, Err(SessionError::InvalidAddress(_))));
            assert!(server.local_addr().is_none());
        });
    }

    #[tokio::test]
    async fn test_bind_twice_is_rejected() {
        let mut server = Server::new();
        let first = server.bind_and_listen("127.0.0.1", 0).await.unwrap();

        assert!(matches!(server.bind_and_listen("127.0.0.1", 0).await, Err(SessionError::AlreadyListening)));
        assert_eq!(server.local_addr(), Some(first));
    }

    #[tokio::test]
    async fn test_run_requires_listening() {
        let mut server = Server::new();
        assert!(matches!(server.run().await, Err(SessionError::NotListening)));
    }

    #[test]
    fn test_configure_validates() {
        let mut server = Server::new();
        assert!(server.configure(EngineConfig { mtu: 10, ..EngineConfig::default() }).is_err());
        assert_eq!(server.config(), &EngineConfig::default());

        server.configure(EngineConfig::normal()).unwrap();
        assert_eq!(server.config(), &EngineConfig::normal());
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        let mut server = Server::new();
        server.bind_and_listen("127.0.0.1", 0).await.unwrap();
        server.stop();
        timeout(Duration::from_secs(5), server.run()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_short_datagram_creates_no_session() {
        let mut server = Server::new();
        let server_addr = server.bind_and_listen("127.0.0.1", 0).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[1, 2, 3], server_addr).await.unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (result, _) = tokio::join!(
            server.run_until(shutdown),
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                stopper.cancel();
            },
        );
        result.unwrap();
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_client_message_reaches_server() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut server = Server::new();
        server.set_new_connection_hook(move |session| {
            let tx = tx.clone();
            session.set_data_callback(move |session, msg| {
                tx.send((session.conv(), session.peer_addr(), msg.to_vec())).ok();
            });
        });
        let server_addr = server.bind_and_listen("127.0.0.1", 0).await.unwrap();

        let mut client = Client::new();
        client.connect("127.0.0.1", server_addr.port(), 7).await.unwrap();
        client.send(b"hello").unwrap();
        let client_addr = client.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (server_result, client_result, received) = tokio::join!(
            server.run_until(shutdown.clone()),
            client.run_until(shutdown.clone()),
            async move {
                let received = timeout(Duration::from_secs(5), rx.recv()).await;
                stopper.cancel();
                received
            },
        );
        server_result.unwrap();
        client_result.unwrap();

        let (conv, peer, msg) = received.unwrap().unwrap();
        assert_eq!(conv, 7);
        assert_eq!(peer.port(), client_addr.port());
        assert_eq!(msg, b"hello");
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_multiplexed() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut server = Server::new();
        server.set_new_connection_hook(move |session| {
            let tx = tx.clone();
            session.set_data_callback(move |session, msg| {
                tx.send((session.conv(), msg.to_vec())).ok();
            });
        });
        let server_addr = server.bind_and_listen("127.0.0.1", 0).await.unwrap();

        let mut first = Client::new();
        first.connect("127.0.0.1", server_addr.port(), 1).await.unwrap();
        first.send(b"from one").unwrap();
        let mut second = Client::new();
        second.connect("127.0.0.1", server_addr.port(), 2).await.unwrap();
        second.send(b"from two").unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (_, _, _, received) = tokio::join!(
            server.run_until(shutdown.clone()),
            first.run_until(shutdown.clone()),
            second.run_until(shutdown.clone()),
            async move {
                let mut received = Vec::new();
                while received.len() < 2 {
                    match timeout(Duration::from_secs(5), rx.recv()).await {
                        Ok(Some(msg)) => received.push(msg),
                        _ => break,
                    }
                }
                stopper.cancel();
                received
            },
        );

        let mut received = received;
        received.sort();
        assert_eq!(received, vec![(1, b"from one".to_vec()), (2, b"from two".to_vec())]);
        assert_eq!(server.session_count(), 2);
    }
}
