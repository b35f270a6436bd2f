use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::MonotonicClock;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::output_port::{OutputPort, UdpOutputPort};
use crate::server::{duration_to_ms, parse_ip, DEFAULT_SWEEP_INTERVAL};
use crate::session::{CloseCallback, DataCallback, Session};
use crate::session_table::SessionTable;

struct Connection {
    conv: u32,
    socket: Arc<UdpSocket>,
    output: Arc<dyn OutputPort>,
}

/// The Client has a single session with a fixed server, over an ephemeral local UDP port. It
///  runs the same routing and sweep as the server, but never creates sessions for datagrams it
///  did not expect.
pub struct Client {
    table: SessionTable,
    sweep_interval: Duration,
    connection: Option<Connection>,
    data_callback: Option<DataCallback>,
    close_callback: Option<CloseCallback>,
    clock: MonotonicClock,
    shutdown: CancellationToken,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Client {
        Client {
            table: SessionTable::new(EngineConfig::default(), None, false),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            connection: None,
            data_callback: None,
            close_callback: None,
            clock: MonotonicClock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// engine configuration for the next `connect`
    pub fn configure(&mut self, config: EngineConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.table.set_config(config);
        Ok(())
    }

    /// Opts into evicting the session after `timeout` without inbound traffic. By default a
    ///  client keeps its session for as long as it is connected.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.table.set_timeout_ms(Some(duration_to_ms(timeout)));
    }

    pub fn set_sweep_interval(&mut self, sweep_interval: Duration) {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
    }

    /// Installs the data callback on the current session, or keeps it for the next `connect`.
    pub fn set_data_callback(&mut self, callback: impl FnMut(&mut Session, &[u8]) + Send + 'static) {
        match self.session_mut() {
            Some(session) => session.set_data_callback(callback),
            None => self.data_callback = Some(Box::new(callback)),
        }
    }

    /// Installs the close callback on the current session, or keeps it for the next `connect`.
    pub fn set_close_callback(&mut self, callback: impl FnOnce(&Session) + Send + 'static) {
        match self.session_mut() {
            Some(session) => session.set_close_callback(callback),
            None => self.close_callback = Some(Box::new(callback)),
        }
    }

    /// Binds an ephemeral local port and creates the session. There is no handshake, so this
    ///  succeeds whether or not a server is listening at the other end.
    pub async fn connect(&mut self, ip: &str, port: u16, conv: u32) -> Result<(), SessionError> {
        if self.is_connected() {
            return Err(SessionError::AlreadyConnected);
        }
        if conv == 0 {
            return Err(SessionError::InvalidConversationId);
        }
        let peer = SocketAddr::new(parse_ip(ip)?, port);

        // the previous session may have timed out, leaving its socket behind
        self.release_connection();

        let local = if peer.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        }
        else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = UdpSocket::bind(local).await
            .map_err(|e| {
                error!("could not bind UDP socket: {}", e);
                SessionError::TransportIo(e)
            })?;
        info!("client bound to {:?}", socket.local_addr()?);

        let socket = Arc::new(socket);
        let output: Arc<dyn OutputPort> = Arc::new(UdpOutputPort::spawn(socket.clone()));

        let mut session = Session::new(conv, peer, output.clone(), self.table.config(), self.clock.now_ms())?;
        session.set_boxed_callbacks(self.data_callback.take(), self.close_callback.take());
        self.table.insert(session)?;

        info!(conv, "connected to {:?}", peer);
        self.connection = Some(Connection { conv, socket, output });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref()
            .and_then(|c| self.table.get(c.conv))
            .is_some_and(|s| s.is_connected())
    }

    pub fn conv(&self) -> Option<u32> {
        self.connection.as_ref().map(|c| c.conv)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref()
            .and_then(|c| c.socket.local_addr().ok())
    }

    /// The session, for best-effort sends and per-session tuning. `None` when not connected.
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        let conv = self.connection.as_ref()?.conv;
        self.table.get_mut(conv)
    }

    /// sends reliably
    pub fn send(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        match self.session_mut() {
            Some(session) => session.send_reliable(buf),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Closes the session (firing its close callback) and releases the socket.
    pub fn disconnect(&mut self) {
        if let Some(connection) = &self.connection {
            info!(conv = connection.conv, "disconnecting");
            self.table.close_session(connection.conv);
        }
        self.release_connection();
    }

    fn release_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.table.close_session(connection.conv);
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Disconnects and stops [Client::run]. A later `connect` starts over, but its `run` needs
    ///  a fresh token through `run_until`.
    pub fn stop(&mut self) {
        info!("stopping client");
        self.disconnect();
        self.shutdown.cancel();
    }

    pub async fn run(&mut self) -> Result<(), SessionError> {
        let shutdown = self.shutdown.clone();
        self.run_until(shutdown).await
    }

    pub async fn run_until(&mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let Some(connection) = &self.connection else {
            return Err(SessionError::NotConnected);
        };

        self.table.drive(&connection.socket, &connection.output, &self.clock, self.sweep_interval, &shutdown).await;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use rstest::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use crate::server::Server;
    use crate::session::SessionState;

    #[rstest]
    #[case::conv_zero("127.0.0.1", 0)]
    #[case::bad_ip("not an ip", 7)]
    #[tokio::test]
    async fn test_connect_rejects_invalid_arguments(#[case] ip: &str, #[case] conv: u32) {
        let mut client = Client::new();
        let result = client.connect(ip, 9999, conv).await;
        match conv {
            0 => assert!(matches!(result, Err(SessionError::InvalidConversationId))),
            _ => assert!(matches!(result, Err(SessionError::InvalidAddress(_)))),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let mut client = Client::new();
        client.connect("127.0.0.1", 9999, 7).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.conv(), Some(7));
        assert_eq!(client.session_mut().unwrap().state(), SessionState::Connected);

        assert!(matches!(client.connect("127.0.0.1", 9999, 8).await, Err(SessionError::AlreadyConnected)));
        assert_eq!(client.conv(), Some(7));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut client = Client::new();
        assert!(matches!(client.send(b"hello"), Err(SessionError::NotConnected)));
        assert!(matches!(client.run().await, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let closed2 = closed.clone();

        let mut client = Client::new();
        client.set_close_callback(move |session| closed2.lock().unwrap().push(session.conv()));
        client.connect("127.0.0.1", 9999, 7).await.unwrap();

        client.disconnect();
        client.disconnect();

        assert!(!client.is_connected());
        assert!(client.local_addr().is_none());
        assert!(matches!(client.send(b"hello"), Err(SessionError::NotConnected)));
        assert_eq!(*closed.lock().unwrap(), vec![7]);

        // reconnecting is possible after a disconnect
        client.connect("127.0.0.1", 9999, 8).await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_stop_disconnects() {
        let closed = Arc::new(Mutex::new(0));
        let closed2 = closed.clone();

        let mut client = Client::new();
        client.set_close_callback(move |_| *closed2.lock().unwrap() += 1);
        client.connect("127.0.0.1", 9999, 7).await.unwrap();

        client.stop();

        assert!(!client.is_connected());
        assert_eq!(*closed.lock().unwrap(), 1);
        assert!(matches!(client.send(b"hello"), Err(SessionError::NotConnected)));
        assert!(matches!(client.run().await, Err(SessionError::NotConnected)));
        assert!(client.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut server = Server::new();
        server.set_new_connection_hook(|session| {
            session.set_data_callback(|session, msg| {
                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(msg);
                session.send_reliable(&reply).unwrap();
            });
        });
        let server_addr = server.bind_and_listen("127.0.0.1", 0).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = Client::new();
        client.set_data_callback(move |_, msg| {
            tx.send(msg.to_vec()).ok();
        });
        client.connect("127.0.0.1", server_addr.port(), 1234).await.unwrap();
        for i in 0..5 {
            client.send(format!("message {}", i).as_bytes()).unwrap();
        }

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (_, _, replies) = tokio::join!(
            server.run_until(shutdown.clone()),
            client.run_until(shutdown.clone()),
            async move {
                let mut replies = Vec::new();
                while replies.len() < 5 {
                    match timeout(Duration::from_secs(5), rx.recv()).await {
                        Ok(Some(reply)) => replies.push(String::from_utf8(reply).unwrap()),
                        _ => break,
                    }
                }
                stopper.cancel();
                replies
            },
        );

        assert_eq!(replies, (0..5).map(|i| format!("echo: message {}", i)).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_stays_connected() {
        let closed = Arc::new(Mutex::new(0));
        let closed2 = closed.clone();

        let mut client = Client::new();
        client.set_close_callback(move |_| *closed2.lock().unwrap() += 1);
        client.connect("127.0.0.1", 9, 7).await.unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (result, _) = tokio::join!(
            client.run_until(shutdown),
            async move {
                tokio::time::sleep(Duration::from_millis(30_100)).await;
                stopper.cancel();
            },
        );
        result.unwrap();

        assert!(client.is_connected());
        assert_eq!(*closed.lock().unwrap(), 0);
        client.send(b"still here").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_times_out_without_server() {
        let closed = Arc::new(Mutex::new(0));
        let closed2 = closed.clone();

        let mut client = Client::new();
        client.set_timeout(Duration::from_millis(500));
        client.set_close_callback(move |_| *closed2.lock().unwrap() += 1);
        client.connect("127.0.0.1", 9, 7).await.unwrap();

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let (result, _) = tokio::join!(
            client.run_until(shutdown),
            async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                stopper.cancel();
            },
        );
        result.unwrap();

        assert!(!client.is_connected());
        assert_eq!(*closed.lock().unwrap(), 1);
    }
}
