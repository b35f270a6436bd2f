//! Multiplexes many independent, ordered, reliable sessions over a single UDP socket.
//!
//! Each session is identified by a non-zero 32-bit conversation id ('conv') that is carried in
//!  the first four bytes of every datagram. Reliability (retransmission, ordering, flow and
//!  congestion control) is provided per session by a KCP-compatible engine that the session owns
//!  exclusively.
//!
//! ## Design
//!
//! * There is no handshake. A server creates a session the first time it sees a datagram for an
//!   unknown conversation, and binds it to the sender's address. A client creates its session
//!   on `connect`.
//! * Everything runs on a single task: routing inbound datagrams, the periodic sweep, and all
//!   callbacks. Sessions and engines are never shared, so there is no locking.
//! * The sweep runs at a fixed period (10ms by default). For every session it either evicts it
//!   (inactivity timeout or dead link) or advances the engine's clock and drains complete
//!   messages to the data callback.
//! * Sessions offer two send paths: reliable through the engine, and best-effort straight to the
//!   socket for data where a late arrival is worthless.
//! * Closing a session is immediate. Unacknowledged data is discarded.
//!
//! ## Trust
//!
//! A conversation id is bound to the address it was first seen from, but later datagrams are not
//!  checked against that address. Anybody who can send to the socket and guess a conv can inject
//!  data into that session, so this is for trusted networks only.
//!
//! ## Wire format
//!
//! See [engine] for the segment layout.

pub mod error;
pub mod config;
pub mod engine;
pub mod output_port;
pub mod clock;
pub mod session;
pub mod session_table;
pub mod server;
pub mod client;

#[cfg(test)]
pub mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
