use std::io;

/// Rejections raised by a [crate::engine::ReliableEngine]. They never tear down a session by
///  themselves: the session layer maps them to [SessionError::Protocol] (input side) or
///  [SessionError::ResourceExhausted] (submit side).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} bytes is too short for a 24 byte segment header")]
    Truncated(usize),
    #[error("segment for conversation {actual} fed into conversation {expected}")]
    ConvMismatch { expected: u32, actual: u32 },
    #[error("unknown segment command {0}")]
    UnknownCommand(u8),
    #[error("message needs {fragments} fragments, receive window only allows {window}")]
    WindowExceeded { fragments: usize, window: u16 },
    #[error("mtu of {0} bytes is outside of 50..=65507")]
    InvalidMtu(usize),
    #[error("engine rejected the operation: {0}")]
    Rejected(#[source] kcp::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("conversation id 0 is reserved")]
    InvalidConversationId,
    #[error("session is not connected")]
    NotConnected,
    #[error("a session is already established")]
    AlreadyConnected,
    #[error("server is not listening")]
    NotListening,
    #[error("server is already listening")]
    AlreadyListening,
    #[error("engine rejected input: {0}")]
    Protocol(#[source] EngineError),
    #[error("engine send queue exhausted: {0}")]
    ResourceExhausted(#[source] EngineError),
    #[error("engine rejected configuration: {0}")]
    Config(#[source] EngineError),
    #[error("transport i/o error: {0}")]
    TransportIo(#[from] io::Error),
}
