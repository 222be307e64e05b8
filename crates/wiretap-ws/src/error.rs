use std::io;

use thiserror::Error;
use wiretap_core::HeaderError;
use wiretap_http::ExchangeError;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("unsupported opcode: {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("handshake rejected: {0}")]
    HandshakeFailed(String),
    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {got}")]
    AcceptMismatch { expected: String, got: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
