//! RFC 6455 WebSocket support for the wiretap proxy: the frame codec shared
//! by both halves, the opening handshakes, and the post-upgrade server
//! session.
//!
//! Deliberately minimal: no continuation frames, no extensions, text-only
//! application payloads. Peers that need more get a protocol error instead
//! of a partial implementation.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod session;

pub use crate::error::WsError;
pub use crate::frame::{Frame, OpCode, Role, WsConnection};
pub use crate::session::{SessionEvents, WsSession};
