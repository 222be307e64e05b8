//! Minimal HTTP/1.1 dispatch server: request-line and header parsing,
//! keep-alive lifecycle, and the raw-socket escape hatch that hands a
//! connection over to an upgrade handler.

pub mod exchange;
pub mod server;

pub use crate::exchange::{Exchange, ExchangeError, RawReader};
pub use crate::server::{DispatchServer, Handler, HandlerError, ServerHandle};
