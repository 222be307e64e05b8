//! The proxy connection engine: per-direction relays with in-flight
//! substitution and Content-Length fixup, the one-shot stream router, and
//! the supervisor that pairs clients with upstreams.

pub mod relay;
pub mod router;
pub mod supervisor;

pub use crate::relay::{Direction, Relay};
pub use crate::router::{RouterConfig, StreamRouter};
pub use crate::supervisor::{ProxyConfig, ProxySupervisor, UpstreamTransport};
