//! Shared leaf components of the wiretap proxy: the header bag, rewrite
//! rules, the Content-Length adjuster, the byte-transparent text codec, the
//! prefix-splicing reader and the traffic-log seam.

pub mod content_length;
pub mod error;
pub mod headers;
pub mod rules;
pub mod splice;
pub mod text;
pub mod traffic;

pub use crate::error::{ConfigError, HeaderError};
pub use crate::headers::HeaderBag;
pub use crate::rules::RewriteRule;
pub use crate::splice::PrefixedReader;
pub use crate::traffic::{TracingTrafficLog, TrafficLog};
