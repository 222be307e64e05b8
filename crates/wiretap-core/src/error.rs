use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header name is empty")]
    EmptyName,
    #[error("header bag is read-only")]
    ReadOnly,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown upstream transport: {0} (expected tcp or tls)")]
    UnknownTransport(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid trigger pattern: {0}")]
    InvalidTrigger(String),
    #[error("search/replace arguments must come in pairs, got a dangling {0:?}")]
    DanglingRule(String),
}
