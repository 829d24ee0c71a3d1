//! Error kinds shared across the daemon and tunnel client.
//!
//! Each variant maps to one failure class with its own handling policy:
//! validation and config errors surface to the caller that mutated state,
//! certificate and bind errors are fatal for the operation that hit them,
//! upstream and IPC errors stay scoped to a single request or connection,
//! and the two tunnel variants distinguish terminal registration rejections
//! from transient transport losses that trigger a reconnect.

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("config: {0}")]
    Config(String),

    #[error("certificate: {0}")]
    Certificate(String),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("ipc: {0}")]
    Ipc(String),

    #[error("registration failed: {0}")]
    TunnelRegistration(String),

    #[error("tunnel: {0}")]
    TunnelTransport(String),

    /// Result of a single-flight call observed by a non-leader caller.
    #[error("{0}")]
    Shared(Arc<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    pub fn certificate(msg: impl std::fmt::Display) -> Self {
        Error::Certificate(msg.to_string())
    }

    pub fn upstream(msg: impl std::fmt::Display) -> Self {
        Error::Upstream(msg.to_string())
    }

    pub fn ipc(msg: impl std::fmt::Display) -> Self {
        Error::Ipc(msg.to_string())
    }

    /// Whether a tunnel error should stop the reconnect loop.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::TunnelRegistration(_) => true,
            Error::Shared(inner) => inner.is_terminal(),
            _ => false,
        }
    }
}
