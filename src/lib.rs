//! dotlocal - local HTTPS reverse proxy for `.local` hostnames
//!
//! A long-lived daemon that:
//! - Terminates TLS for a mutable set of `.local` hostnames, issuing leaf
//!   certificates under a locally generated root CA on demand via SNI
//! - Routes requests to per-hostname upstream ports, with optional
//!   path-prefix sub-routes and WebSocket passthrough
//! - Hot-reloads its routing table over a unix control socket
//! - Optionally multiplexes a public tunnel over one outbound WebSocket

pub mod access_log;
pub mod ca;
pub mod cert_cache;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod pages;
pub mod paths;
pub mod probe;
pub mod proxy;
pub mod router;
pub mod singleflight;
pub mod tunnel;
pub mod wire;

pub use config::{Config, Domain, LogMode, Route};
pub use error::{Error, Result};
pub use paths::{Paths, HTTPS_PORT, HTTP_PORT};
pub use proxy::ProxyServer;
pub use tunnel::{TunnelClient, TunnelOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
