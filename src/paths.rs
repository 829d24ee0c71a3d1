//! On-disk layout of the dotlocal state directory.
//!
//! Everything the daemon persists lives under one base directory
//! (`~/.dotlocal` unless overridden). All path derivation goes through
//! [`Paths`] so the layout is defined in exactly one place and can be pointed
//! at a temp directory in tests.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Conventional listen port for the plain-HTTP redirector.
pub const HTTP_PORT: u16 = 10080;
/// Conventional listen port for the TLS listener.
pub const HTTPS_PORT: u16 = 10443;

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default state directory: `$HOME/.dotlocal`.
    pub fn from_env() -> Result<Self> {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| Error::config("cannot determine home directory (HOME is unset)"))?;
        Ok(Self::new(home.join(".dotlocal")))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    pub fn config_lock(&self) -> PathBuf {
        self.base.join("config.lock")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.base.join("ca")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.ca_dir().join("rootCA.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.ca_dir().join("rootCA-key.pem")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.base.join("certs")
    }

    pub fn leaf_cert(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{name}.pem"))
    }

    pub fn leaf_key(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{name}-key.pem"))
    }

    pub fn access_log(&self) -> PathBuf {
        self.base.join("access.log")
    }

    pub fn socket(&self) -> PathBuf {
        self.base.join("dotlocal.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base.join("dotlocal.pid")
    }
}
