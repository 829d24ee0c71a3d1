//! Persisted daemon configuration: the list of `.local` domains with their
//! upstream ports and optional path routes, plus the access-log mode.
//!
//! The config is a human-editable YAML document. Reads and writes from
//! outside the daemon must go through [`with_lock`], which serializes
//! read-modify-write cycles on an advisory flock taken on a sibling
//! `config.lock` file. Saving is atomic (temp file + rename) so a crashed
//! writer can never leave a half-written document behind.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::LazyLock;

use nix::fcntl::{flock, FlockArg};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::Paths;

static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("valid pattern"));

const MAX_NAME_LEN: usize = 63;

/// Access-log verbosity, switchable on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Full,
    Minimal,
    Off,
}

impl LogMode {
    pub fn parse(mode: &str) -> Result<LogMode> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(LogMode::Full),
            "minimal" => Ok(LogMode::Minimal),
            "off" => Ok(LogMode::Off),
            other => Err(Error::validation(format!(
                "invalid log mode {other:?}: must be one of full|minimal|off"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogMode::Full => "full",
            LogMode::Minimal => "minimal",
            LogMode::Off => "off",
        }
    }
}

/// A path-prefix sub-route inside a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub domains: Vec<Domain>,
    pub log_mode: LogMode,
}

pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("domain name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "domain name {name:?} is too long: must be {MAX_NAME_LEN} characters or fewer"
        )));
    }
    if !VALID_NAME.is_match(name) {
        return Err(Error::validation(format!(
            "invalid domain name {name:?}: must be lowercase alphanumeric with hyphens"
        )));
    }
    Ok(())
}

/// Port validation at the untrusted boundary, where out-of-range values can
/// still be represented.
pub fn validate_port(port: i64) -> Result<u16> {
    if !(1..=65535).contains(&port) {
        return Err(Error::validation(format!(
            "invalid port {port}: must be between 1 and 65535"
        )));
    }
    Ok(port as u16)
}

pub fn validate_route(path: &str, port: u16) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::validation(format!(
            "invalid route path {path:?}: must start with /"
        )));
    }
    validate_port(i64::from(port))?;
    Ok(())
}

pub fn validate_domain(name: &str, port: u16) -> Result<()> {
    validate_hostname(name)?;
    validate_port(i64::from(port))?;
    Ok(())
}

impl Config {
    /// Load the config from disk. A missing file is an empty config.
    pub fn load(paths: &Paths) -> Result<Config> {
        let path = paths.config();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(Error::config(format!("reading {}: {e}", path.display()))),
        };
        serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))
    }

    /// Write the config atomically: serialize to a temp file in the same
    /// directory, then rename over the destination.
    pub fn save(&self, paths: &Paths) -> Result<()> {
        fs::create_dir_all(paths.base())
            .map_err(|e| Error::config(format!("creating config dir: {e}")))?;

        let data = serde_yaml::to_string(self)
            .map_err(|e| Error::config(format!("serializing config: {e}")))?;

        let path = paths.config();
        let tmp = path.with_extension("yaml.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| Error::config(format!("writing {}: {e}", tmp.display())))?;
        file.write_all(data.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::config(format!("writing {}: {e}", tmp.display())))?;
        drop(file);

        fs::rename(&tmp, &path)
            .map_err(|e| Error::config(format!("renaming into {}: {e}", path.display())))
    }

    /// Structural validation, also run before a reload is applied.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for domain in &self.domains {
            validate_domain(&domain.name, domain.port)?;
            if !seen.insert(domain.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate domain {}.local",
                    domain.name
                )));
            }
            for route in &domain.routes {
                validate_route(&route.path, route.port)?;
            }
        }
        Ok(())
    }

    pub fn find_domain(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Add a domain, or replace the port and routes of an existing one.
    pub fn set_domain(&mut self, name: &str, port: u16, routes: Vec<Route>) -> Result<()> {
        validate_domain(name, port)?;
        for route in &routes {
            validate_route(&route.path, route.port)?;
        }
        if let Some(existing) = self.domains.iter_mut().find(|d| d.name == name) {
            existing.port = port;
            existing.routes = routes;
        } else {
            self.domains.push(Domain {
                name: name.to_owned(),
                port,
                routes,
            });
        }
        Ok(())
    }

    pub fn remove_domain(&mut self, name: &str) -> Result<()> {
        let before = self.domains.len();
        self.domains.retain(|d| d.name != name);
        if self.domains.len() == before {
            return Err(Error::validation(format!("domain {name}.local not found")));
        }
        Ok(())
    }
}

/// Run `f` while holding an exclusive advisory lock on the config lockfile.
///
/// This is the only sanctioned way to perform a read-modify-write of the
/// config from outside the daemon; the daemon's reload path uses it too.
pub fn with_lock<T>(paths: &Paths, f: impl FnOnce() -> Result<T>) -> Result<T> {
    fs::create_dir_all(paths.base())
        .map_err(|e| Error::config(format!("creating config dir: {e}")))?;

    let lock_path = paths.config_lock();
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::config(format!("opening lock file: {e}")))?;

    flock(file.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|e| Error::config(format!("acquiring config lock: {e}")))?;

    let out = f();

    let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
    out
}
