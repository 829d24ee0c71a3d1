//! In-memory hostname → leaf certificate cache and the SNI resolver that
//! feeds rustls during TLS handshakes.
//!
//! The cache is replaced wholesale on reload and refilled lazily on misses.
//! Misses for the same hostname are collapsed through a single-flight group
//! so burst SNI load issues each certificate exactly once; misses for
//! different hostnames proceed in parallel. The cached branch of the
//! resolver does no I/O, and the shared read lock is released before the
//! single-flight call so waiting handshakes cannot deadlock issuance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::ca::CertAuthority;
use crate::error::Result;
use crate::router::{local_stem, RoutingTable};
use crate::singleflight;

pub struct CertCache {
    authority: CertAuthority,
    entries: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    group: singleflight::Group<Arc<CertifiedKey>>,
}

impl CertCache {
    pub fn new(authority: CertAuthority) -> Self {
        Self {
            authority,
            entries: RwLock::new(HashMap::new()),
            group: singleflight::Group::new(),
        }
    }

    pub fn authority(&self) -> &CertAuthority {
        &self.authority
    }

    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.read().get(name).cloned()
    }

    /// Cached certificate, or issue one with at most one issuance in flight
    /// per hostname.
    pub fn get_or_issue(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cert) = self.get(name) {
            return Ok(cert);
        }

        self.group.run(name, || {
            // Another caller may have filled the entry while we waited for
            // leadership of the key.
            if let Some(cert) = self.get(name) {
                return Ok(cert);
            }

            self.authority.ensure_leaf(name)?;
            let cert = self.authority.load_leaf_certified(name)?;
            self.entries.write().insert(name.to_owned(), cert.clone());
            Ok(cert)
        })
    }

    /// Swap the entire cache, used by reload.
    pub fn replace_all(&self, entries: HashMap<String, Arc<CertifiedKey>>) {
        *self.entries.write() = entries;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for CertCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Certificate selection callback for the TLS listener.
///
/// Unknown hostnames abort the handshake by resolving to no certificate;
/// an absent SNI falls back to the first configured domain.
pub struct SniResolver {
    cache: Arc<CertCache>,
    table: Arc<ArcSwap<RoutingTable>>,
}

impl SniResolver {
    pub fn new(cache: Arc<CertCache>, table: Arc<ArcSwap<RoutingTable>>) -> Self {
        Self { cache, table }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let table = self.table.load();

        let name = match client_hello.server_name() {
            None | Some("") => {
                if table.default_hostname().is_empty() {
                    debug!("handshake without SNI and no domains configured");
                    return None;
                }
                table.default_hostname().to_owned()
            }
            Some(sni) => match local_stem(sni) {
                Some(name) => name,
                None => {
                    debug!(sni, "unsupported server name");
                    return None;
                }
            },
        };

        if !table.contains(&name) {
            debug!(host = %format!("{name}.local"), "handshake for unconfigured domain");
            return None;
        }

        if let Some(cert) = self.cache.get(&name) {
            return Some(cert);
        }

        match self.cache.get_or_issue(&name) {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(host = %format!("{name}.local"), error = %e, "certificate issuance failed");
                None
            }
        }
    }
}
