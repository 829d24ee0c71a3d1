//! Immutable routing snapshot derived from the config.
//!
//! A [`RoutingTable`] is built once per (re)load and published through an
//! atomic pointer swap; in-flight requests keep using the snapshot they
//! captured at entry. Each domain resolves a request path to an upstream
//! port by longest-prefix match over its sorted sub-routes, falling back to
//! the domain's default port.

use std::collections::HashMap;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRoute {
    pub prefix: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct DomainRouter {
    pub default_port: u16,
    /// Sorted by prefix length, longest first.
    pub path_routes: Vec<PathRoute>,
}

/// Where a request should be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub port: u16,
    /// Path to forward upstream; sub-routes have their prefix stripped.
    pub path: String,
}

impl DomainRouter {
    /// A prefix matches when the path equals it exactly or continues with a
    /// `/` right after it, so `/api` never captures `/apikeys`.
    pub fn match_route(&self, path: &str) -> RouteTarget {
        for route in &self.path_routes {
            let matches = path == route.prefix
                || (path.starts_with(route.prefix.as_str())
                    && path.as_bytes().get(route.prefix.len()) == Some(&b'/'));
            if matches {
                let rest = &path[route.prefix.len()..];
                let forward = if rest.is_empty() { "/" } else { rest };
                return RouteTarget {
                    port: route.port,
                    path: forward.to_owned(),
                };
            }
        }
        RouteTarget {
            port: self.default_port,
            path: path.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    by_name: HashMap<String, DomainRouter>,
    default_hostname: String,
}

impl RoutingTable {
    /// Deterministic build from a config snapshot.
    pub fn build(cfg: &Config) -> RoutingTable {
        let mut by_name = HashMap::with_capacity(cfg.domains.len());
        let mut default_hostname = String::new();

        for (i, domain) in cfg.domains.iter().enumerate() {
            if i == 0 {
                default_hostname = domain.name.clone();
            }

            let mut path_routes: Vec<PathRoute> = domain
                .routes
                .iter()
                .map(|r| PathRoute {
                    prefix: r.path.clone(),
                    port: r.port,
                })
                .collect();
            path_routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

            by_name.insert(
                domain.name.clone(),
                DomainRouter {
                    default_port: domain.port,
                    path_routes,
                },
            );
        }

        RoutingTable {
            by_name,
            default_hostname,
        }
    }

    pub fn router(&self, name: &str) -> Option<&DomainRouter> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// First configured hostname, used when a TLS client sends no SNI.
    pub fn default_hostname(&self) -> &str {
        &self.default_hostname
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

/// Normalize a Host header value: lowercase, trim whitespace and trailing
/// dots, strip a port suffix and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    let mut host = host.trim().to_ascii_lowercase();
    while host.ends_with('.') {
        host.pop();
    }

    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            host = rest[..end].to_owned();
        }
    } else if host.bytes().filter(|&b| b == b':').count() == 1 {
        if let Some(idx) = host.rfind(':') {
            host.truncate(idx);
        }
    }

    while host.ends_with('.') {
        host.pop();
    }
    host
}

/// Extract the `<name>` from a `<name>.local` host, if that is what it is.
pub fn local_stem(host: &str) -> Option<String> {
    let host = normalize_host(host);
    let name = host.strip_suffix(".local")?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_host_variants() {
        assert_eq!(normalize_host("MyApp.Local"), "myapp.local");
        assert_eq!(normalize_host("myapp.local."), "myapp.local");
        assert_eq!(normalize_host("myapp.local:10443"), "myapp.local");
        assert_eq!(normalize_host(" myapp.local "), "myapp.local");
        assert_eq!(normalize_host("[::1]:10443"), "::1");
    }

    #[test]
    fn local_stem_extraction() {
        assert_eq!(local_stem("myapp.local"), Some("myapp".to_owned()));
        assert_eq!(local_stem("MyApp.LOCAL:10443"), Some("myapp".to_owned()));
        assert_eq!(local_stem("example.com"), None);
        assert_eq!(local_stem(".local"), None);
    }
}
