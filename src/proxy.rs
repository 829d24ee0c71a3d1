//! TLS acceptor and HTTP request pipeline.
//!
//! Two listeners are bound up front: a plain-HTTP listener that permanently
//! redirects to HTTPS, and the TLS listener that selects certificates per
//! handshake through the SNI resolver. Requests are routed by normalized
//! Host to a per-domain router, then streamed to `localhost:<port>` over a
//! shared connection pool tuned for long-lived dev-server connections.
//! WebSocket upgrades are bridged byte-for-byte, upstream failures render a
//! self-refreshing 502 page, and every completed request lands in the
//! access log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Host, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::access_log::AccessLog;
use crate::ca::CertAuthority;
use crate::cert_cache::{CertCache, SniResolver};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pages;
use crate::paths::Paths;
use crate::router::{local_stem, normalize_host, RouteTarget, RoutingTable};

/// Idle connections kept per upstream; dev servers hold few hosts, so the
/// per-host pool is what matters.
const UPSTREAM_POOL_MAX_IDLE_PER_HOST: usize = 128;
/// Long idle timeout keeps HMR and WebSocket-adjacent keepalives warm.
const UPSTREAM_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Listeners {
    pub http: std::net::TcpListener,
    pub https: std::net::TcpListener,
}

pub struct ProxyServer {
    table: Arc<ArcSwap<RoutingTable>>,
    cert_cache: Arc<CertCache>,
    access_log: Arc<AccessLog>,
    client: Client<HttpConnector, Body>,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
}

impl ProxyServer {
    /// Create the server and make sure the root CA exists. Leaf issuance
    /// happens in [`apply_config`](Self::apply_config) and on SNI misses.
    pub fn new(
        paths: &Paths,
        access_log: Arc<AccessLog>,
        http_port: u16,
        https_port: u16,
    ) -> Result<Self> {
        let authority = CertAuthority::new(paths.clone());
        authority.ensure_root()?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(UPSTREAM_POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(UPSTREAM_POOL_IDLE_TIMEOUT)
            .build_http();

        Ok(Self {
            table: Arc::new(ArcSwap::from_pointee(RoutingTable::default())),
            cert_cache: Arc::new(CertCache::new(authority)),
            access_log,
            client,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            https_addr: SocketAddr::from(([0, 0, 0, 0], https_port)),
        })
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn cert_cache(&self) -> &Arc<CertCache> {
        &self.cert_cache
    }

    /// Build the routing table and the complete certificate map for `cfg`,
    /// then swap both in atomically. Any failure leaves the previous
    /// snapshot and cache untouched.
    pub fn apply_config(&self, cfg: &Config) -> Result<()> {
        cfg.validate()?;

        let table = RoutingTable::build(cfg);
        let authority = self.cert_cache.authority();
        let mut certs = HashMap::with_capacity(cfg.domains.len());
        for domain in &cfg.domains {
            authority.ensure_leaf(&domain.name)?;
            certs.insert(
                domain.name.clone(),
                authority.load_leaf_certified(&domain.name)?,
            );
        }

        self.table.store(Arc::new(table));
        self.cert_cache.replace_all(certs);
        Ok(())
    }

    /// Bind both listeners. Either failure is fatal for startup; a bound
    /// peer is dropped (closed) before the error returns.
    pub fn bind(&self) -> Result<Listeners> {
        let http = std::net::TcpListener::bind(self.http_addr).map_err(|e| Error::Bind {
            addr: self.http_addr.to_string(),
            source: e,
        })?;
        let https = match std::net::TcpListener::bind(self.https_addr) {
            Ok(listener) => listener,
            Err(e) => {
                drop(http);
                return Err(Error::Bind {
                    addr: self.https_addr.to_string(),
                    source: e,
                });
            }
        };
        http.set_nonblocking(true)?;
        https.set_nonblocking(true)?;
        Ok(Listeners { http, https })
    }

    /// Run both servers until their shutdown handles fire.
    pub async fn serve(
        self: Arc<Self>,
        listeners: Listeners,
        http_handle: Handle,
        https_handle: Handle,
    ) -> Result<()> {
        let https_port = self.https_addr.port();
        let redirect_app = Router::new()
            .fallback(redirect_handler)
            .with_state(https_port);
        let proxy_app = Router::new()
            .fallback(proxy_handler)
            .with_state(self.clone());

        let tls_config = RustlsConfig::from_config(self.tls_server_config()?);

        let http_server = axum_server::from_tcp(listeners.http)
            .handle(http_handle)
            .serve(redirect_app.into_make_service());
        let https_server = axum_server::from_tcp_rustls(listeners.https, tls_config)
            .handle(https_handle)
            .serve(proxy_app.into_make_service());

        let (http_result, https_result) = tokio::join!(http_server, https_server);
        http_result?;
        https_result?;
        Ok(())
    }

    fn tls_server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let resolver = Arc::new(SniResolver::new(self.cert_cache.clone(), self.table.clone()));
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::certificate(format!("tls config: {e}")))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    /// Forward one request to `localhost:<target.port>`, bridging the
    /// connection when the upstream accepts a protocol upgrade.
    pub async fn forward(
        &self,
        mut req: Request,
        raw_host: &str,
        target: &RouteTarget,
    ) -> Result<Response> {
        let query = req
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let uri: Uri = format!("http://localhost:{}{}{}", target.port, target.path, query)
            .parse()
            .map_err(|e| Error::upstream(format!("building upstream uri: {e}")))?;

        let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let upgrade_protocol = req.headers().get(header::UPGRADE).cloned();

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        strip_hop_by_hop(&mut parts.headers);
        // Host passes through unchanged; no forwarding headers are added.
        if let Ok(value) = HeaderValue::from_str(raw_host) {
            parts.headers.insert(header::HOST, value);
        }
        if let (Some(protocol), Some(_)) = (&upgrade_protocol, &client_upgrade) {
            parts.headers.insert(header::UPGRADE, protocol.clone());
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        }

        let mut upstream_response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        if upstream_response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
                tokio::spawn(async move {
                    let upstream_io = match upstream_upgrade.await {
                        Ok(io) => io,
                        Err(e) => {
                            debug!(error = %e, "upstream upgrade failed");
                            return;
                        }
                    };
                    let client_io = match client_upgrade.await {
                        Ok(io) => io,
                        Err(e) => {
                            debug!(error = %e, "client upgrade failed");
                            return;
                        }
                    };
                    let mut upstream_io = TokioIo::new(upstream_io);
                    let mut client_io = TokioIo::new(client_io);
                    let _ =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await;
                });
            }
        }

        Ok(upstream_response.map(Body::new))
    }
}

async fn proxy_handler(
    State(server): State<Arc<ProxyServer>>,
    Host(raw_host): Host,
    req: Request,
) -> Response {
    let started = Instant::now();
    let host = normalize_host(&raw_host);

    let Some(name) = local_stem(&host) else {
        return html_response(StatusCode::NOT_FOUND, pages::not_found(&host));
    };

    let table = server.table();
    let Some(router) = table.router(&name) else {
        return html_response(StatusCode::NOT_FOUND, pages::not_found(&host));
    };

    let origin = req.headers().get(header::ORIGIN).cloned();
    if let Some(origin) = &origin {
        if req.method() == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            set_cors_headers(response.headers_mut(), origin);
            return response;
        }
    }

    let method = req.method().to_string();
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let target = router.match_route(req.uri().path());

    let mut response = match server.forward(req, &raw_host, &target).await {
        Ok(response) => response,
        Err(e) => {
            warn!(host = %host, port = target.port, error = %e, "upstream request failed");
            html_response(
                StatusCode::BAD_GATEWAY,
                pages::upstream_down(&host, target.port),
            )
        }
    };

    if let Some(origin) = &origin {
        set_cors_headers(response.headers_mut(), origin);
    }

    server.access_log.record(
        &host,
        &method,
        &request_uri,
        target.port,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

/// Plain-HTTP side: a permanent redirect onto the TLS listener.
async fn redirect_handler(State(https_port): State<u16>, Host(host): Host, uri: Uri) -> Response {
    let host = normalize_host(&host);
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = if https_port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    };

    match HeaderValue::from_str(&target) {
        Ok(location) => {
            let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
            response.headers_mut().insert(header::LOCATION, location);
            response
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Permissive CORS for browsers talking across `.local` origins.
fn set_cors_headers(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Accept, Authorization, Content-Type, X-Requested-With"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}

fn html_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )],
        body,
    )
        .into_response()
}
