//! Cross-component tests: access log behaviour on disk, upstream probes,
//! the control socket protocol, snapshot swaps, the forwarding path against
//! a live upstream, and the tunnel client against a scripted WebSocket
//! server.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use dotlocal::access_log::AccessLog;
use dotlocal::config::{Config, Domain, LogMode};
use dotlocal::control::{self, IpcServer, Request, RequestKind, Response};
use dotlocal::paths::Paths;
use dotlocal::probe;
use dotlocal::proxy::ProxyServer;
use dotlocal::router::RouteTarget;
use dotlocal::tunnel::{TunnelClient, TunnelOptions};
use dotlocal::wire::{
    decode_frame, encode_frame, RegistrationRequest, RegistrationResponse, WireRequest,
    WireResponse,
};

fn temp_paths() -> (TempDir, Paths) {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    (dir, paths)
}

// ---------------------------------------------------------------------------
// Access log
// ---------------------------------------------------------------------------

#[test]
fn access_log_writes_full_records() {
    let (_dir, paths) = temp_paths();
    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Full).unwrap();

    log.record(
        "myapp.local",
        "GET",
        "/api/items?page=2",
        8080,
        201,
        Duration::from_millis(12),
    );
    log.close();

    let contents = fs::read_to_string(paths.access_log()).unwrap();
    let line = contents.lines().next().unwrap();
    let fields: Vec<&str> = line.split('\t').collect();
    assert_eq!(fields.len(), 7);
    assert_eq!(fields[1], "myapp.local");
    assert_eq!(fields[2], "GET");
    assert_eq!(fields[3], "/api/items?page=2");
    assert_eq!(fields[4], "8080");
    assert_eq!(fields[5], "201");
    assert_eq!(fields[6], "12ms");
}

#[test]
fn access_log_minimal_mode_drops_request_details() {
    let (_dir, paths) = temp_paths();
    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Minimal).unwrap();

    log.record("myapp.local", "GET", "/", 3000, 200, Duration::from_millis(1));
    log.close();

    let contents = fs::read_to_string(paths.access_log()).unwrap();
    let fields: Vec<&str> = contents.lines().next().unwrap().split('\t').collect();
    assert_eq!(fields.len(), 4);
    assert_eq!(fields[1], "myapp.local");
    assert_eq!(fields[2], "200");
}

#[test]
fn access_log_off_mode_writes_nothing() {
    let (_dir, paths) = temp_paths();
    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Off).unwrap();

    log.record("myapp.local", "GET", "/", 3000, 200, Duration::from_millis(1));
    log.close();

    assert!(!paths.access_log().exists());
}

#[test]
fn oversized_log_is_truncated_on_open() {
    let (_dir, paths) = temp_paths();
    fs::create_dir_all(paths.base()).unwrap();
    fs::write(paths.access_log(), vec![b'x'; 11 << 20]).unwrap();

    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Full).unwrap();
    log.close();

    let size = fs::metadata(paths.access_log()).unwrap().len();
    assert!(size < 1024, "oversized log should have been truncated");
}

#[test]
fn overflowing_the_queue_never_blocks() {
    let (_dir, paths) = temp_paths();
    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Full).unwrap();

    let started = Instant::now();
    for i in 0..50_000 {
        log.record(
            "myapp.local",
            "GET",
            "/burst",
            3000,
            200,
            Duration::from_micros(i),
        );
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "record() must stay non-blocking under overflow"
    );
    log.close();
    assert!(paths.access_log().exists());
}

#[test]
fn switching_output_replaces_the_writer() {
    let (_dir, paths) = temp_paths();
    let log = AccessLog::new();
    log.set_output(&paths.access_log(), LogMode::Full).unwrap();
    log.record("a.local", "GET", "/", 1000, 200, Duration::from_millis(1));

    // Re-pointing at the same file with a new mode drains the old writer.
    log.set_output(&paths.access_log(), LogMode::Minimal).unwrap();
    log.record("b.local", "GET", "/", 2000, 200, Duration::from_millis(1));
    log.close();

    let contents = fs::read_to_string(paths.access_log()).unwrap();
    assert!(contents.contains("a.local"));
    assert!(contents.contains("b.local"));
}

// ---------------------------------------------------------------------------
// Upstream probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn probe_detects_listening_and_closed_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(probe::check(port).await);
    // The discard port is essentially never bound on dev machines.
    assert!(!probe::check(9).await);
}

#[tokio::test]
async fn probe_wait_polls_until_the_upstream_arrives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let _ = listener.accept().await;
        }
    });

    probe::wait(port, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn probe_wait_times_out() {
    let started = Instant::now();
    assert!(probe::wait(9, Duration::from_millis(500)).await.is_err());
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn probe_wait_rejects_zero_timeout() {
    assert!(probe::wait(3000, Duration::ZERO).await.is_err());
}

#[tokio::test]
async fn check_many_preserves_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();

    let health = probe::check_many(&[open_port, 9, open_port]).await;
    assert_eq!(health, vec![true, false, true]);
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn serve_test_ipc(paths: &Paths) -> CancellationToken {
    let ipc = IpcServer::bind(paths).unwrap();
    let shutdown = CancellationToken::new();
    let guard = shutdown.clone();
    tokio::spawn(async move {
        ipc.serve(guard, |request: Request| async move {
            match request.kind {
                RequestKind::Status => Response::with_data(json!({
                    "running": true,
                    "pid": std::process::id(),
                    "domains": [],
                })),
                RequestKind::Reload => Response::success(),
                RequestKind::Shutdown => Response::success(),
            }
        })
        .await;
    });
    shutdown
}

#[tokio::test]
async fn control_socket_round_trips_json() {
    let (_dir, paths) = temp_paths();
    let shutdown = serve_test_ipc(&paths).await;

    let response = control::send_request(&paths, &Request::new(RequestKind::Status))
        .await
        .unwrap();
    assert!(response.ok);
    assert_eq!(response.data.unwrap()["running"], true);

    let response = control::send_request(&paths, &Request::new(RequestKind::Reload))
        .await
        .unwrap();
    assert!(response.ok);

    shutdown.cancel();
}

#[tokio::test]
async fn malformed_requests_get_an_error_response() {
    let (_dir, paths) = temp_paths();
    let shutdown = serve_test_ipc(&paths).await;

    let mut stream = UnixStream::connect(paths.socket()).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let response: Response = serde_json::from_str(raw.trim()).unwrap();
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("invalid request"));

    shutdown.cancel();
}

#[tokio::test]
async fn daemon_is_running_only_with_a_live_socket() {
    let (_dir, paths) = temp_paths();

    // No socket file at all.
    assert!(!control::is_running(&paths).await);

    // A stale file at the socket path is not a running daemon.
    fs::create_dir_all(paths.base()).unwrap();
    fs::write(paths.socket(), b"").unwrap();
    assert!(!control::is_running(&paths).await);
    fs::remove_file(paths.socket()).unwrap();

    // A live server answering status is.
    let shutdown = serve_test_ipc(&paths).await;
    assert!(control::is_running(&paths).await);
    control::wait_for_daemon(&paths).await.unwrap();

    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Proxy snapshot + forwarding
// ---------------------------------------------------------------------------

fn proxy_server(paths: &Paths) -> Arc<ProxyServer> {
    let access_log = Arc::new(AccessLog::new());
    Arc::new(ProxyServer::new(paths, access_log, 0, 0).unwrap())
}

#[tokio::test]
async fn apply_config_swaps_table_and_cert_cache() {
    let (_dir, paths) = temp_paths();
    let server = proxy_server(&paths);

    let mut cfg = Config::default();
    cfg.set_domain("api", 8080, vec![]).unwrap();
    server.apply_config(&cfg).unwrap();

    assert!(server.table().contains("api"));
    assert!(server.cert_cache().get("api").is_some());

    // Hot reload: a second domain appears in the next snapshot, with its
    // certificate already issued.
    cfg.set_domain("myapp", 3000, vec![]).unwrap();
    server.apply_config(&cfg).unwrap();

    let table = server.table();
    assert!(table.contains("api") && table.contains("myapp"));
    assert!(server.cert_cache().get("myapp").is_some());
    assert_eq!(server.cert_cache().len(), 2);
}

#[tokio::test]
async fn failed_apply_leaves_the_old_snapshot() {
    let (_dir, paths) = temp_paths();
    let server = proxy_server(&paths);

    let mut cfg = Config::default();
    cfg.set_domain("myapp", 3000, vec![]).unwrap();
    server.apply_config(&cfg).unwrap();

    let bad = Config {
        domains: vec![
            Domain {
                name: "dup".to_owned(),
                port: 1000,
                routes: vec![],
            },
            Domain {
                name: "dup".to_owned(),
                port: 2000,
                routes: vec![],
            },
        ],
        log_mode: LogMode::Full,
    };
    assert!(server.apply_config(&bad).is_err());

    let table = server.table();
    assert!(table.contains("myapp"), "old snapshot must survive");
    assert!(!table.contains("dup"));
    assert!(server.cert_cache().get("myapp").is_some());
}

/// Minimal HTTP/1.1 upstream that captures the request head and replies
/// `201 ok`.
async fn spawn_upstream() -> (u16, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0_u8; 8192];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 201 Created\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    )
                    .await;
            });
        }
    });

    (port, rx)
}

#[tokio::test]
async fn forward_streams_to_the_upstream_with_original_host() {
    let (_dir, paths) = temp_paths();
    let server = proxy_server(&paths);
    let (port, mut heads) = spawn_upstream().await;

    let req = axum::http::Request::builder()
        .method("GET")
        .uri("/health")
        .header("host", "myapp.local")
        .body(axum::body::Body::empty())
        .unwrap();
    let target = RouteTarget {
        port,
        path: "/health".to_owned(),
    };

    let response = server.forward(req, "myapp.local", &target).await.unwrap();
    assert_eq!(response.status(), 201);
    let body = axum::body::to_bytes(response.into_body(), 64).await.unwrap();
    assert_eq!(&body[..], b"ok");

    let head = heads.recv().await.unwrap();
    let head_lower = head.to_lowercase();
    assert!(head_lower.starts_with("get /health http/1.1"));
    assert!(head_lower.contains("host: myapp.local"));
}

#[tokio::test]
async fn forward_surfaces_upstream_connect_failures() {
    let (_dir, paths) = temp_paths();
    let server = proxy_server(&paths);

    let req = axum::http::Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "myapp.local")
        .body(axum::body::Body::empty())
        .unwrap();
    let target = RouteTarget {
        port: 9,
        path: "/".to_owned(),
    };

    let err = server.forward(req, "myapp.local", &target).await.unwrap_err();
    assert!(matches!(err, dotlocal::Error::Upstream(_)));
}

// ---------------------------------------------------------------------------
// Tunnel client
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_serves_frames_and_stops_on_rejected_reregistration() {
    // Local upstream the tunnel dispatches into.
    let (upstream_port, _heads) = spawn_upstream().await;

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection: accept registration, serve one request frame.
        let (stream, _) = ws_listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let registration = ws.next().await.unwrap().unwrap();
        let registration: RegistrationRequest =
            serde_json::from_str(registration.to_text().unwrap()).unwrap();
        assert_eq!(registration.subdomain, "myapp");
        assert_eq!(registration.token, "tok-123");

        let accept = RegistrationResponse {
            ok: true,
            url: "https://myapp.tunnel.test".to_owned(),
            subdomain: "myapp".to_owned(),
            error: String::new(),
        };
        ws.send(Message::text(serde_json::to_string(&accept).unwrap()))
            .await
            .unwrap();

        let request = WireRequest {
            method: "GET".to_owned(),
            uri: "/hello?x=1".to_owned(),
            headers: vec![("accept".to_owned(), "text/plain".to_owned())],
            body: vec![],
        };
        ws.send(Message::binary(encode_frame(42, &request.to_bytes())))
            .await
            .unwrap();

        let frame = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected response frame, got {other:?}"),
            }
        };
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, 42);
        let response = WireResponse::from_bytes(payload).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"ok");

        // Drop the connection to force a reconnect with backoff.
        drop(ws);

        // Second connection: reject the registration, which is terminal.
        let (stream, _) = ws_listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        let reject = RegistrationResponse {
            ok: false,
            url: String::new(),
            subdomain: String::new(),
            error: "subdomain taken".to_owned(),
        };
        ws.send(Message::text(serde_json::to_string(&reject).unwrap()))
            .await
            .unwrap();
        drop(ws);

        // The client must not dial again after a terminal rejection.
        let extra = timeout(Duration::from_secs(3), ws_listener.accept()).await;
        assert!(extra.is_err(), "client reconnected after terminal rejection");
    });

    let served = Arc::new(AtomicUsize::new(0));
    let served_count = served.clone();
    let cancel = CancellationToken::new();
    let client = TunnelClient::new(TunnelOptions {
        server_url: format!("ws://{ws_addr}"),
        token: "tok-123".to_owned(),
        subdomain: "myapp".to_owned(),
        local_port: upstream_port,
        password: String::new(),
        ttl: None,
        on_request: Some(Arc::new(move |event| {
            assert_eq!(event.method, "GET");
            assert_eq!(event.path, "/hello");
            assert_eq!(event.status, 201);
            served_count.fetch_add(1, Ordering::SeqCst);
        })),
    });

    let url = client.connect(cancel.clone()).await.unwrap();
    assert_eq!(url, "https://myapp.tunnel.test");

    timeout(Duration::from_secs(15), server)
        .await
        .expect("scripted tunnel server timed out")
        .unwrap();
    assert_eq!(served.load(Ordering::SeqCst), 1);
    cancel.cancel();
}

#[tokio::test]
async fn tunnel_initial_registration_rejection_is_terminal() {
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        let reject = RegistrationResponse {
            ok: false,
            url: String::new(),
            subdomain: String::new(),
            error: "invalid token".to_owned(),
        };
        ws.send(Message::text(serde_json::to_string(&reject).unwrap()))
            .await
            .unwrap();
    });

    let client = TunnelClient::new(TunnelOptions {
        server_url: format!("ws://{ws_addr}"),
        token: "bad".to_owned(),
        subdomain: "myapp".to_owned(),
        local_port: 3000,
        password: String::new(),
        ttl: None,
        on_request: None,
    });

    let err = client.connect(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_terminal());
    assert!(err.to_string().contains("registration failed"));
    assert!(err.to_string().contains("invalid token"));
}
