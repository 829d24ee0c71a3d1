//! Control socket: local IPC between the CLI and the daemon over a unix
//! stream socket in the state dir.
//!
//! Framing is one newline-terminated JSON request, one newline-terminated
//! JSON response, then close. Each connection gets its own task and a 30 s
//! deadline; a misbehaving client can only hurt its own connection.
//!
//! Access control is the filesystem: whoever can open the socket path can
//! drive the daemon. The state dir is created by and for the owning user,
//! and no additional peer authentication is performed.

use std::fs;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::paths::Paths;

const CONNECTION_DEADLINE: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STARTUP_POLL_ATTEMPTS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Status,
    Reload,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self { kind, data: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub running: bool,
    pub pid: u32,
    pub domains: Vec<DomainStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStatus {
    pub name: String,
    pub port: u16,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStatus {
    pub path: String,
    pub port: u16,
    pub healthy: bool,
}

pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the control socket, replacing any stale socket file left behind
    /// by a previous run.
    pub fn bind(paths: &Paths) -> Result<IpcServer> {
        let sock_path = paths.socket();
        let _ = fs::remove_file(&sock_path);
        fs::create_dir_all(paths.base())?;

        let listener = UnixListener::bind(&sock_path)
            .map_err(|e| Error::ipc(format!("listening on {}: {e}", sock_path.display())))?;

        Ok(IpcServer { listener })
    }

    /// Accept connections until cancelled. Each connection runs `handler`
    /// for its single request.
    pub async fn serve<H, Fut>(self, shutdown: CancellationToken, handler: H)
    where
        H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "control socket accept failed");
                        return;
                    }
                },
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                if timeout(CONNECTION_DEADLINE, handle_connection(stream, handler))
                    .await
                    .is_err()
                {
                    debug!("control connection hit its deadline");
                }
            });
        }
    }
}

async fn handle_connection<H, Fut>(stream: UnixStream, handler: H)
where
    H: Fn(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();

    let response = match BufReader::new(read_half).read_line(&mut line).await {
        Ok(_) => match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler(request).await,
            Err(e) => Response::failure(format!("invalid request: {e}")),
        },
        Err(e) => Response::failure(format!("reading request: {e}")),
    };

    let mut payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode control response");
            return;
        }
    };
    payload.push(b'\n');
    let _ = write_half.write_all(&payload).await;
    let _ = write_half.shutdown().await;
}

/// Send one request to a running daemon and wait for the response.
pub async fn send_request(paths: &Paths, request: &Request) -> Result<Response> {
    let sock_path = paths.socket();
    let stream = timeout(DIAL_TIMEOUT, UnixStream::connect(&sock_path))
        .await
        .map_err(|_| Error::ipc("timed out connecting to daemon"))?
        .map_err(|e| Error::ipc(format!("connecting to daemon: {e} (is dotlocal running?)")))?;

    let exchange = async {
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_vec(request)
            .map_err(|e| Error::ipc(format!("encoding request: {e}")))?;
        payload.push(b'\n');
        write_half
            .write_all(&payload)
            .await
            .map_err(|e| Error::ipc(format!("sending request: {e}")))?;

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .map_err(|e| Error::ipc(format!("reading response: {e}")))?;

        serde_json::from_str(&line).map_err(|e| Error::ipc(format!("decoding response: {e}")))
    };

    timeout(CONNECTION_DEADLINE, exchange)
        .await
        .map_err(|_| Error::ipc("timed out waiting for daemon response"))?
}

/// The daemon counts as running only when the socket file exists AND a
/// status round-trip succeeds; a stale socket file alone does not.
pub async fn is_running(paths: &Paths) -> bool {
    if !paths.socket().exists() {
        return false;
    }
    matches!(
        send_request(paths, &Request::new(RequestKind::Status)).await,
        Ok(response) if response.ok
    )
}

/// Poll until a freshly started daemon answers status requests.
pub async fn wait_for_daemon(paths: &Paths) -> Result<()> {
    for _ in 0..STARTUP_POLL_ATTEMPTS {
        if is_running(paths).await {
            return Ok(());
        }
        sleep(STARTUP_POLL_INTERVAL).await;
    }
    Err(Error::ipc("daemon failed to start within 5 seconds"))
}
