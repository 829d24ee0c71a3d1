//! Tunnel client: multiplexes remote HTTP requests arriving over one
//! persistent WebSocket into local HTTP calls against a chosen upstream
//! port, and streams the serialized responses back.
//!
//! Connection lifecycle per [`TunnelClient::connect`]:
//!
//! ```text
//! dial → register → read loop ⇄ per-frame dispatch
//!                     │ transport loss → backoff (1s..30s) → dial again
//!                     │ registration rejected → terminal
//!                     └ cancellation → done
//! ```
//!
//! Frame writes share the socket through a mutex so concurrent dispatches
//! cannot interleave partial frames; the local HTTP call itself runs outside
//! any lock. Responses may complete out of order, which is fine because each
//! frame carries its request id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pages;
use crate::wire::{self, RegistrationRequest, RegistrationResponse, WireRequest, WireResponse};

/// Frames up to 10 MiB are accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 10 << 20;

const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Fired once per completed request, for the caller's per-request UI lines.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
}

pub type RequestCallback = Arc<dyn Fn(RequestEvent) + Send + Sync>;

#[derive(Clone)]
pub struct TunnelOptions {
    pub server_url: String,
    pub token: String,
    pub subdomain: String,
    pub local_port: u16,
    pub password: String,
    pub ttl: Option<Duration>,
    pub on_request: Option<RequestCallback>,
}

pub struct TunnelClient {
    opts: TunnelOptions,
}

impl TunnelClient {
    pub fn new(opts: TunnelOptions) -> Self {
        Self { opts }
    }

    /// Dial and register, then keep serving frames in a background task
    /// until `cancel` fires or the server rejects a re-registration.
    /// Returns the public URL assigned by the server.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<String> {
        let (stream, url) = dial(&self.opts, &cancel).await?;

        let opts = self.opts.clone();
        tokio::spawn(async move {
            run(opts, stream, cancel).await;
        });

        Ok(url)
    }
}

async fn dial(opts: &TunnelOptions, cancel: &CancellationToken) -> Result<(WsStream, String)> {
    let config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..WebSocketConfig::default()
    };

    let connect = connect_async_with_config(opts.server_url.as_str(), Some(config), false);
    let (mut stream, _) = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::TunnelTransport("cancelled".to_owned())),
        connected = connect => connected
            .map_err(|e| Error::TunnelTransport(format!("dialing tunnel server: {e}")))?,
    };

    let registration = RegistrationRequest {
        token: opts.token.clone(),
        subdomain: opts.subdomain.clone(),
        password: opts.password.clone(),
        ttl: opts
            .ttl
            .map(|ttl| format!("{}s", ttl.as_secs()))
            .unwrap_or_default(),
    };
    let payload = serde_json::to_string(&registration)
        .map_err(|e| Error::TunnelTransport(format!("encoding registration: {e}")))?;
    stream
        .send(Message::text(payload))
        .await
        .map_err(|e| Error::TunnelTransport(format!("sending registration: {e}")))?;

    let response: RegistrationResponse = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                break serde_json::from_str(&text).map_err(|e| {
                    Error::TunnelTransport(format!("decoding registration response: {e}"))
                })?
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(Error::TunnelTransport(format!(
                    "unexpected message during registration: {other:?}"
                )))
            }
            Some(Err(e)) => {
                return Err(Error::TunnelTransport(format!(
                    "reading registration response: {e}"
                )))
            }
            None => {
                return Err(Error::TunnelTransport(
                    "connection closed during registration".to_owned(),
                ))
            }
        }
    };

    if !response.ok {
        let _ = stream.close(None).await;
        return Err(Error::TunnelRegistration(response.error));
    }

    Ok((stream, response.url))
}

/// Read loop plus reconnection. Returns only on cancellation or a terminal
/// registration rejection.
async fn run(opts: TunnelOptions, mut stream: WsStream, cancel: CancellationToken) {
    let http = match reqwest::Client::builder()
        .timeout(LOCAL_REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "building local HTTP client");
            return;
        }
    };

    let mut backoff = INITIAL_BACKOFF;

    loop {
        let err = match read_messages(&opts, &http, stream, &cancel).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if cancel.is_cancelled() {
            return;
        }
        error!(error = %err, "tunnel connection lost");

        stream = loop {
            if cancel.is_cancelled() {
                return;
            }

            info!("reconnecting in {}s...", backoff.as_secs());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);

            match dial(&opts, &cancel).await {
                Ok((stream, _)) => {
                    info!("reconnected to tunnel server");
                    backoff = INITIAL_BACKOFF;
                    break stream;
                }
                Err(e) if e.is_terminal() => {
                    error!(error = %e, "tunnel registration rejected");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "reconnect failed");
                }
            }
        };
    }
}

/// Serve frames from one connection until it breaks or `cancel` fires.
/// `Ok(())` means cancelled; any transport problem is an `Err` so the caller
/// reconnects.
async fn read_messages(
    opts: &TunnelOptions,
    http: &reqwest::Client,
    stream: WsStream,
    cancel: &CancellationToken,
) -> Result<()> {
    let (sink, mut reader) = stream.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.lock().await.close().await;
                return Ok(());
            }
            message = reader.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(frame))) => {
                let (request_id, payload) = match wire::decode_frame(&frame) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        error!(error = %e, "decoding frame");
                        continue;
                    }
                };
                let request = match WireRequest::from_bytes(payload) {
                    Ok(request) => request,
                    Err(e) => {
                        error!(error = %e, "deserializing request");
                        continue;
                    }
                };

                let opts = opts.clone();
                let http = http.clone();
                let sink = sink.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    dispatch(opts, http, sink, request_id, request, cancel).await;
                });
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = sink.lock().await.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(Error::TunnelTransport(format!(
                    "server closed connection: {frame:?}"
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::TunnelTransport(e.to_string())),
            None => {
                return Err(Error::TunnelTransport(
                    "connection closed unexpectedly".to_owned(),
                ))
            }
        }
    }
}

/// Forward one remote request to the local upstream and frame the response
/// back with the same request id.
async fn dispatch(
    opts: TunnelOptions,
    http: reqwest::Client,
    sink: WsSink,
    request_id: u32,
    request: WireRequest,
    cancel: CancellationToken,
) {
    let started = Instant::now();

    let url = format!("http://localhost:{}{}", opts.local_port, request.uri);
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(e) => {
            error!(method = %request.method, error = %e, "invalid method in tunnel frame");
            return;
        }
    };

    let mut builder = http.request(method, &url);
    for (name, value) in &request.headers {
        // Host and Content-Length are derived from the local URL and body.
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        sent = builder.send() => sent,
    };

    let response = match outcome {
        Ok(upstream) => {
            let status = upstream.status();
            let mut headers: Vec<(String, String)> = upstream
                .headers()
                .iter()
                .filter(|(name, _)| {
                    !name.as_str().eq_ignore_ascii_case("transfer-encoding")
                        && !name.as_str().eq_ignore_ascii_case("content-length")
                })
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            let body = tokio::select! {
                _ = cancel.cancelled() => return,
                body = upstream.bytes() => match body {
                    Ok(body) => body.to_vec(),
                    Err(e) => {
                        error!(error = %e, "reading local response body");
                        return;
                    }
                },
            };
            headers.push(("content-length".to_owned(), body.len().to_string()));

            WireResponse {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_owned(),
                headers,
                body,
            }
        }
        Err(e) => {
            error!(port = opts.local_port, error = %e, "forwarding to local upstream");
            error_response(opts.local_port)
        }
    };

    let status = response.status;
    let frame = wire::encode_frame(request_id, &response.to_bytes());
    if let Err(e) = sink.lock().await.send(Message::binary(frame)).await {
        error!(error = %e, "writing response frame");
        return;
    }

    if let Some(on_request) = &opts.on_request {
        on_request(RequestEvent {
            method: request.method.clone(),
            path: request.path().to_owned(),
            status,
            duration: started.elapsed(),
        });
    }
    debug!(
        method = %request.method,
        path = %request.path(),
        status,
        "tunnel request served"
    );
}

fn error_response(port: u16) -> WireResponse {
    let body = pages::tunnel_unreachable(port).into_bytes();
    WireResponse {
        status: 502,
        reason: "Bad Gateway".to_owned(),
        headers: vec![
            ("content-type".to_owned(), "text/html; charset=utf-8".to_owned()),
            ("content-length".to_owned(), body.len().to_string()),
        ],
        body,
    }
}
