//! Daemon supervisor: wires the config store, certificate cache, proxy
//! servers, access log and control socket together and owns their
//! lifecycle. Everything the Go-style "module singleton" would hold lives
//! on values created here and passed down explicitly, so initialization
//! order is visible in one function.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::access_log::AccessLog;
use crate::config::{self, Config};
use crate::control::{self, DomainStatus, IpcServer, RequestKind, RouteStatus, StatusData};
use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::probe;
use crate::proxy::ProxyServer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct IpcContext {
    paths: Paths,
    server: Arc<ProxyServer>,
    access_log: Arc<AccessLog>,
    shutdown: CancellationToken,
}

/// Run the daemon until a signal or a `shutdown` IPC request stops it.
pub async fn run(paths: Paths, http_port: u16, https_port: u16) -> Result<()> {
    let cfg = Config::load(&paths)?;
    cfg.validate()?;

    let access_log = Arc::new(AccessLog::new());
    access_log.set_output(&paths.access_log(), cfg.log_mode)?;

    let server = Arc::new(ProxyServer::new(
        &paths,
        access_log.clone(),
        http_port,
        https_port,
    )?);
    server.apply_config(&cfg)?;
    let listeners = server.bind()?;

    let shutdown = CancellationToken::new();
    let ipc = IpcServer::bind(&paths)?;
    let ctx = Arc::new(IpcContext {
        paths: paths.clone(),
        server: server.clone(),
        access_log: access_log.clone(),
        shutdown: shutdown.clone(),
    });
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            ipc.serve(shutdown, move |request| handle_ipc(ctx.clone(), request))
                .await;
        }
    });

    fs::write(paths.pid_file(), std::process::id().to_string())
        .map_err(|e| Error::config(format!("writing pid file: {e}")))?;

    info!("HTTP  listening on :{http_port} (redirects to HTTPS)");
    info!("HTTPS listening on :{https_port}");
    for domain in &cfg.domains {
        info!("  {}.local → localhost:{}", domain.name, domain.port);
        for route in &domain.routes {
            info!("    {} → localhost:{}", route.path, route.port);
        }
    }

    let http_handle = Handle::new();
    let https_handle = Handle::new();
    let mut serve_task = tokio::spawn(server.clone().serve(
        listeners,
        http_handle.clone(),
        https_handle.clone(),
    ));

    tokio::select! {
        joined = &mut serve_task => {
            let result = flatten_join(joined);
            cleanup(&paths, &access_log);
            return result;
        }
        _ = shutdown.cancelled() => {}
        _ = shutdown_signal() => {}
    }
    shutdown.cancel();

    info!("shutting down");
    http_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    https_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

    let result = match timeout(SHUTDOWN_GRACE + Duration::from_secs(1), &mut serve_task).await {
        Ok(joined) => flatten_join(joined),
        Err(_) => {
            serve_task.abort();
            Ok(())
        }
    };

    cleanup(&paths, &access_log);
    info!("dotlocal stopped");
    result
}

fn cleanup(paths: &Paths, access_log: &AccessLog) {
    access_log.close();
    let _ = fs::remove_file(paths.pid_file());
    let _ = fs::remove_file(paths.socket());
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::config(format!("server task failed: {e}"))),
    }
}

async fn handle_ipc(ctx: Arc<IpcContext>, request: control::Request) -> control::Response {
    match request.kind {
        RequestKind::Shutdown => {
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                // Let the OK response flush before the daemon starts dying.
                sleep(Duration::from_millis(100)).await;
                shutdown.cancel();
            });
            control::Response::success()
        }
        RequestKind::Status => handle_status(&ctx).await,
        RequestKind::Reload => handle_reload(&ctx).await,
    }
}

async fn handle_status(ctx: &IpcContext) -> control::Response {
    let cfg = match Config::load(&ctx.paths) {
        Ok(cfg) => cfg,
        Err(e) => return control::Response::failure(e),
    };

    let mut ports = Vec::new();
    for domain in &cfg.domains {
        ports.push(domain.port);
        for route in &domain.routes {
            ports.push(route.port);
        }
    }
    let health = probe::check_many(&ports).await;
    let mut health = health.into_iter();

    let domains = cfg
        .domains
        .iter()
        .map(|domain| DomainStatus {
            name: domain.name.clone(),
            port: domain.port,
            healthy: health.next().unwrap_or(false),
            routes: domain
                .routes
                .iter()
                .map(|route| RouteStatus {
                    path: route.path.clone(),
                    port: route.port,
                    healthy: health.next().unwrap_or(false),
                })
                .collect(),
        })
        .collect();

    let status = StatusData {
        running: true,
        pid: std::process::id(),
        domains,
    };
    match serde_json::to_value(&status) {
        Ok(data) => control::Response::with_data(data),
        Err(e) => control::Response::failure(e),
    }
}

/// Reload is all-or-nothing: the new routing table and the full certificate
/// map are built before anything is swapped, and the log target is switched
/// only after the swap succeeded.
async fn handle_reload(ctx: &IpcContext) -> control::Response {
    let paths = ctx.paths.clone();
    let server = ctx.server.clone();
    let applied = tokio::task::spawn_blocking(move || -> Result<Config> {
        let cfg = config::with_lock(&paths, || Config::load(&paths))?;
        server.apply_config(&cfg)?;
        Ok(cfg)
    })
    .await;

    let cfg = match applied {
        Ok(Ok(cfg)) => cfg,
        Ok(Err(e)) => {
            error!(error = %e, "reload failed");
            return control::Response::failure(e);
        }
        Err(e) => return control::Response::failure(format!("reload task failed: {e}")),
    };

    if let Err(e) = ctx
        .access_log
        .set_output(&ctx.paths.access_log(), cfg.log_mode)
    {
        return control::Response::failure(e);
    }

    info!(domains = cfg.domains.len(), "config reloaded");
    control::Response::success()
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
