#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::single_match_else)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dotlocal::access_log::format_duration;
use dotlocal::control::{self, Request, RequestKind};
use dotlocal::paths::{Paths, HTTPS_PORT, HTTP_PORT};
use dotlocal::tunnel::{RequestEvent, TunnelClient, TunnelOptions};
use dotlocal::{daemon, probe};

/// dotlocal - HTTPS for your local dev servers
#[derive(Parser, Debug)]
#[command(name = "dotlocal")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory (default: ~/.dotlocal)
    #[arg(long, env = "DOTLOCAL_HOME", global = true)]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DOTLOCAL_LOG_LEVEL", global = true)]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "DOTLOCAL_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy daemon in the foreground (default)
    Run {
        /// HTTP listen port
        #[arg(long, default_value_t = HTTP_PORT)]
        http_port: u16,

        /// HTTPS listen port
        #[arg(long, default_value_t = HTTPS_PORT)]
        https_port: u16,
    },

    /// Query the running daemon for its status
    Status,

    /// Ask the running daemon to reload its config
    Reload,

    /// Stop the running daemon
    Stop,

    /// Wait until a local upstream port accepts connections
    Wait {
        /// Upstream port to wait for
        port: u16,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Expose a local port through a public tunnel
    Tunnel {
        /// Local port to forward tunnel traffic to
        #[arg(short, long)]
        port: u16,

        /// Subdomain to request from the tunnel server
        #[arg(short, long)]
        subdomain: String,

        /// Tunnel server WebSocket URL
        #[arg(
            long,
            env = "DOTLOCAL_TUNNEL_URL",
            default_value = "wss://tunnel.dotlocal.dev/connect"
        )]
        server_url: String,

        /// Account token
        #[arg(long, env = "DOTLOCAL_TOKEN", default_value = "")]
        token: String,

        /// Password-protect the public URL
        #[arg(long, default_value = "")]
        password: String,

        /// Tunnel time-to-live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS use.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs)?;

    let paths = match &cli.state_dir {
        Some(dir) => Paths::new(dir.clone()),
        None => Paths::from_env()?,
    };

    match cli.command.unwrap_or(Command::Run {
        http_port: HTTP_PORT,
        https_port: HTTPS_PORT,
    }) {
        Command::Run {
            http_port,
            https_port,
        } => {
            info!("starting dotlocal v{}", env!("CARGO_PKG_VERSION"));
            daemon::run(paths, http_port, https_port).await?;
        }

        Command::Status => {
            let response = control::send_request(&paths, &Request::new(RequestKind::Status)).await?;
            if !response.ok {
                anyhow::bail!(response.error.unwrap_or_else(|| "status failed".to_owned()));
            }
            let data = response.data.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Command::Reload => {
            let response = control::send_request(&paths, &Request::new(RequestKind::Reload)).await?;
            if !response.ok {
                anyhow::bail!(response.error.unwrap_or_else(|| "reload failed".to_owned()));
            }
            info!("daemon reloaded");
        }

        Command::Stop => {
            let response =
                control::send_request(&paths, &Request::new(RequestKind::Shutdown)).await?;
            if !response.ok {
                anyhow::bail!(response.error.unwrap_or_else(|| "shutdown failed".to_owned()));
            }
            info!("daemon stopping");
        }

        Command::Wait { port, timeout } => {
            probe::wait(port, Duration::from_secs(timeout)).await?;
            info!("localhost:{port} is up");
        }

        Command::Tunnel {
            port,
            subdomain,
            server_url,
            token,
            password,
            ttl,
        } => {
            let client = TunnelClient::new(TunnelOptions {
                server_url,
                token,
                subdomain,
                local_port: port,
                password,
                ttl: ttl.map(Duration::from_secs),
                on_request: Some(Arc::new(|event: RequestEvent| {
                    info!(
                        "{} {} → {} ({})",
                        event.method,
                        event.path,
                        event.status,
                        format_duration(event.duration)
                    );
                })),
            });

            let cancel = CancellationToken::new();
            let url = client.connect(cancel.clone()).await?;
            info!("tunnel up: {url} → localhost:{port}");
            info!("press Ctrl+C to stop");

            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            info!("tunnel closed");
        }
    }

    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}
