//! TurnX - Entry Point
//!
//! CLI for the TURN tunnel: fetch `turnx://` URLs, run raw RPC calls and
//! pokes, and start the companion relay.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use turnx::companion::CompanionServer;
use turnx::http::{HttpMessage, HttpRequest, TunnelFetch};
use turnx::{Config, Gatherer, TunnelRpc, TurnGatherer, VERSION};

/// TurnX - HTTP over TURN relay candidate negotiation
#[derive(Parser)]
#[command(name = "turnx")]
#[command(version = VERSION)]
#[command(about = "Request/response tunnel through TURN relay negotiation")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a turnx:// URL through the tunnel
    Fetch {
        /// URL such as turnx://relay.example:3478/path
        url: String,
        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Extra request header, "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Request body
        #[arg(short, long)]
        data: Option<String>,
        /// Print the status line and headers before the body
        #[arg(short, long)]
        include: bool,
    },
    /// Send a text payload through the tunnel RPC and print the reply
    Call {
        /// TURN server (host:port); defaults to tunnel.server
        #[arg(short, long)]
        server: Option<String>,
        payload: String,
    },
    /// Send a single raw command, e.g. "s:12", and print the reply bytes
    Poke {
        /// TURN server (host:port); defaults to tunnel.server
        #[arg(short, long)]
        server: Option<String>,
        command: String,
    },
    /// Start the companion relay and keep it running
    Serve {
        /// HTTP(S) target the relay forwards to; defaults to companion.target
        #[arg(short, long)]
        target: Option<String>,
        /// UDP port to listen on; defaults to companion.port
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory holding the relay binaries (repeatable)
        #[arg(long = "bin-dir")]
        bin_dirs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(cli.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    turnx::util::init_tracing(&config.logging)?;

    match cli.command {
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            include,
        } => fetch(&config, url, method, headers, data, include).await,
        Commands::Call { server, payload } => call(&config, server, payload).await,
        Commands::Poke { server, command } => poke(&config, server, command).await,
        Commands::Serve {
            target,
            port,
            bin_dirs,
        } => serve(config, target, port, bin_dirs).await,
    }
}

fn rpc(config: &Config) -> TunnelRpc {
    let gatherer: Arc<dyn Gatherer> = Arc::new(TurnGatherer::new());
    TunnelRpc::new(gatherer, config.tunnel.rpc_options())
}

fn server_or_default(config: &Config, server: Option<String>) -> Result<String> {
    server
        .or_else(|| config.tunnel.server.clone())
        .context("No TURN server given: pass --server or set tunnel.server")
}

async fn fetch(
    config: &Config,
    url: String,
    method: String,
    headers: Vec<String>,
    data: Option<String>,
    include: bool,
) -> Result<()> {
    let mut request = HttpRequest::get(&url)?;
    request.method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid method {:?}", method))?;
    for header in &headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Invalid header {:?}, expected \"Name: value\"", header))?;
        request = request.header(name.trim(), value.trim())?;
    }
    if let Some(body) = data {
        request = request.with_body(body);
    }

    let response = TunnelFetch::new(rpc(config))
        .fetch(request)
        .await
        .with_context(|| format!("Fetch of {} failed", url))?;
    info!(status = response.status.as_u16(), len = response.body.len(), "response received");

    let mut stdout = std::io::stdout().lock();
    if include {
        writeln!(stdout, "{}", response.start_line())?;
        for (name, value) in &response.headers {
            writeln!(stdout, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()))?;
        }
        writeln!(stdout)?;
    }
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}

async fn call(config: &Config, server: Option<String>, payload: String) -> Result<()> {
    let server = server_or_default(config, server)?;
    let reply = rpc(config)
        .call_text(&server, &payload)
        .await
        .with_context(|| format!("Call through {} failed", server))?;
    println!("{}", reply);
    Ok(())
}

async fn poke(config: &Config, server: Option<String>, command: String) -> Result<()> {
    let server = server_or_default(config, server)?;
    let reply = rpc(config)
        .poker()
        .poke(&server, &command)
        .await
        .with_context(|| format!("Poke {:?} through {} failed", command, server))?;
    let hex: Vec<String> = reply.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{} ({} bytes)", hex.join(" "), reply.len());
    Ok(())
}

async fn serve(
    mut config: Config,
    target: Option<String>,
    port: Option<u16>,
    bin_dirs: Vec<PathBuf>,
) -> Result<()> {
    let target = target
        .or_else(|| config.companion.target.clone())
        .context("No relay target given: pass --target or set companion.target")?;
    if let Some(port) = port {
        config.companion.port = port;
    }
    if !bin_dirs.is_empty() {
        config.companion.bin_dirs = bin_dirs;
    }

    info!(version = VERSION, target = %target, "Starting companion relay");
    let mut server = CompanionServer::start(&config.companion, &target)
        .await
        .context("Failed to start companion relay")?;
    println!("{}{}", turnx::companion::LISTEN_PREFIX, server.port());

    tokio::select! {
        status = server.wait() => {
            let status = status.context("Failed to wait for companion relay")?;
            error!(%status, "Companion relay exited");
            anyhow::bail!("companion relay exited with {}", status);
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping relay...");
            server.kill().await.context("Failed to stop companion relay")?;
        }
    }

    info!("Relay stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
