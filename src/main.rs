//! Smartproxy - Entry Point
//!
//! Starts the forward proxy with graceful shutdown support. Also exposes two
//! one-shot utility modes: `--suffix` to inspect how a host classifies
//! against the public suffix list, and `--reload` to ask a running instance
//! to re-read its config file.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod domain;
mod error;
mod proxy;
mod util;

use config::Config;
use domain::{DomainClassifier, PslClassifier};
use error::ProxyError;
use proxy::{BlockCache, DirectTransport, ProxyContext, Server, SshConnector, TunnelManager};

#[derive(Parser, Debug)]
#[command(name = "smartproxy", about = "Forward proxy that tunnels blocklisted hosts over SSH")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the registrable domain and public suffix for HOST, then exit
    #[arg(long, value_name = "HOST")]
    suffix: Option<String>,

    /// Ask a running instance to reload its config file, then exit
    #[arg(long)]
    reload: bool,
}

fn default_config_path() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config/smartproxy.json"),
        Err(_) => PathBuf::from("smartproxy.json"),
    }
}

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartproxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Some(host) = &cli.suffix {
        let classifier = PslClassifier;
        println!(
            "domain: {}",
            classifier.registrable_domain(host).as_deref().unwrap_or("<none>")
        );
        println!(
            "suffix: {}",
            classifier.public_suffix(host).as_deref().unwrap_or("<none>")
        );
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;
    info!("Configuration loaded from {}", config_path.display());

    if cli.reload {
        return request_reload(&config.local_address).await;
    }

    // Establish the backend session before serving so an unreachable or
    // misconfigured backend surfaces at startup.
    let connector = Arc::new(SshConnector::from_config(&config)?);
    let tunnel = Arc::new(TunnelManager::new(connector));
    tunnel.ensure_connected().await?;
    info!("SSH backend session established");

    let direct = Arc::new(DirectTransport::new(config.proxy_timeout()));
    let block = BlockCache::new(Arc::new(PslClassifier));
    let ctx = Arc::new(ProxyContext::new(
        config_path,
        config,
        block,
        direct,
        tunnel,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Server::new(ctx);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(server_task);

    info!("Smartproxy stopped");
    Ok(())
}

/// One-shot `GET /reload` against a running instance on `addr`.
async fn request_reload(addr: &str) -> error::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("reload connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri("/reload")
        .header(hyper::header::HOST, addr)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProxyError::Http(e.to_string()))?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    println!("{}", String::from_utf8_lossy(&body));

    if status.is_success() {
        Ok(())
    } else {
        Err(ProxyError::Http(format!("reload returned {}", status)))
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
