//! Proxy server entry point.
//!
//! Accepts client connections, classifies each request (CONNECT,
//! absolute-URI HTTP, or the local `/reload` control path), consults the
//! block cache for the route, and dispatches to the engine with the chosen
//! transport. A direct-dial timeout triggers one retry through the tunnel.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{Config, Mode};
use crate::error::{ProxyError, Result};
use crate::proxy::block::BlockCache;
use crate::proxy::engine::{error_response, ConnectServed, ProxyEngine, Served};
use crate::proxy::transport::Transport;
use crate::util::remove_hop_headers;

/// Shared per-process proxy state: the hot-reloadable config snapshot, the
/// block cache, and the two transports. Explicitly constructed and passed
/// around; there are no ambient globals.
pub struct ProxyContext {
    config_path: PathBuf,
    config: ArcSwap<Config>,
    block: BlockCache,
    direct: Arc<dyn Transport>,
    tunnel: Arc<dyn Transport>,
    engine: ProxyEngine,
}

impl ProxyContext {
    pub fn new(
        config_path: PathBuf,
        config: Config,
        block: BlockCache,
        direct: Arc<dyn Transport>,
        tunnel: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config_path,
            config: ArcSwap::from_pointee(config),
            block,
            direct,
            tunnel,
            engine: ProxyEngine,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    fn route(&self, use_tunnel: bool) -> &dyn Transport {
        if use_tunnel {
            self.tunnel.as_ref()
        } else {
            self.direct.as_ref()
        }
    }

    /// Handle one proxy request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let config = self.config.load_full();

        if req.method() == Method::CONNECT {
            let authority = req
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default();
            let use_tunnel = config.mode == Mode::AlwaysTunnel
                || self.block.should_tunnel(&authority, &config);
            info!(
                "[{}] {} {}",
                self.route(use_tunnel).name(),
                req.method(),
                authority
            );
            return self.dispatch_connect(req, use_tunnel).await;
        }

        if req.uri().scheme().is_some() && req.uri().host().is_some() {
            let host = req.uri().host().unwrap_or_default().to_string();
            let use_tunnel =
                config.mode == Mode::AlwaysTunnel || self.block.should_tunnel(&host, &config);
            info!("[{}] {} {}", self.route(use_tunnel).name(), req.method(), req.uri());
            return self.dispatch_round_trip(req, use_tunnel).await;
        }

        if req.method() == Method::GET && req.uri().path() == "/reload" {
            return self.reload();
        }

        error!("{} is not a full URL path", req.uri());
        error_response(StatusCode::BAD_REQUEST, "not a full URL path")
    }

    async fn dispatch_connect<B>(&self, req: Request<B>, use_tunnel: bool) -> Response<Full<Bytes>>
    where
        B: Send + 'static,
    {
        let served = match self.engine.connect(req, self.route(use_tunnel)).await {
            Ok(served) => served,
            Err(e) => return internal_error(e),
        };
        let req = match served {
            ConnectServed::Response(response) => return response,
            ConnectServed::RetryWithTunnel(req) => req,
        };

        // Direct dial timed out; retry once through the tunnel.
        match self.engine.connect(req, self.tunnel.as_ref()).await {
            Ok(ConnectServed::Response(response)) => response,
            Ok(ConnectServed::RetryWithTunnel(_)) => internal_error(ProxyError::Timeout),
            Err(e) => internal_error(e),
        }
    }

    async fn dispatch_round_trip<B>(
        &self,
        req: Request<B>,
        use_tunnel: bool,
    ) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (mut parts, body) = req.into_parts();
        remove_hop_headers(&mut parts.headers);
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read request body: {}", e),
                )
            }
        };

        let served = match self
            .engine
            .round_trip(&parts, body.clone(), self.route(use_tunnel))
            .await
        {
            Ok(served) => served,
            Err(e) => return internal_error(e),
        };
        match served {
            Served::Response(response) => response,
            Served::RetryWithTunnel => {
                // Direct dial timed out; retry once through the tunnel.
                match self
                    .engine
                    .round_trip(&parts, body, self.tunnel.as_ref())
                    .await
                {
                    Ok(Served::Response(response)) => response,
                    Ok(Served::RetryWithTunnel) => internal_error(ProxyError::Timeout),
                    Err(e) => internal_error(e),
                }
            }
        }
    }

    /// Reload the config file, swap the shared snapshot, and clear the block
    /// cache so new verdicts use the fresh blocklist.
    fn reload(&self) -> Response<Full<Bytes>> {
        let path = self.config_path.display().to_string();
        match Config::load(&self.config_path) {
            Ok(config) => {
                self.config.store(Arc::new(config));
                self.block.clear();
                info!("{} reloaded", path);
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::from(format!("{} reloaded", path))))
                    .expect("static response")
            }
            Err(e) => {
                error!("reload {} failed: {}", path, e);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("{}: {}", path, e),
                )
            }
        }
    }
}

fn internal_error(e: ProxyError) -> Response<Full<Bytes>> {
    error!("request handling error: {}", e);
    error_response(e.status_code(), &e.to_string())
}

/// Proxy server: accept loop plus per-connection HTTP/1.1 serving.
pub struct Server {
    ctx: Arc<ProxyContext>,
}

impl Server {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Run the listener until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .ctx
            .config()
            .local_address
            .parse()
            .map_err(|_| ProxyError::InvalidConfig("invalid local_address".into()))?;

        let listener = TcpListener::bind(addr).await?;
        info!("proxy server listening on {}", addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, ctx).await {
                                    debug!("connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        ctx: Arc<ProxyContext>,
    ) -> Result<()> {
        debug!("accepted connection from {}", client_addr);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let ctx = ctx.clone();
            async move { Ok::<_, Infallible>(ctx.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        Ok(())
    }
}
