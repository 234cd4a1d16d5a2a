//! Per-request proxy orchestration.
//!
//! Speaks the two forward-proxy protocols: plain absolute-URI HTTP round
//! trips and CONNECT tunneling. The engine performs a single attempt over
//! the transport it is handed; routing and the direct-to-tunnel fallback
//! retry live in the server dispatch.

use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info};

use crate::error::{ProxyError, Result};
use crate::proxy::relay;
use crate::proxy::transport::{Dialed, Transport};
use crate::util::{format_duration, format_size, remove_hop_headers};

/// Outcome of a round-trip attempt.
pub enum Served {
    Response(Response<Full<Bytes>>),
    /// The direct transport timed out; the caller should re-dispatch through
    /// the tunnel.
    RetryWithTunnel,
}

/// Outcome of a CONNECT attempt. The request travels back with the retry
/// signal so the caller can re-dispatch it unconsumed.
pub enum ConnectServed<B> {
    Response(Response<Full<Bytes>>),
    RetryWithTunnel(Request<B>),
}

pub struct ProxyEngine;

impl ProxyEngine {
    /// Perform one HTTP round trip over `transport` and return the response
    /// with hop-by-hop headers stripped.
    pub async fn round_trip(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        transport: &dyn Transport,
    ) -> Result<Served> {
        if parts.method == Method::CONNECT {
            let e = ProxyError::MethodNotAllowed(parts.method.to_string());
            error!("{}", e);
            return Ok(Served::Response(error_response(
                e.status_code(),
                &e.to_string(),
            )));
        }
        let start = Instant::now();

        let (host, port) = match parse_target(&parts.uri) {
            Ok(target) => target,
            Err(e) => {
                return Ok(Served::Response(error_response(
                    StatusCode::BAD_REQUEST,
                    &e.to_string(),
                )))
            }
        };

        let stream = match transport.dial(&host, port).await {
            Ok(Dialed::Stream(stream)) => stream,
            Ok(Dialed::RetryWithTunnel) => return Ok(Served::RetryWithTunnel),
            Err(e) => {
                info!("dial {}:{} failed: {}", host, port, e);
                return Ok(Served::Response(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &e.to_string(),
                )));
            }
        };

        match self.forward(parts, body, stream).await {
            Ok((response, body_len)) => {
                info!(
                    "RESPONSE {} {} in {} <-{}",
                    parts.uri.host().unwrap_or(""),
                    response.status(),
                    format_duration(start.elapsed()),
                    format_size(body_len),
                );
                Ok(Served::Response(response))
            }
            Err(e) => {
                info!("round trip to {}:{} failed: {}", host, port, e);
                Ok(Served::Response(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &e.to_string(),
                )))
            }
        }
    }

    /// Send the request in origin form over an already dialed stream.
    /// Returns the response and its body size for the request log.
    async fn forward(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        stream: crate::proxy::transport::ProxyStream,
    ) -> Result<(Response<Full<Bytes>>, u64)> {
        let origin_form = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(origin_form);
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }
        // hyper's http1 client does not add Host on its own.
        if !parts.headers.contains_key(http::header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                builder = builder.header(http::header::HOST, authority.as_str());
            }
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("origin connection ended: {}", e);
            }
        });

        let response = sender.send_request(request).await?;
        let (mut parts, body) = response.into_parts();
        let body_bytes = body.collect().await?.to_bytes();
        remove_hop_headers(&mut parts.headers);
        let body_len = body_bytes.len() as u64;
        Ok((Response::from_parts(parts, Full::new(body_bytes)), body_len))
    }

    /// Establish a CONNECT tunnel over `transport`. On success the response
    /// is an empty 200 and a background task relays bytes once the client
    /// connection upgrades.
    pub async fn connect<B>(
        &self,
        req: Request<B>,
        transport: &dyn Transport,
    ) -> Result<ConnectServed<B>>
    where
        B: Send + 'static,
    {
        if req.method() != Method::CONNECT {
            let e = ProxyError::MethodNotAllowed(req.method().to_string());
            error!("{}", e);
            return Ok(ConnectServed::Response(error_response(
                e.status_code(),
                &e.to_string(),
            )));
        }

        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (host, port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(e) => {
                return Ok(ConnectServed::Response(error_response(
                    StatusCode::BAD_REQUEST,
                    &e.to_string(),
                )))
            }
        };

        let backend = match transport.dial(&host, port).await {
            Ok(Dialed::Stream(stream)) => stream,
            Ok(Dialed::RetryWithTunnel) => return Ok(ConnectServed::RetryWithTunnel(req)),
            Err(e) => {
                info!("CONNECT dial {} failed: {}", authority, e);
                return Ok(ConnectServed::Response(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &e.to_string(),
                )));
            }
        };

        // Raw socket takeover: hyper hands the client connection over once
        // the 200 has been written.
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    relay::relay(&authority, client, backend).await;
                }
                Err(e) => {
                    error!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        Ok(ConnectServed::Response(
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .expect("static response"),
        ))
    }
}

/// Create a plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response")
}

/// Parse host and port from an absolute request URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("missing host in URI".to_string()))?
        .to_string();
    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((host, port))
}

/// Parse host and port from a CONNECT authority; port defaults to 443.
/// IPv6 literals arrive bracketed (`[::1]:8080`) and are unwrapped like
/// `util::host_of` does.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::InvalidRequest("unterminated IPv6 literal".to_string()))?;
        return match tail.strip_prefix(':') {
            Some(port_str) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| ProxyError::InvalidRequest("invalid port".to_string()))?;
                Ok((host.to_string(), port))
            }
            None if tail.is_empty() => Ok((host.to_string(), 443)),
            None => Err(ProxyError::InvalidRequest("invalid authority".to_string())),
        };
    }
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if !host.contains(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest("invalid port".to_string()))?;
            return Ok((host.to_string(), port));
        }
    }
    Ok((authority.to_string(), 443))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::DirectTransport;
    use async_trait::async_trait;
    use http_body_util::Empty;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct AlwaysRetryTransport;

    #[async_trait]
    impl Transport for AlwaysRetryTransport {
        async fn dial(&self, _host: &str, _port: u16) -> Result<Dialed> {
            Ok(Dialed::RetryWithTunnel)
        }

        fn name(&self) -> &'static str {
            "DIRECT"
        }
    }

    fn request_parts(method: Method, uri: &str) -> http::request::Parts {
        let (parts, _body) = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "*/*")
            .body(Empty::<Bytes>::new())
            .unwrap()
            .into_parts();
        parts
    }

    /// Minimal origin that answers one request with fixed headers and body,
    /// including hop-by-hop headers the proxy must strip.
    async fn spawn_mock_origin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let request = String::from_utf8_lossy(&seen).to_string();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Length: 5\r\n\
                      X-Origin: yes\r\n\
                      Connection: keep-alive\r\n\
                      Transfer-Encoding: identity\r\n\r\nhello",
                )
                .await
                .unwrap();
            request
        });
        port
    }

    #[tokio::test]
    async fn test_round_trip_returns_origin_response_minus_hop_headers() {
        let port = spawn_mock_origin().await;
        let parts = request_parts(Method::GET, &format!("http://127.0.0.1:{}/path", port));
        let transport = DirectTransport::new(Duration::from_secs(1));

        let engine = ProxyEngine;
        let served = engine
            .round_trip(&parts, Bytes::new(), &transport)
            .await
            .unwrap();

        let response = match served {
            Served::Response(response) => response,
            Served::RetryWithTunnel => panic!("unexpected retry"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-Origin").unwrap(), "yes");
        assert!(response.headers().get("Connection").is_none());
        assert!(response.headers().get("Transfer-Encoding").is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_round_trip_rejects_connect() {
        let parts = request_parts(Method::CONNECT, "dest.example:443");
        let engine = ProxyEngine;
        let served = engine
            .round_trip(&parts, Bytes::new(), &AlwaysRetryTransport)
            .await
            .unwrap();
        match served {
            Served::Response(response) => {
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED)
            }
            Served::RetryWithTunnel => panic!("unexpected retry"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_direct_timeout_requests_tunnel_retry() {
        let parts = request_parts(Method::GET, "http://dest.example/");
        let engine = ProxyEngine;
        let served = engine
            .round_trip(&parts, Bytes::new(), &AlwaysRetryTransport)
            .await
            .unwrap();
        assert!(matches!(served, Served::RetryWithTunnel));
    }

    #[tokio::test]
    async fn test_connect_rejects_plain_methods() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://dest.example/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let engine = ProxyEngine;
        let served = engine.connect(req, &AlwaysRetryTransport).await.unwrap();
        match served {
            ConnectServed::Response(response) => {
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED)
            }
            ConnectServed::RetryWithTunnel(_) => panic!("unexpected retry"),
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_request_for_retry() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("dest.example:443")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let engine = ProxyEngine;
        let served = engine.connect(req, &AlwaysRetryTransport).await.unwrap();
        match served {
            ConnectServed::RetryWithTunnel(req) => {
                assert_eq!(req.method(), Method::CONNECT);
                assert_eq!(req.uri().to_string(), "dest.example:443");
            }
            ConnectServed::Response(_) => panic!("expected retry"),
        }
    }

    #[tokio::test]
    async fn test_connect_establishes_and_returns_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri(format!("127.0.0.1:{}", port))
            .body(Empty::<Bytes>::new())
            .unwrap();
        let transport = DirectTransport::new(Duration::from_secs(1));
        let engine = ProxyEngine;
        let served = engine.connect(req, &transport).await.unwrap();
        match served {
            ConnectServed::Response(response) => assert_eq!(response.status(), StatusCode::OK),
            ConnectServed::RetryWithTunnel(_) => panic!("unexpected retry"),
        }
    }

    #[test]
    fn test_parse_target_defaults() {
        let uri: Uri = "http://example.com/a/b".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".into(), 80));
        let uri: Uri = "https://example.com/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".into(), 443));
        let uri: Uri = "http://example.com:8080/".parse().unwrap();
        assert_eq!(parse_target(&uri).unwrap(), ("example.com".into(), 8080));
    }

    #[test]
    fn test_parse_authority_defaults() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".into(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".into(), 443)
        );
        assert!(parse_authority("example.com:bogus").is_err());
    }

    #[test]
    fn test_parse_authority_ipv6_literals() {
        assert_eq!(parse_authority("[::1]:8080").unwrap(), ("::1".into(), 8080));
        assert_eq!(
            parse_authority("[2001:db8::1]").unwrap(),
            ("2001:db8::1".into(), 443)
        );
        assert!(parse_authority("[::1").is_err());
        assert!(parse_authority("[::1]8080").is_err());
    }
}
