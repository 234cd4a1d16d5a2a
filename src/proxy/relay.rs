//! Bidirectional byte relay for established CONNECT sessions.
//!
//! Two copy loops run concurrently, one per direction. A direction ends on
//! EOF or error; errors are logged, not retried. The session finishes only
//! once both directions have settled, and only then are the write halves
//! shut down; a client half-close is not propagated to the backend.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::util::{format_duration, format_size};

/// Byte accounting for one finished relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Copy until EOF or error, reporting bytes moved either way.
async fn copy_counted<R, W>(mut reader: R, mut writer: W, label: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return total,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("{} write ended: {}", label, e);
                    return total;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!("{} read ended: {}", label, e);
                return total;
            }
        }
    }
}

/// Relay bytes between the hijacked client stream and the backend stream
/// until both directions settle, then close both.
pub async fn relay<C, B>(target: &str, client: C, backend: B) -> RelaySummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let (client_read, mut client_write) = tokio::io::split(client);
    let (backend_read, mut backend_write) = tokio::io::split(backend);

    let (client_to_backend, backend_to_client) = tokio::join!(
        copy_counted(client_read, &mut backend_write, "client->backend"),
        copy_counted(backend_read, &mut client_write, "backend->client"),
    );

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;

    info!(
        "CLOSE {} after {} ->{} <-{}",
        target,
        format_duration(start.elapsed()),
        format_size(client_to_backend),
        format_size(backend_to_client),
    );

    RelaySummary {
        client_to_backend,
        backend_to_client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_byte_accounting() {
        let (client_side, mut test_client) = tokio::io::duplex(1024);
        let (backend_side, mut test_backend) = tokio::io::duplex(1024);

        let session = tokio::spawn(async move {
            relay("dest.example:443", client_side, backend_side).await
        });

        test_client.write_all(b"hello from client").await.unwrap();
        test_client.shutdown().await.unwrap();

        test_backend.write_all(b"hi from backend!").await.unwrap();
        test_backend.shutdown().await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = test_backend.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 64];
        let n = test_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi from backend!");

        let summary = tokio::time::timeout(std::time::Duration::from_secs(1), session)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(
            summary,
            RelaySummary {
                client_to_backend: 17,
                backend_to_client: 16,
            }
        );

        // Both sockets are closed once the session finishes.
        let n = test_backend.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
        let n = test_client.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_early_backend_close_terminates_session() {
        let (client_side, mut test_client) = tokio::io::duplex(1024);
        let (backend_side, mut test_backend) = tokio::io::duplex(1024);

        let session = tokio::spawn(async move {
            relay("dest.example:443", client_side, backend_side).await
        });

        // Backend closes immediately without sending anything.
        test_backend.shutdown().await.unwrap();

        // The session is still waiting for the client direction.
        test_client.write_all(b"late data").await.unwrap();
        test_client.shutdown().await.unwrap();

        let summary = tokio::time::timeout(std::time::Duration::from_secs(1), session)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(summary.client_to_backend, 9);
        assert_eq!(summary.backend_to_client, 0);
    }

    #[tokio::test]
    async fn test_client_half_close_is_not_propagated_early() {
        let (client_side, mut test_client) = tokio::io::duplex(1024);
        let (backend_side, mut test_backend) = tokio::io::duplex(1024);

        let session = tokio::spawn(async move {
            relay("dest.example:443", client_side, backend_side).await
        });

        // Client finishes sending but still wants to receive.
        test_client.write_all(b"request").await.unwrap();
        test_client.shutdown().await.unwrap();

        let mut buf = vec![0u8; 16];
        let n = test_backend.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request");

        // Backend can still deliver after the client half-closed.
        test_backend.write_all(b"response").await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = test_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");

        test_backend.shutdown().await.unwrap();
        let summary = tokio::time::timeout(std::time::Duration::from_secs(1), session)
            .await
            .expect("relay timed out")
            .unwrap();
        assert_eq!(summary.client_to_backend, 7);
        assert_eq!(summary.backend_to_client, 8);
    }
}
