//! Tunnel transport manager.
//!
//! Owns the single live backend session. The hot path snapshots the session
//! under a read lock and opens a channel on it; a failed open triggers a
//! reconnect that is deduplicated per dial key so a burst of concurrent
//! requests observing the same dead session produces exactly one
//! re-handshake. Every waiter receives the same outcome and then retries its
//! own channel open against the freshly swapped session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::ssh::{BackendConnector, BackendSession};
use crate::proxy::transport::{Dialed, Transport};

/// Broadcastable reconnect outcome. The session itself lives in the shared
/// slot; waiters only need success or the error text.
type FlightOutcome = std::result::Result<(), String>;

enum FlightRole {
    Winner(watch::Sender<Option<FlightOutcome>>),
    Waiter(watch::Receiver<Option<FlightOutcome>>),
}

/// Removes the in-flight record when the winner finishes or is dropped
/// mid-handshake. Without it, a caller cancelled during `connect()` would
/// leave a stale receiver in the map and poison the dial key for good.
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<String, watch::Receiver<Option<FlightOutcome>>>>,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights.lock().remove(self.key);
    }
}

pub struct TunnelManager {
    connector: Arc<dyn BackendConnector>,
    live: RwLock<Option<Arc<dyn BackendSession>>>,
    flights: Mutex<HashMap<String, watch::Receiver<Option<FlightOutcome>>>>,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            live: RwLock::new(None),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Establish the initial session. Startup calls this once so that a
    /// backend that cannot be reached at all surfaces before serving.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.live.read().is_some() {
            return Ok(());
        }
        self.reconnect("startup").await
    }

    /// Open a stream to `host:port` through the backend session,
    /// reconnecting (deduplicated) when the session is missing or dead.
    pub async fn open(&self, host: &str, port: u16) -> Result<crate::proxy::transport::ProxyStream> {
        let snapshot = self.live.read().clone();
        if let Some(session) = snapshot {
            match session.open(host, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("backend dial {}:{} failed: {}, reconnecting", host, port, e);
                }
            }
        }

        let key = format!("tcp/{}:{}", host, port);
        self.reconnect(&key).await?;

        let session = self
            .live
            .read()
            .clone()
            .ok_or_else(|| ProxyError::Tunnel("no backend session after reconnect".into()))?;
        session.open(host, port).await
    }

    /// Single-flight reconnect: the first caller for `key` performs the full
    /// handshake and swaps the session slot, everyone else waits on the same
    /// watch cell.
    async fn reconnect(&self, key: &str) -> Result<()> {
        loop {
            let role = {
                let mut flights = self.flights.lock();
                match flights.get(key) {
                    Some(rx) => FlightRole::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        flights.insert(key.to_string(), rx);
                        FlightRole::Winner(tx)
                    }
                }
            };

            match role {
                FlightRole::Winner(tx) => {
                    let guard = FlightGuard {
                        flights: &self.flights,
                        key,
                    };
                    let outcome: FlightOutcome = match self.connector.connect().await {
                        Ok(session) => {
                            *self.live.write() = Some(session);
                            info!("backend session reconnected");
                            Ok(())
                        }
                        Err(e) => {
                            warn!("backend reconnect failed: {}", e);
                            Err(e.to_string())
                        }
                    };
                    // Remove the flight before broadcasting so late arrivals
                    // start a fresh attempt instead of observing a stale cell.
                    drop(guard);
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome.map_err(ProxyError::ReconnectFailed);
                }
                FlightRole::Waiter(mut rx) => {
                    let settled = loop {
                        if let Some(outcome) = rx.borrow_and_update().clone() {
                            break Some(outcome);
                        }
                        if rx.changed().await.is_err() {
                            // The winner was dropped mid-handshake; its guard
                            // has removed the flight. Contend for a fresh one.
                            break None;
                        }
                    };
                    match settled {
                        Some(outcome) => return outcome.map_err(ProxyError::ReconnectFailed),
                        None => continue,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TunnelManager {
    async fn dial(&self, host: &str, port: u16) -> Result<Dialed> {
        Ok(Dialed::Stream(self.open(host, port).await?))
    }

    fn name(&self) -> &'static str {
        "PROXY"
    }
}
