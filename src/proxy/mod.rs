//! Smart forward proxy implementation
//!
//! This module provides the proxy functionality including:
//! - HTTP forwarding and CONNECT tunneling
//! - Blocklist-driven route selection with a verdict cache
//! - Direct transport with a short dial timeout
//! - A single persistent SSH backend session with deduplicated reconnect

pub mod block;
pub mod engine;
pub mod relay;
pub mod server;
pub mod ssh;
pub mod transport;
pub mod tunnel;

pub use block::BlockCache;
pub use engine::ProxyEngine;
pub use server::{ProxyContext, Server};
pub use ssh::{BackendConnector, BackendSession, SshConnector};
pub use transport::{Dialed, DirectTransport, Transport};
pub use tunnel::TunnelManager;
