//! Smartproxy - selective SSH-tunneling forward proxy
//!
//! A local HTTP forward proxy that routes traffic for blocklisted domains
//! through a persistent SSH tunnel and everything else directly.
//!
//! ## Features
//!
//! - HTTP forwarding and CONNECT tunneling over either route
//! - Public-suffix-aware blocklist matching with a positive verdict cache
//! - Single shared SSH session with single-flight reconnect
//! - Direct dials with a short timeout that fall back to the tunnel
//! - JSON config with a live `/reload` endpoint

pub mod config;
pub mod domain;
pub mod error;
pub mod proxy;
pub mod util;

pub use config::Config;
pub use error::{ProxyError, Result};
