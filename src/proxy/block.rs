//! Blocklist verdicts with a lazily-populated positive cache.
//!
//! A host is routed through the tunnel when its exact name, registrable
//! domain, or public suffix appears in the sorted blocklist. Positive
//! verdicts are cached for the process lifetime; negatives are recomputed
//! (they are the common case and caching them would require invalidation on
//! every reload). The cache is cleared wholesale when the config reloads.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::domain::DomainClassifier;
use crate::util::host_of;

pub struct BlockCache {
    classifier: Arc<dyn DomainClassifier>,
    cached: RwLock<HashSet<String>>,
}

impl BlockCache {
    pub fn new(classifier: Arc<dyn DomainClassifier>) -> Self {
        Self {
            classifier,
            cached: RwLock::new(HashSet::new()),
        }
    }

    /// Decide whether `hostport` must be routed through the tunnel.
    pub fn should_tunnel(&self, hostport: &str, config: &Config) -> bool {
        let host = host_of(hostport);
        if host.is_empty() {
            return false;
        }

        if self.cached.read().contains(host) {
            return true;
        }

        let mut blocked = config.is_blocked(host);
        if !blocked {
            if let Some(domain) = self.classifier.registrable_domain(host) {
                blocked = config.is_blocked(&domain);
            }
        }
        if !blocked {
            if let Some(suffix) = self.classifier.public_suffix(host) {
                blocked = config.is_blocked(&suffix);
            }
        }

        if blocked {
            // Idempotent insert: a concurrent writer may already have added
            // the same verdict.
            self.cached.write().insert(host.to_string());
        }
        blocked
    }

    /// Drop every cached verdict. Called when the blocklist is reloaded.
    pub fn clear(&self) {
        self.cached.write().clear();
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cached.read().len()
    }
}
