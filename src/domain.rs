//! Domain classification seam.
//!
//! The blocklist matches hosts at three granularities: exact host,
//! registrable domain (effective TLD plus one), and public suffix. The
//! classification itself is a pure function supplied by the `psl` crate;
//! the trait exists so tests can count and stub lookups.

/// Pure `host -> (registrable domain, public suffix)` classification.
pub trait DomainClassifier: Send + Sync {
    /// Effective TLD plus one, e.g. `www.example.co.uk` -> `example.co.uk`.
    fn registrable_domain(&self, host: &str) -> Option<String>;

    /// Public suffix, e.g. `www.example.co.uk` -> `co.uk`.
    fn public_suffix(&self, host: &str) -> Option<String>;
}

/// Classifier backed by the compiled public suffix list.
#[derive(Debug, Default, Clone, Copy)]
pub struct PslClassifier;

impl DomainClassifier for PslClassifier {
    fn registrable_domain(&self, host: &str) -> Option<String> {
        psl::domain_str(host).map(str::to_string)
    }

    fn public_suffix(&self, host: &str) -> Option<String> {
        psl::suffix_str(host).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psl_classifier() {
        let classifier = PslClassifier;
        assert_eq!(
            classifier.registrable_domain("www.example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            classifier.public_suffix("www.example.co.uk").as_deref(),
            Some("co.uk")
        );
        assert_eq!(
            classifier.registrable_domain("maps.google.com").as_deref(),
            Some("google.com")
        );
    }
}
