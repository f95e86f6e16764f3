//! Write-side backend routing.
//!
//! A short chain of predicates over content metadata, evaluated once per
//! save. The first matching rule wins; a `Static` terminator always
//! matches. Reads never consult the selector: they route by the
//! `backend_id` recorded in the index.

use crate::content::{now_millis, Content};

/// Chain-of-responsibility selector resolving the backend id a record
/// should be written to.
pub enum BackendSelector {
    /// Always route to this backend. Terminates every chain.
    Static(String),
    /// Route to `backend_id` when the content is larger than
    /// `threshold_bytes`, else defer to `next`.
    IfSizeGt {
        threshold_bytes: u64,
        backend_id: String,
        next: Box<BackendSelector>,
    },
    /// Route to `backend_id` when the content expires more than
    /// `threshold_mins` from now ("never" exceeds any threshold), else
    /// defer to `next`.
    IfExpiryGt {
        threshold_mins: i64,
        backend_id: String,
        next: Box<BackendSelector>,
    },
}

impl BackendSelector {
    /// The backend id `content` should be written to.
    pub fn select(&self, content: &Content) -> &str {
        match self {
            BackendSelector::Static(backend_id) => backend_id,
            BackendSelector::IfSizeGt {
                threshold_bytes,
                backend_id,
                next,
            } => {
                if content.content_length > *threshold_bytes {
                    backend_id
                } else {
                    next.select(content)
                }
            }
            BackendSelector::IfExpiryGt {
                threshold_mins,
                backend_id,
                next,
            } => {
                let exceeds = match content.expiry {
                    None => true,
                    Some(expiry) => (expiry - now_millis()) / 60_000 > *threshold_mins,
                };
                if exceeds {
                    backend_id
                } else {
                    next.select(content)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn content(length: usize, expiry: Option<i64>) -> Content {
        Content::new(
            "testkey".to_string(),
            "text/plain".to_string(),
            expiry,
            now_millis(),
            None,
            "gzip".to_string(),
            Bytes::from(vec![0u8; length]),
        )
    }

    #[test]
    fn test_static_always_matches() {
        let selector = BackendSelector::Static("local".to_string());
        assert_eq!(selector.select(&content(10, None)), "local");
    }

    #[test]
    fn test_size_threshold_routes_large_content() {
        let selector = BackendSelector::IfSizeGt {
            threshold_bytes: 100,
            backend_id: "s3".to_string(),
            next: Box::new(BackendSelector::Static("local".to_string())),
        };
        assert_eq!(selector.select(&content(101, None)), "s3");
        assert_eq!(selector.select(&content(100, None)), "local");
    }

    #[test]
    fn test_expiry_threshold_routes_long_lived_content() {
        let selector = BackendSelector::IfExpiryGt {
            threshold_mins: 60,
            backend_id: "s3".to_string(),
            next: Box::new(BackendSelector::Static("local".to_string())),
        };
        let long_lived = content(10, Some(now_millis() + 2 * 60 * 60 * 1000));
        let short_lived = content(10, Some(now_millis() + 10 * 60 * 1000));
        assert_eq!(selector.select(&long_lived), "s3");
        assert_eq!(selector.select(&short_lived), "local");
    }

    #[test]
    fn test_never_expiring_exceeds_any_threshold() {
        let selector = BackendSelector::IfExpiryGt {
            threshold_mins: i64::MAX / 120_000,
            backend_id: "s3".to_string(),
            next: Box::new(BackendSelector::Static("local".to_string())),
        };
        assert_eq!(selector.select(&content(10, None)), "s3");
    }

    #[test]
    fn test_chained_rules_first_match_wins() {
        let selector = BackendSelector::IfSizeGt {
            threshold_bytes: 1000,
            backend_id: "s3".to_string(),
            next: Box::new(BackendSelector::IfExpiryGt {
                threshold_mins: 60,
                backend_id: "s3".to_string(),
                next: Box::new(BackendSelector::Static("local".to_string())),
            }),
        };
        // small and short-lived falls through both rules
        let small = content(10, Some(now_millis() + 60_000));
        assert_eq!(selector.select(&small), "local");
        // big goes to s3 regardless of expiry
        let big = content(2000, Some(now_millis() + 60_000));
        assert_eq!(selector.select(&big), "s3");
    }
}
