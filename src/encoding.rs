//! `Accept-Encoding` / `Content-Encoding` header parsing.
//!
//! Alias names (`x-gzip`) are canonicalised to `gzip` on ingress so the
//! rest of the engine only ever sees canonical tokens.

use std::collections::HashSet;

pub const GZIP: &str = "gzip";
pub const IDENTITY: &str = "identity";

fn canonical_name(name: &str) -> &str {
    if name == "x-gzip" {
        GZIP
    } else {
        name
    }
}

/// Parse an `Accept-Encoding` header into the set of encodings the client
/// will accept. `;q=...` parameters are stripped; `identity` is always a
/// member. A missing or empty header yields `{identity}`.
pub fn accepted_encodings(header: Option<&str>) -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert(IDENTITY.to_string());

    if let Some(header) = header {
        for token in header.split(',') {
            let name = token.split(';').next().unwrap_or("").trim();
            if !name.is_empty() {
                set.insert(canonical_name(name).to_string());
            }
        }
    }

    set
}

/// Parse a `Content-Encoding` header into the ordered list of encodings
/// applied to the body (outermost last, per HTTP semantics). Trailing
/// `identity` tokens are dropped; a missing or empty header yields `[]`.
pub fn content_encodings(header: Option<&str>) -> Vec<String> {
    let mut list = Vec::new();

    if let Some(header) = header {
        for token in header.split(',') {
            let name = token.trim();
            if !name.is_empty() {
                list.push(canonical_name(name).to_string());
            }
        }
    }

    // remove 'identity' if it comes last
    while list.last().is_some_and(|e| e == IDENTITY) {
        list.pop();
    }

    list
}

/// Whether stored bytes with `stored` encodings can be served as-is to a
/// client accepting `accepted`.
pub fn accepts_all(accepted: &HashSet<String>, stored: &[String]) -> bool {
    accepted.contains("*") || stored.iter().all(|e| accepted.contains(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_accepted_missing_header_is_identity() {
        assert_eq!(accepted_encodings(None), set(&["identity"]));
        assert_eq!(accepted_encodings(Some("")), set(&["identity"]));
    }

    #[test]
    fn test_accepted_strips_quality_params() {
        let accepted = accepted_encodings(Some("gzip;q=1.0, br;q=0.8, *;q=0.1"));
        assert_eq!(accepted, set(&["identity", "gzip", "br", "*"]));
    }

    #[test]
    fn test_accepted_canonicalises_x_gzip() {
        let accepted = accepted_encodings(Some("x-gzip"));
        assert!(accepted.contains("gzip"));
        assert!(!accepted.contains("x-gzip"));
    }

    #[test]
    fn test_content_missing_header_is_empty() {
        assert!(content_encodings(None).is_empty());
        assert!(content_encodings(Some("")).is_empty());
    }

    #[test]
    fn test_content_preserves_order() {
        assert_eq!(
            content_encodings(Some("br, gzip")),
            vec!["br".to_string(), "gzip".to_string()]
        );
    }

    #[test]
    fn test_content_strips_trailing_identity() {
        assert_eq!(
            content_encodings(Some("gzip, identity")),
            vec!["gzip".to_string()]
        );
        assert!(content_encodings(Some("identity")).is_empty());
        assert!(content_encodings(Some("identity, identity")).is_empty());
    }

    #[test]
    fn test_content_keeps_inner_identity() {
        assert_eq!(
            content_encodings(Some("identity, gzip")),
            vec!["identity".to_string(), "gzip".to_string()]
        );
    }

    #[test]
    fn test_accepts_all() {
        assert!(accepts_all(&set(&["identity", "gzip"]), &["gzip".to_string()]));
        assert!(accepts_all(&set(&["*"]), &["br".to_string()]));
        assert!(!accepts_all(&set(&["identity"]), &["gzip".to_string()]));
        // empty stored list is trivially acceptable
        assert!(accepts_all(&set(&["identity"]), &[]));
    }
}
