//! Text normalization and digest derivation for cache keys.
//!
//! Every cache namespace shares one hashing discipline: normalize the input
//! (lowercase, collapse whitespace, strip punctuation), then take a truncated
//! SHA-256 digest. Strings that differ only in case, spacing, or punctuation
//! therefore map to the same key.

use sha2::{Digest, Sha256};

use crate::models::{RetrievedDocument, Turn};

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 16;

/// How much of a document's text participates in its key.
const DOC_HASH_PREFIX: usize = 500;

/// How much of each history turn participates in the context key.
const TURN_HASH_PREFIX: usize = 100;

/// How much side-channel context participates in the context key.
const SIDE_CONTEXT_PREFIX: usize = 200;

/// Lowercase, collapse runs of whitespace to single spaces, and drop
/// everything that is not alphanumeric, underscore, or whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncated SHA-256 digest of the normalized text.
pub fn hash_text(text: &str) -> String {
    digest(&normalize_text(text))
}

/// Digest of a retrieved document, keyed on a bounded text prefix so huge
/// chunks do not slow key derivation.
pub fn hash_doc(doc: &RetrievedDocument) -> String {
    hash_text(&truncate(&doc.text, DOC_HASH_PREFIX))
}

/// Order-insensitive digest of a document set.
pub fn hash_docs(docs: &[RetrievedDocument]) -> String {
    let mut hashes: Vec<String> = docs.iter().map(hash_doc).collect();
    hashes.sort();
    digest(&hashes.join("|"))
}

/// Digest of the conversational context: the last two history turns plus any
/// live side-channel context. Identical questions asked under different
/// context must not collide in the response cache.
pub fn hash_context(history: &[Turn], side_context: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let recent = if history.len() > 2 {
        &history[history.len() - 2..]
    } else {
        history
    };
    for turn in recent {
        parts.push(format!(
            "{}:{}",
            turn.role,
            truncate(&turn.content, TURN_HASH_PREFIX)
        ));
    }
    if let Some(side) = side_context {
        parts.push(hash_text(&truncate(side, SIDE_CONTEXT_PREFIX)));
    }
    if parts.is_empty() {
        digest("no_context")
    } else {
        digest(&parts.join("|"))
    }
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..DIGEST_LEN].to_string()
}

/// Char-boundary-safe prefix.
fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_case_and_whitespace() {
        assert_eq!(
            normalize_text("  How   Do I    Authenticate? "),
            "how do i authenticate"
        );
    }

    #[test]
    fn test_hash_invariant_under_punctuation() {
        assert_eq!(hash_text("What's the rate limit?"), hash_text("whats the RATE limit"));
    }

    #[test]
    fn test_hash_differs_for_different_text() {
        assert_ne!(hash_text("place an order"), hash_text("cancel an order"));
    }

    #[test]
    fn test_hash_length_stable() {
        assert_eq!(hash_text("anything").len(), DIGEST_LEN);
        assert_eq!(hash_text("").len(), DIGEST_LEN);
    }

    #[test]
    fn test_context_hash_uses_recent_turns_only() {
        let old = vec![
            Turn::new("user", "ancient question"),
            Turn::new("assistant", "ancient answer"),
            Turn::new("user", "recent question"),
            Turn::new("assistant", "recent answer"),
        ];
        let recent_only = vec![
            Turn::new("user", "recent question"),
            Turn::new("assistant", "recent answer"),
        ];
        assert_eq!(hash_context(&old, None), hash_context(&recent_only, None));
    }

    #[test]
    fn test_context_hash_changes_with_side_context() {
        let history = vec![Turn::new("user", "hello")];
        assert_ne!(
            hash_context(&history, None),
            hash_context(&history, Some("live market data"))
        );
    }

    #[test]
    fn test_docs_hash_order_insensitive() {
        let a = RetrievedDocument::new("alpha".into(), json!({}), 0.9);
        let b = RetrievedDocument::new("beta".into(), json!({}), 0.8);
        assert_eq!(
            hash_docs(&[a.clone(), b.clone()]),
            hash_docs(&[b, a])
        );
    }
}
