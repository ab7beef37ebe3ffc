//! Content-addressed dedup keys.
//!
//! The hash input is a normalized projection of the content (trimmed,
//! lowercased, whitespace runs collapsed) so trivial formatting differences
//! map to the same key. The stored content itself is never rewritten.

use sha2::{Digest, Sha256};

/// Project content onto its dedup form.
pub fn normalize_for_hash(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex digest of [`normalize_for_hash`]`(content)`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_hash(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_and_outer_whitespace_do_not_change_hash() {
        let a = content_hash("Task: Call client ABC");
        let b = content_hash("  task: CALL client abc \n");
        assert_eq!(a, b);
    }

    #[test]
    fn internal_whitespace_runs_collapse() {
        assert_eq!(
            content_hash("Prepare   invoice\tfor March"),
            content_hash("Prepare invoice for March")
        );
    }

    #[test]
    fn different_words_differ() {
        assert_ne!(content_hash("Prepare invoice"), content_hash("Prepare offer"));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = content_hash("anything");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
