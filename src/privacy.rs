//! Inbox id hashing for logs
//!
//! Raw inbox ids (conventionally email addresses) must never reach a log
//! line. [`InboxIdHash`] is the only representation of an inbox id that
//! implements `Display`/`Debug` in a way safe to log; everything that wants
//! to log an inbox id is expected to go through [`hash_inbox_id`] first.

use std::fmt;

use sha2::{Digest, Sha256};

/// Stable one-way hash of an inbox id: first 12 hex chars of SHA-256.
///
/// Used as the hash component of session-store keys (`session:{proto}:{hash}`)
/// and as the only inbox identifier that may appear in a log line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InboxIdHash(String);

impl InboxIdHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InboxIdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash an inbox id down to its stable 12-hex-char log-safe form.
pub fn hash_inbox_id(inbox_id: &str) -> InboxIdHash {
    let digest = Sha256::digest(inbox_id.as_bytes());
    let hex = hex_prefix(&digest, 6);
    InboxIdHash(hex)
}

/// Encode the first `bytes` bytes of `digest` as lowercase hex.
///
/// 6 bytes -> 12 hex chars, matching the spec's "first 12 hex chars" wording.
fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    digest[..bytes].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::hash_inbox_id;

    #[test]
    fn hash_is_twelve_lowercase_hex_chars() {
        let hash = hash_inbox_id("user@example.com");
        assert_eq!(hash.as_str().len(), 12);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash.as_str(), hash.as_str().to_ascii_lowercase());
    }

    #[test]
    fn hash_is_deterministic_and_id_sensitive() {
        let a = hash_inbox_id("alice@example.com");
        let b = hash_inbox_id("alice@example.com");
        let c = hash_inbox_id("bob@example.com");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
