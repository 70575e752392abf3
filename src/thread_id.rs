//! Thread id derivation (C6)
//!
//! A message's thread id is, in order of preference:
//!
//! 1. the last `Message-Id` token in its `References` header
//! 2. its `In-Reply-To` header
//! 3. a stable hash of its normalized subject plus its sorted participant
//!    set, for messages with no threading headers at all
//!
//! Only the fallback case hashes anything; cases 1 and 2 reuse an upstream
//! Message-Id verbatim, since it is already a stable opaque identifier.

use sha2::{Digest, Sha256};

/// Derive a thread id from threading headers, falling back to a
/// content-derived hash when none are present.
pub fn derive_thread_id(
    references: Option<&str>,
    in_reply_to: Option<&str>,
    subject: Option<&str>,
    participants: &[String],
) -> String {
    if let Some(refs) = references
        && let Some(last) = last_message_id(refs)
    {
        return last;
    }
    if let Some(reply_to) = in_reply_to
        && let Some(id) = strip_angle_brackets(reply_to.trim())
    {
        return id;
    }
    hash_subject_and_participants(subject, participants)
}

fn last_message_id(references: &str) -> Option<String> {
    references
        .split_whitespace()
        .filter_map(strip_angle_brackets)
        .next_back()
}

fn strip_angle_brackets(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.trim_start_matches('<').trim_end_matches('>').to_owned())
}

fn hash_subject_and_participants(subject: Option<&str>, participants: &[String]) -> String {
    let normalized_subject = normalize_subject(subject.unwrap_or(""));
    let mut sorted_participants: Vec<String> =
        participants.iter().map(|p| p.trim().to_ascii_lowercase()).collect();
    sorted_participants.sort_unstable();
    sorted_participants.dedup();

    let mut input = normalized_subject;
    for p in sorted_participants {
        input.push('\u{1}');
        input.push_str(&p);
    }

    let digest = Sha256::digest(input.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Strip reply/forward prefixes and collapse whitespace so `"Re: Re: Hi"`
/// and `"hi"` normalize to the same key.
fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("re:").or_else(|| lower.strip_prefix("fwd:")) {
            s = s[s.len() - rest.len()..].trim_start();
        } else {
            break;
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_header_wins_over_everything_else() {
        let id = derive_thread_id(
            Some("<a@x> <b@x> <c@x>"),
            Some("<ignored@x>"),
            Some("subject"),
            &[],
        );
        assert_eq!(id, "c@x");
    }

    #[test]
    fn in_reply_to_used_when_no_references() {
        let id = derive_thread_id(None, Some("<only@x>"), Some("subject"), &[]);
        assert_eq!(id, "only@x");
    }

    #[test]
    fn falls_back_to_subject_and_participant_hash() {
        let id = derive_thread_id(
            None,
            None,
            Some("Re: Quarterly report"),
            &["Bob@Example.com".to_owned(), "alice@example.com".to_owned()],
        );
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn subject_normalization_ignores_case_and_reply_prefixes() {
        let a = derive_thread_id(None, None, Some("Re: Hi"), &["a@x".to_owned()]);
        let b = derive_thread_id(None, None, Some("re: re: HI"), &["a@x".to_owned()]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_participants_produce_different_hashes() {
        let a = derive_thread_id(None, None, Some("Hi"), &["a@x".to_owned()]);
        let b = derive_thread_id(None, None, Some("Hi"), &["b@x".to_owned()]);
        assert_ne!(a, b);
    }
}
