//! Conversation thread identity.
//!
//! A thread id is opaque to Parley: the agent's state store owns whatever
//! history is attached to it. Parley only guarantees that every request runs
//! against a well-formed id, reusing the caller's id when it is valid and
//! minting a fresh one otherwise.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted length of a client-supplied thread id.
pub const MAX_THREAD_ID_LEN: usize = 128;

static THREAD_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:-]+$").expect("Invalid thread id regex"));

/// A validated, non-empty conversation thread identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Mint a new globally-unique thread id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept `candidate` only if it is a well-formed thread id.
    pub fn parse(candidate: &str) -> Option<Self> {
        is_valid(candidate).then(|| Self(candidate.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ThreadId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `candidate` conforms to the thread id format.
pub fn is_valid(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_THREAD_ID_LEN
        && THREAD_ID_PATTERN.is_match(candidate)
}

/// Resolve the thread id for a request.
///
/// Returns the candidate unchanged when it is valid, otherwise a fresh id.
/// Never fails: a malformed id starts a new conversation.
pub fn resolve(candidate: Option<&str>) -> ThreadId {
    match candidate.and_then(ThreadId::parse) {
        Some(id) => id,
        None => {
            if let Some(rejected) = candidate {
                tracing::debug!(
                    len = rejected.len(),
                    "Ignoring malformed thread id; starting a new thread"
                );
            }
            ThreadId::generate()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_absent_candidate_generates_fresh_ids() {
        let ids: HashSet<ThreadId> = (0..200).map(|_| resolve(None)).collect();
        assert_eq!(ids.len(), 200);
        assert!(ids.iter().all(|id| !id.as_str().is_empty()));
    }

    #[test]
    fn test_generated_id_is_a_uuid() {
        let id = resolve(None);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert!(is_valid(id.as_str()));
    }

    #[test]
    fn test_valid_candidate_passes_through() {
        let first = resolve(Some("thread-42"));
        let second = resolve(Some("thread-42"));
        assert_eq!(first.as_str(), "thread-42");
        assert_eq!(first, second);
    }

    #[test]
    fn test_uuid_candidate_passes_through() {
        let raw = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(resolve(Some(raw)).as_str(), raw);
    }

    #[test]
    fn test_empty_candidate_starts_new_thread() {
        let id = resolve(Some(""));
        assert!(!id.as_str().is_empty());
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_malformed_candidates_start_new_thread() {
        for bad in ["has space", "semi;colon", "slash/path", "new\nline", "ümlaut"] {
            let id = resolve(Some(bad));
            assert_ne!(id.as_str(), bad);
            assert!(Uuid::parse_str(id.as_str()).is_ok(), "{bad:?}");
        }
    }

    #[test]
    fn test_length_boundary() {
        let max = "a".repeat(MAX_THREAD_ID_LEN);
        assert!(is_valid(&max));
        assert_eq!(resolve(Some(&max)).as_str(), max);

        let too_long = "a".repeat(MAX_THREAD_ID_LEN + 1);
        assert!(!is_valid(&too_long));
        assert_ne!(resolve(Some(&too_long)).as_str(), too_long);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(ThreadId::parse("").is_none());
        assert!(ThreadId::parse("a b").is_none());
        assert_eq!(ThreadId::parse("user:7.session_1").unwrap().as_str(), "user:7.session_1");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ThreadId::parse("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(id.to_string(), "abc");
    }
}
