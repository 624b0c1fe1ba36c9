//! Quota Recovery Ordering
//!
//! When a write does not fit, the facade frees space in phases:
//!
//! 1. expire everything whose TTL has passed
//! 2. drop every tab-scoped entry (disposable cache)
//! 3. evict persistent entries one at a time, retrying after each
//!
//! This module holds the phase 3 choice. Candidates from *other* sessions (or
//! unscoped ones) go before the current session's own data. Within that set
//! the lowest priority goes first, and among equal priorities the largest entry.

use std::cmp::{Ordering, Reverse};

/// An entry that may be evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Physical key
    pub key: String,
    /// Session id embedded in the key
    pub session: Option<String>,
    /// Configured priority of the owning item (0 when unknown)
    pub priority: i32,
    /// Serialized size of key plus value
    pub size: usize,
}

fn eviction_order(a: &Candidate, b: &Candidate) -> Ordering {
    (a.priority, Reverse(a.size), &a.key).cmp(&(b.priority, Reverse(b.size), &b.key))
}

/// Picks the next entry to evict, or `None` when nothing is left.
pub fn pick_candidate<'a>(
    candidates: &'a [Candidate],
    current_session: Option<&str>,
) -> Option<&'a Candidate> {
    let foreign_exists = candidates
        .iter()
        .any(|c| c.session.as_deref() != current_session);

    candidates
        .iter()
        .filter(|c| !foreign_exists || c.session.as_deref() != current_session)
        .min_by(|a, b| eviction_order(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, session: Option<&str>, priority: i32, size: usize) -> Candidate {
        Candidate {
            key: key.to_string(),
            session: session.map(str::to_string),
            priority,
            size,
        }
    }

    #[test]
    fn test_lowest_priority_first() {
        let candidates = vec![
            candidate("a", None, 5, 10),
            candidate("b", None, 1, 10),
            candidate("c", None, 10, 10),
        ];
        assert_eq!(pick_candidate(&candidates, None).unwrap().key, "b");
    }

    #[test]
    fn test_largest_first_on_equal_priority() {
        let candidates = vec![
            candidate("small", None, 0, 10),
            candidate("large", None, 0, 500),
            candidate("medium", None, 0, 100),
        ];
        assert_eq!(pick_candidate(&candidates, None).unwrap().key, "large");
    }

    #[test]
    fn test_other_sessions_evicted_before_current() {
        let candidates = vec![
            candidate("mine", Some("u1"), -5, 1000),
            candidate("theirs", Some("u2"), 10, 1),
        ];
        assert_eq!(pick_candidate(&candidates, Some("u1")).unwrap().key, "theirs");
    }

    #[test]
    fn test_unscoped_counts_as_other_session() {
        let candidates = vec![
            candidate("mine", Some("u1"), 0, 1000),
            candidate("shared", None, 10, 1),
        ];
        assert_eq!(pick_candidate(&candidates, Some("u1")).unwrap().key, "shared");
    }

    #[test]
    fn test_current_session_used_when_nothing_else() {
        let candidates = vec![
            candidate("mine-a", Some("u1"), 3, 10),
            candidate("mine-b", Some("u1"), 2, 10),
        ];
        assert_eq!(pick_candidate(&candidates, Some("u1")).unwrap().key, "mine-b");
    }

    #[test]
    fn test_empty() {
        assert!(pick_candidate(&[], None).is_none());
    }
}
