//! Validation and composition of manifest paths.
//!
//! A path segment is the single component of a node or component path,
//! relative to the absolute path of its enclosing node. Absolute paths are
//! the `/`-joined segments from the root; nodes without a path segment are
//! transparent and contribute nothing to their descendants' paths.

use anyhow::{anyhow, Result};

use crate::errors::SyncError;

const MAX_SEGMENT_CHARS: usize = 255;
const FORBIDDEN_CHARS: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\'];

/// Whether `segment` is acceptable as a node or component path segment.
pub fn is_valid_segment(segment: &str) -> bool {
    let mut chars = 0;
    for c in segment.chars() {
        chars += 1;
        if chars > MAX_SEGMENT_CHARS {
            return false;
        }
        if FORBIDDEN_CHARS.contains(&c) || c.is_ascii_control() {
            return false;
        }
    }
    chars > 0 && !segment.ends_with('.')
}

pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if is_valid_segment(segment) {
        Ok(())
    } else {
        Err(anyhow!(SyncError::InvalidPath(segment.to_owned())))
    }
}

/// Joins a parent absolute path (`""` for the root) with one segment.
pub(crate) fn join(parent: &str, segment: &str) -> String {
    format!("{parent}/{segment}")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn accepts_ordinary_segments() {
        for s in ["a", "a.bin", "with space", "ünïcode", "x".repeat(255).as_str()] {
            assert!(is_valid_segment(s), "expected valid: {s:?}");
        }
    }

    #[test]
    fn rejects_forbidden_segments() {
        for s in [
            "",
            "a.",
            "trailing dot.",
            "a/b",
            "a:b",
            "a*b",
            "a?b",
            "a<b",
            "a>b",
            "a\"b",
            "a\\b",
            "a\x07b",
            "\x7f",
            "x".repeat(256).as_str(),
        ] {
            assert!(!is_valid_segment(s), "expected invalid: {s:?}");
        }
    }

    #[test]
    fn joins_from_root() {
        assert_eq!(join("", "a.bin"), "/a.bin");
        assert_eq!(join("/node", "x"), "/node/x");
    }

    proptest! {
        // Validity must match the definition character for character, so a
        // generated segment is valid iff it is 1-255 chars, contains no
        // forbidden or control character, and does not end with a dot.
        #[test]
        fn validator_matches_definition(s in "\\PC{0,300}") {
            let by_definition = !s.is_empty()
                && s.chars().count() <= MAX_SEGMENT_CHARS
                && !s.ends_with('.')
                && !s
                    .chars()
                    .any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_ascii_control());
            prop_assert_eq!(is_valid_segment(&s), by_definition);
        }
    }
}
