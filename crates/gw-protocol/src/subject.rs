//! Subject grammar: validation and wildcard pattern matching.
//!
//! A subject is a non-empty dot-delimited token sequence. Literal tokens
//! are drawn from `[A-Za-z0-9_-]+`; a pattern may additionally use the
//! wildcard tokens `*` (exactly one token) and `>` (one-or-more trailing
//! tokens, final position only).

use crate::{ProtocolError, MAX_SUBJECT_LEN};

/// Validate a subject or pattern.
///
/// Rules:
/// - non-empty, at most [`MAX_SUBJECT_LEN`] bytes
/// - no leading/trailing dot, no empty tokens (`a..b`)
/// - every token is `*`, `>`, or `[A-Za-z0-9_-]+`
/// - `>` may only be the final token
pub fn validate_subject(subject: &str) -> Result<(), ProtocolError> {
    let invalid = || ProtocolError::InvalidSubject(subject.to_string());

    if subject.is_empty() || subject.len() > MAX_SUBJECT_LEN {
        return Err(invalid());
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return Err(invalid()),
            "*" => {}
            ">" => {
                if i != tokens.len() - 1 {
                    return Err(invalid());
                }
            }
            literal => {
                if !literal
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                {
                    return Err(invalid());
                }
            }
        }
    }

    Ok(())
}

/// Match a pattern against a concrete subject, NATS-style.
///
/// Pure function of its inputs: tokenizes both on `.` and walks them in
/// lockstep. `*` consumes exactly one subject token; `>` succeeds iff at
/// least one subject token remains (it never matches zero tokens). A
/// match requires both sides exhausted together, or the pattern ending
/// at `>`.
///
/// Pattern validity is the caller's concern (checked at subscribe and
/// publish time); this function just applies the walk.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let subject: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pattern.len() && si < subject.len() {
        match pattern[pi] {
            ">" => return true,
            "*" => {
                pi += 1;
                si += 1;
            }
            literal if literal == subject[si] => {
                pi += 1;
                si += 1;
            }
            _ => return false,
        }
    }

    pi == pattern.len() && si == subject.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(s: &str) -> bool {
        validate_subject(s).is_ok()
    }

    #[test]
    fn validation_accepts_plain_subjects() {
        assert!(ok("a"));
        assert!(ok("telemetry.temperature"));
        assert!(ok("factory.line-1.cell_3"));
        assert!(ok("A.B9.c"));
    }

    #[test]
    fn validation_accepts_wildcard_patterns() {
        assert!(ok("*"));
        assert!(ok(">"));
        assert!(ok("a.*.c"));
        assert!(ok("a.>"));
        assert!(ok("*.*.>"));
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(!ok(""));
        assert!(!ok("."));
        assert!(!ok(".a"));
        assert!(!ok("a."));
        assert!(!ok("a..b"));
        assert!(!ok("a b"));
        assert!(!ok("a.#.b"));
    }

    #[test]
    fn validation_rejects_misplaced_or_fused_wildcards() {
        assert!(!ok(">.a"));
        assert!(!ok("a.>.b"));
        assert!(!ok("a>"));
        assert!(!ok("a.b>"));
        assert!(!ok("a.*b"));
    }

    #[test]
    fn validation_length_boundary() {
        // 256 bytes accepted, 257 rejected.
        let long = "a".repeat(MAX_SUBJECT_LEN);
        assert!(ok(&long));
        let too_long = "a".repeat(MAX_SUBJECT_LEN + 1);
        assert!(!ok(&too_long));
    }

    #[test]
    fn match_truth_table() {
        let cases: &[(&str, &str, bool)] = &[
            // exact
            ("a.b.c", "a.b.c", true),
            ("a.b.c", "a.b.d", false),
            ("a.b.c", "a.b", false),
            ("a.b", "a.b.c", false),
            // star: exactly one token, never empty
            ("a.*.c", "a.b.c", true),
            ("a.*.c", "a.x.c", true),
            ("a.*.c", "a.c", false),
            ("a.*.c", "a.b.b.c", false),
            ("*", "a", true),
            ("*", "a.b", false),
            ("*.*", "a.b", true),
            // gt: one-or-more trailing tokens
            ("a.>", "a.b", true),
            ("a.>", "a.b.c.d", true),
            ("a.>", "a", false),
            (">", "a", true),
            (">", "a.b.c", true),
            // mixed
            ("factory.*.temp", "factory.line1.temp", true),
            ("factory.line1.>", "factory.line1.temp", true),
            ("factory.line1.>", "factory.line2.temp", false),
            ("a.*.>", "a.b.c", true),
            ("a.*.>", "a.b", false),
        ];
        for (pattern, subject, expected) in cases {
            assert_eq!(
                matches(pattern, subject),
                *expected,
                "matches({pattern:?}, {subject:?})"
            );
        }
    }
}
