//! NATS-style subject pattern matching, per §4.B.

use crate::errors::SubjectError;

const MAX_SUBJECT_LEN: usize = 256;

/// `matches(pattern, subject) -> bool`.
///
/// Tokens are dot-separated. `*` matches exactly one token. `>` matches
/// one or more tail tokens and is legal only as the final pattern
/// token. Exact string equality is fast-pathed. Empty pattern or
/// subject never matches.
pub fn matches(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() || subject.is_empty() {
        return false;
    }
    if pattern == subject {
        return true;
    }

    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pattern_tokens.len() {
        let ptok = pattern_tokens[pi];

        if ptok == ">" {
            // `>` must be the last pattern token and match one or more
            // remaining subject tokens.
            return pi == pattern_tokens.len() - 1 && si < subject_tokens.len();
        }

        if si >= subject_tokens.len() {
            return false;
        }

        if ptok != "*" && ptok != subject_tokens[si] {
            return false;
        }

        pi += 1;
        si += 1;
    }

    si == subject_tokens.len()
}

/// Validates a subject for use on the publish path: non-empty, at most
/// 256 characters, no leading/trailing dot, no `..`, and characters
/// limited to alphanumeric, `.`, `*`, `>`, `-`, `_` with `>` only at
/// the tail.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() || subject.len() > MAX_SUBJECT_LEN {
        return Err(SubjectError::InvalidSubject);
    }
    if subject.starts_with('.') || subject.ends_with('.') || subject.contains("..") {
        return Err(SubjectError::InvalidSubject);
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return Err(SubjectError::InvalidSubject);
        }
        for ch in tok.chars() {
            let allowed = ch.is_ascii_alphanumeric() || matches!(ch, '*' | '>' | '-' | '_');
            if !allowed {
                return Err(SubjectError::InvalidSubject);
            }
        }
        if tok.contains('>') && (*tok != ">" || i != tokens.len() - 1) {
            return Err(SubjectError::InvalidSubject);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("factory.line1.temp", "factory.line1.temp"));
    }

    #[test]
    fn star_matches_single_token_at_end_middle_and_alone() {
        assert!(matches("factory.line1.*", "factory.line1.temp"));
        assert!(matches("factory.*.temp", "factory.line1.temp"));
        assert!(matches("*", "temp"));
        assert!(!matches("factory.line1.*", "factory.line1.temp.extra"));
        assert!(!matches("*", "a.b"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_trailing_tokens() {
        assert!(matches("commands.dev-1.>", "commands.dev-1.reboot"));
        assert!(matches("commands.dev-1.>", "commands.dev-1.reboot.now"));
        assert!(!matches("commands.dev-1.>", "commands.dev-1"));
    }

    #[test]
    fn tail_wildcard_only_legal_as_last_token() {
        // As a literal pattern (not validated here), `>` in a non-tail
        // position simply never matches — matching is permissive,
        // validation (validate_subject) is what rejects malformed
        // subjects outright.
        assert!(!matches("a.>.b", "a.x.b"));
    }

    #[test]
    fn empty_pattern_or_subject_never_matches() {
        assert!(!matches("", "a.b"));
        assert!(!matches("a.b", ""));
    }

    #[test]
    fn rejects_double_dot_and_leading_trailing_dot() {
        assert!(validate_subject("factory..temp").is_err());
        assert!(validate_subject(".factory.temp").is_err());
        assert!(validate_subject("factory.temp.").is_err());
    }

    #[test]
    fn rejects_length_over_256() {
        let long = "a".repeat(257);
        assert!(validate_subject(&long).is_err());
        let ok = "a".repeat(256);
        assert!(validate_subject(&ok).is_ok());
    }

    #[test]
    fn tail_wildcard_only_at_end_in_validation() {
        assert!(validate_subject("commands.dev-1.>").is_ok());
        assert!(validate_subject("commands.>.extra").is_err());
        assert!(validate_subject("commands.dev->1").is_err());
    }
}
