//! Email address normalization for backend lookup keys.
//!
//! User-supplied keys arrive from the MTA with arbitrary casing, stray
//! whitespace, and occasionally invisible Unicode. Normalization happens
//! here, before a key is interpolated into a backend URL; anything that
//! fails validation is treated by callers as "no result", never as an error.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SanitizeError;

/// Allowed characters for the local part after lowercasing.
static LOCAL_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("local part pattern is valid"));

/// Characters stripped from the ends of the input: ASCII whitespace and
/// control bytes, DEL, and the common zero-width code points.
fn is_invisible(c: char) -> bool {
    let code = c as u32;
    code < 0x21
        || code == 0x7F
        || c == '\u{200B}'
        || c == '\u{200C}'
        || c == '\u{200D}'
        || c == '\u{FEFF}'
}

/// Normalize and validate an email address.
///
/// Lowercases, trims surrounding invisible characters, requires exactly one
/// `@`, optionally truncates the local part at the first occurrence of the
/// recipient `delimiter`, and validates the local part character set.
///
/// The result is idempotent: feeding a sanitized address back in returns it
/// unchanged.
///
/// # Errors
///
/// - [`SanitizeError::InvalidFormat`] for empty input or a wrong `@` count.
/// - [`SanitizeError::InvalidLocalPart`] when the local part is empty after
///   truncation or contains disallowed characters.
pub fn sanitize(email: &str, delimiter: Option<&str>) -> Result<String, SanitizeError> {
    let email = email.to_lowercase();
    let email = email.trim_matches(is_invisible);

    let mut parts = email.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => {
            return Err(SanitizeError::InvalidFormat {
                email: email.to_string(),
            });
        }
    };

    let local = match delimiter.filter(|d| !d.is_empty()) {
        Some(delimiter) => local.split(delimiter).next().unwrap_or(""),
        None => local,
    };

    if local.is_empty() || !LOCAL_PART_RE.is_match(local) {
        return Err(SanitizeError::InvalidLocalPart {
            local_part: local.to_string(),
        });
    }

    Ok(format!("{local}@{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_and_trims() {
        assert_eq!(
            sanitize("  User@Example.COM \t", None).unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_strips_zero_width_characters() {
        assert_eq!(
            sanitize("\u{FEFF}user@example.com\u{200B}", None).unwrap(),
            "user@example.com"
        );
        assert_eq!(
            sanitize("user@example.com\u{200C}\u{200D}", None).unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_delimiter_truncates_local_part() {
        assert_eq!(
            sanitize("  User+tag@Example.COM\u{200B}", Some("+")).unwrap(),
            "user@example.com"
        );
        assert_eq!(
            sanitize("user+a+b@example.com", Some("+")).unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_plus_rejected_without_delimiter() {
        let err = sanitize("  User+tag@Example.COM\u{200B}", None).unwrap_err();
        assert!(matches!(err, SanitizeError::InvalidLocalPart { .. }));
    }

    #[test]
    fn test_empty_local_part_after_truncation() {
        let err = sanitize("+tag@example.com", Some("+")).unwrap_err();
        assert_eq!(
            err,
            SanitizeError::InvalidLocalPart {
                local_part: String::new()
            }
        );
    }

    #[test]
    fn test_wrong_at_count() {
        assert!(matches!(
            sanitize("no-at-sign", None).unwrap_err(),
            SanitizeError::InvalidFormat { .. }
        ));
        assert!(matches!(
            sanitize("a@b@c", None).unwrap_err(),
            SanitizeError::InvalidFormat { .. }
        ));
        assert!(matches!(
            sanitize("", None).unwrap_err(),
            SanitizeError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn test_disallowed_local_characters() {
        for input in ["us er@example.com", "user!@example.com", "üser@example.com"] {
            assert!(matches!(
                sanitize(input, None).unwrap_err(),
                SanitizeError::InvalidLocalPart { .. }
            ));
        }
    }

    #[test]
    fn test_allowed_local_characters() {
        assert_eq!(
            sanitize("first.last_name-x9@example.com", None).unwrap(),
            "first.last_name-x9@example.com"
        );
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "  User+tag@Example.COM",
            "mixed.Case_Address@Example.org",
            "plain@example.com",
        ];
        for input in inputs {
            let once = sanitize(input, Some("+")).unwrap();
            let twice = sanitize(&once, Some("+")).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_empty_delimiter_is_ignored() {
        assert_eq!(
            sanitize("user@example.com", Some("")).unwrap(),
            "user@example.com"
        );
    }
}
