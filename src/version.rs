//! Lenient version parsing.
//!
//! Catalog and runtime versions are dotted numbers that are not always full
//! semver triples (`"1.0"`, `"9"`, `"2.0.1.post1"`). They are normalized to
//! `semver::Version` by padding missing components with zero and dropping
//! anything past the third numeric component.

use semver::Version;

/// Parse a dotted version string, padding missing components with zero.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    if raw.is_empty() {
        return None;
    }

    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }

    let mut parts = [0u64; 3];
    for (i, part) in raw.split('.').take(3).enumerate() {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            // "1.x" or "abc": only tolerate junk after the first component
            if i == 0 {
                return None;
            }
            break;
        }
        parts[i] = digits.parse().ok()?;
        if digits.len() != part.len() {
            break;
        }
    }

    Some(Version::new(parts[0], parts[1], parts[2]))
}

/// Compare two version strings. Unparsable strings sort below parsable ones.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_parse_full_and_partial() {
        assert_eq!(parse_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("1.0"), Some(Version::new(1, 0, 0)));
        assert_eq!(parse_version("9"), Some(Version::new(9, 0, 0)));
        assert_eq!(parse_version("v2.1"), Some(Version::new(2, 1, 0)));
    }

    #[test]
    fn test_parse_trailing_junk() {
        assert_eq!(parse_version("2.0.1.post1"), Some(Version::new(2, 0, 1)));
        assert_eq!(parse_version("1.26rc1"), Some(Version::new(1, 26, 0)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("latest"), None);
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "bogus"), Ordering::Greater);
    }
}
