//! Object key validation.
//!
//! Keys are treated as `/`-separated paths relative to the bucket (or root
//! directory) of a backend. Validation stops keys from escaping that root.

use crate::error::{ErrorKind, Result};

/// Validates and normalizes an object key.
///
/// Empty and `.` segments are dropped, `..` pops the previous segment. A key
/// that would climb above the root, is empty once normalized, or contains a
/// null byte or backslash is rejected with
/// [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use shelf_storage::validate_path;
/// // Valid keys
/// assert!(validate_path("owner/0190c6f4-book").is_ok());
/// assert!(validate_path("a/../book").is_ok()); // (never leaves the root)
/// // Invalid keys
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Keys get resolved
/// assert_eq!(validate_path("/wrong/.././owner//book/").unwrap(), "owner/book");
/// ```
pub fn validate(key: impl AsRef<str>) -> Result<String> {
    let key = key.as_ref();
    // Backslashes are separators on Windows and ordinary characters on S3;
    // either reading is a footgun for something that should be a plain key.
    if key.contains(['\0', '\\']) {
        exn::bail!(ErrorKind::InvalidPath(key.to_string()));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                if segments.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(key.to_string()));
                }
            },
            s => segments.push(s),
        }
    }
    match segments.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(key.to_string())),
        false => Ok(segments.join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("owner/book", "owner/book")]
    #[case("a/b/c/book.epub", "a/b/c/book.epub")]
    #[case("book", "book")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("a/b/..", "a")]
    #[case("/leading/slash", "leading/slash")]
    #[case("owner///", "owner")]
    fn test_valid_keys(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), expected);
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("../..")]
    #[case("a\0b")]
    #[case("\0")]
    #[case("a\\b")]
    #[case("")]
    #[case(".")]
    #[case("./")]
    #[case("//")]
    fn test_invalid_keys(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
