//! Book metadata as the rest of the system sees it.

use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use std::fmt;
use std::str::FromStr;
use time::UtcDateTime;
use uuid::Uuid;

/// SHA-256 digest of a book's stored content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookHash([u8; 32]);
impl BookHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
impl From<[u8; 32]> for BookHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
impl TryFrom<&[u8]> for BookHash {
    type Error = Error;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(<[u8; 32]>::try_from(bytes).or_raise(|| ErrorKind::InvalidData("hash length"))?))
    }
}
impl FromStr for BookHash {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).or_raise(|| ErrorKind::InvalidData("hash"))?;
        Ok(Self(bytes))
    }
}
impl fmt::Display for BookHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
impl fmt::Debug for BookHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BookHash({self})")
    }
}

/// A book in the catalog.
///
/// The row only exists once the content at `path` has been stored, and
/// `path` is assigned by the service, never derived from the title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    /// Object store key of the content, `{owner}/{uuid}`.
    pub path: String,
    pub hash: BookHash,
    pub owner: Uuid,
    /// Stored with second precision.
    pub uploaded_at: UtcDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLOWORLD: &str = "936a185caaa266bb9cbe981e9e05cb78cd732b0b3280eb944412bb6f8f8f07af";

    #[test]
    fn test_hash_hex_round_trip() {
        let hash: BookHash = HELLOWORLD.parse().unwrap();
        assert_eq!(hash.to_string(), HELLOWORLD);
        assert_eq!(format!("{hash:?}"), format!("BookHash({HELLOWORLD})"));
    }

    #[test]
    fn test_hash_rejects_bad_input() {
        assert!("abc".parse::<BookHash>().is_err());
        assert!(BookHash::try_from(&[0u8; 31][..]).is_err());
        assert!(BookHash::try_from(&[0u8; 32][..]).is_ok());
    }
}
