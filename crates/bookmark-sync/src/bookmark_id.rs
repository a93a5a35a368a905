//! BookmarkId: Opaque identifier for a bookmark.
//!
//! Ids are generated independently on every device from a uuid v4, so two
//! devices never coordinate. Collisions are treated as negligible; nothing
//! enforces that across devices.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BookmarkIdError {
    #[error("Invalid bookmark ID: must be non-empty and contain no whitespace")]
    InvalidFormat,
}

/// A globally unique bookmark identifier.
///
/// Treated as an opaque string: ids written by other clients are accepted as
/// long as they are non-empty and free of whitespace (the document format
/// stores them inside a single-line comment).
///
/// # Examples
/// ```
/// use bookmark_sync::BookmarkId;
///
/// let id = BookmarkId::generate();
/// let parsed: BookmarkId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BookmarkId(String);

impl BookmarkId {
    /// Generate a new random id (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BookmarkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BookmarkId {
    type Err = BookmarkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(BookmarkIdError::InvalidFormat);
        }
        Ok(Self(s.to_string()))
    }
}

impl serde::Serialize for BookmarkId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for BookmarkId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
