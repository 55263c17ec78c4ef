//! Opaque pagination cursor
//!
//! A [`Cursor`] is an immutable `(limit, offset)` pair that clients pass back
//! to fetch the next page. On the wire it is the URL-safe base64 encoding of
//! `"limit:offset"`; an empty string means "from the start, default limit".
//!
//! # Example
//!
//! ```rust
//! use acton_repository::cursor::Cursor;
//!
//! let first = Cursor::first_page();
//! let token = first.next_page().serialize();
//!
//! let next = Cursor::unserialize(&token).unwrap();
//! assert_eq!(next.limit(), 20);
//! assert_eq!(next.offset(), 20);
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Limit used when no cursor is given
pub const DEFAULT_CURSOR_LIMIT: u32 = 1000;

/// Limit of a first-page cursor
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Errors decoding a cursor token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// Not valid base64
    #[error("invalid cursor encoding: {0}")]
    Encoding(String),

    /// Decoded text is not `limit:offset`
    #[error("invalid cursor: {0}")]
    Format(String),
}

/// Immutable `(limit, offset)` pagination token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    limit: u32,
    offset: u32,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_LIMIT, 0)
    }
}

impl Cursor {
    /// Create a cursor
    pub const fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// `(20, 0)`
    pub const fn first_page() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, 0)
    }

    /// The following page: same limit, offset advanced by one page
    #[must_use]
    pub fn next_page(&self) -> Self {
        Self::new(self.limit, self.offset.saturating_add(self.limit))
    }

    /// Page size
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Rows to skip
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Encode as an opaque token
    pub fn serialize(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.limit, self.offset))
    }

    /// Decode a token; the empty string yields the default cursor
    pub fn unserialize(token: &str) -> Result<Self, CursorError> {
        if token.is_empty() {
            return Ok(Self::default());
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| CursorError::Encoding(format!("{}: {}", token, e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| CursorError::Encoding(format!("{}: {}", token, e)))?;
        let (limit, offset) = text
            .split_once(':')
            .ok_or_else(|| CursorError::Format(text.clone()))?;
        let limit = limit
            .parse()
            .map_err(|_| CursorError::Format(text.clone()))?;
        let offset = offset
            .parse()
            .map_err(|_| CursorError::Format(text.clone()))?;
        Ok(Self::new(limit, offset))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::unserialize(s)
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Cursor::serialize(self))
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Self::unserialize(&token).map_err(serde::de::Error::custom)
    }
}
