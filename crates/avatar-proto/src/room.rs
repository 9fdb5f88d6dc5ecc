//! Room identifier validation.
//!
//! A room id is the streaming account handle the live feed is scoped to.
//! Ids are checked locally before anything is sent to the broadcast service
//! or a feed connection is attempted.

use std::fmt;
use thiserror::Error;

/// Upper bound on handle length accepted by the live platform.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Fragments that show an error string was pasted in place of an id.
const ERROR_MARKERS: &[&str] = &["error", "exception", "traceback"];

/// Whole values that come from serialising a missing value.
const PLACEHOLDER_VALUES: &[&str] = &["undefined", "null", "none", "nan"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("Room ID is empty")]
    Empty,
    #[error("Room ID is longer than {MAX_ROOM_ID_LEN} characters")]
    TooLong,
    #[error("Room ID contains an invalid character: {0:?}")]
    InvalidChar(char),
    #[error("Room ID looks like an error message, not an account id")]
    ErrorText,
}

/// A validated room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Validate operator input.  Surrounding whitespace and a leading `@`
    /// are stripped; the rest must be ASCII letters, digits, `_` or `.`.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        let trimmed = raw.trim();
        let id = trimmed.strip_prefix('@').unwrap_or(trimmed);

        if id.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if id.len() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong);
        }

        let lower = id.to_ascii_lowercase();
        if PLACEHOLDER_VALUES.contains(&lower.as_str())
            || ERROR_MARKERS.iter().any(|m| lower.contains(m))
        {
            return Err(RoomIdError::ErrorText);
        }

        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
        {
            return Err(RoomIdError::InvalidChar(bad));
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_handles() {
        assert_eq!(RoomId::parse("abc123").unwrap().as_str(), "abc123");
        assert_eq!(RoomId::parse("  @some.user_1 ").unwrap().as_str(), "some.user_1");
    }

    #[test]
    fn test_rejects_empty_and_placeholder() {
        assert_eq!(RoomId::parse("   "), Err(RoomIdError::Empty));
        assert_eq!(RoomId::parse("@"), Err(RoomIdError::Empty));
        assert_eq!(RoomId::parse("undefined"), Err(RoomIdError::ErrorText));
        assert_eq!(RoomId::parse("NULL"), Err(RoomIdError::ErrorText));
    }

    #[test]
    fn test_rejects_error_text() {
        assert_eq!(
            RoomId::parse("NetworkError"),
            Err(RoomIdError::ErrorText)
        );
        assert!(RoomId::parse("Error: user offline").is_err());
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert_eq!(RoomId::parse("abc/123"), Err(RoomIdError::InvalidChar('/')));
        assert_eq!(RoomId::parse("a b"), Err(RoomIdError::InvalidChar(' ')));
        assert!(RoomId::parse(&"a".repeat(MAX_ROOM_ID_LEN + 1)).is_err());
    }
}
