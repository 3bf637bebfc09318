//! Input validation for untrusted data.
//!
//! Everything a client sends MUST be validated before it reaches a room.

use thiserror::Error;

use queue_core::QueueError;

/// Maximum length for session IDs.
pub const MAX_SESSION_ID_LEN: usize = 64;
/// Maximum length for usernames (characters).
pub const MAX_USERNAME_LEN: usize = 64;
/// Maximum length for board paths.
pub const MAX_BOARD_PATH_LEN: usize = 256;
/// Maximum board angle in degrees.
pub const MAX_ANGLE: u16 = 90;
/// Maximum items in a queue.
pub const MAX_QUEUE_LEN: usize = 500;
/// Maximum WebSocket message size.
pub const MAX_WS_MESSAGE_SIZE: usize = 1_048_576; // 1MB

/// Validation error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Session ID exceeds maximum length.
    #[error("session_id too long (max {MAX_SESSION_ID_LEN} chars)")]
    SessionIdTooLong,
    /// Session ID is empty or contains invalid characters.
    #[error("session_id contains invalid characters")]
    SessionIdInvalidChars,
    /// Username is empty or blank.
    #[error("username must not be empty")]
    UsernameEmpty,
    /// Username exceeds maximum length.
    #[error("username too long (max {MAX_USERNAME_LEN} chars)")]
    UsernameTooLong,
    /// Board path is malformed.
    #[error("invalid board path: {0}")]
    InvalidBoardPath(String),
    /// Angle is out of range.
    #[error("angle {0} out of range (0..={MAX_ANGLE})")]
    AngleOutOfRange(u16),
    /// Queue exceeds maximum length.
    #[error("queue too long (max {MAX_QUEUE_LEN} items)")]
    QueueTooLong,
    /// WebSocket message exceeds maximum size.
    #[error("message too large (max {MAX_WS_MESSAGE_SIZE} bytes)")]
    MessageTooLarge,
}

impl From<ValidationError> for QueueError {
    fn from(err: ValidationError) -> Self {
        QueueError::InvalidInput(err.to_string())
    }
}

/// Check if a character is valid for IDs (ASCII alphanumeric, hyphen, or underscore).
fn is_valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Validate a session ID.
///
/// Valid session IDs:
/// - 1-64 characters
/// - `[A-Za-z0-9_-]` only (UUIDs are valid)
///
/// # Errors
///
/// Returns [`ValidationError::SessionIdTooLong`] if the ID exceeds 64 characters.
/// Returns [`ValidationError::SessionIdInvalidChars`] if the ID is empty or contains invalid characters.
pub fn validate_session_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(ValidationError::SessionIdTooLong);
    }
    if id.is_empty() || !id.chars().all(is_valid_id_char) {
        return Err(ValidationError::SessionIdInvalidChars);
    }
    Ok(())
}

/// Validate a display name.
///
/// # Errors
///
/// Returns [`ValidationError::UsernameEmpty`] for a blank name and
/// [`ValidationError::UsernameTooLong`] past 64 characters.
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.trim().is_empty() {
        return Err(ValidationError::UsernameEmpty);
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(ValidationError::UsernameTooLong);
    }
    Ok(())
}

/// Validate a board path such as `/kilter/1/12/1,2,3/40`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidBoardPath`] unless the path is
/// absolute, at most 256 bytes and free of whitespace.
pub fn validate_board_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::InvalidBoardPath(
            "must start with '/'".to_string(),
        ));
    }
    if path.len() > MAX_BOARD_PATH_LEN {
        return Err(ValidationError::InvalidBoardPath(format!(
            "longer than {MAX_BOARD_PATH_LEN} bytes"
        )));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidBoardPath(
            "contains whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Validate a board angle.
///
/// # Errors
///
/// Returns [`ValidationError::AngleOutOfRange`] above 90 degrees.
pub fn validate_angle(angle: u16) -> Result<(), ValidationError> {
    if angle > MAX_ANGLE {
        return Err(ValidationError::AngleOutOfRange(angle));
    }
    Ok(())
}

/// Validate queue length.
///
/// # Errors
///
/// Returns [`ValidationError::QueueTooLong`] past [`MAX_QUEUE_LEN`] items.
pub fn validate_queue_len(len: usize) -> Result<(), ValidationError> {
    if len > MAX_QUEUE_LEN {
        return Err(ValidationError::QueueTooLong);
    }
    Ok(())
}

/// Validate WebSocket message size.
///
/// # Errors
///
/// Returns [`ValidationError::MessageTooLarge`] if the message exceeds 1MB.
pub fn validate_message_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_WS_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_ids() {
        assert!(validate_session_id("default").is_ok());
        assert!(validate_session_id("my-session_123").is_ok());
        assert!(validate_session_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_session_id(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_invalid_session_ids() {
        assert_eq!(
            validate_session_id(""),
            Err(ValidationError::SessionIdInvalidChars)
        );
        assert_eq!(
            validate_session_id(&"a".repeat(65)),
            Err(ValidationError::SessionIdTooLong)
        );
        assert!(validate_session_id("session with spaces").is_err());
        assert!(validate_session_id("session/path").is_err());
        assert!(validate_session_id("séance").is_err());
    }

    #[test]
    fn test_username_bounds() {
        assert!(validate_username("Ada").is_ok());
        assert_eq!(validate_username("   "), Err(ValidationError::UsernameEmpty));
        assert!(validate_username(&"é".repeat(64)).is_ok());
        assert_eq!(
            validate_username(&"x".repeat(65)),
            Err(ValidationError::UsernameTooLong)
        );
    }

    #[test]
    fn test_board_path() {
        assert!(validate_board_path("/kilter/1/12/1,2,3/40").is_ok());
        assert!(validate_board_path("kilter/1").is_err());
        assert!(validate_board_path("/kilter 1").is_err());
        assert!(validate_board_path(&format!("/{}", "a".repeat(300))).is_err());
    }

    #[test]
    fn test_angle_range() {
        assert!(validate_angle(0).is_ok());
        assert!(validate_angle(90).is_ok());
        assert_eq!(validate_angle(91), Err(ValidationError::AngleOutOfRange(91)));
    }

    #[test]
    fn test_message_size() {
        assert!(validate_message_size(100).is_ok());
        assert!(validate_message_size(MAX_WS_MESSAGE_SIZE).is_ok());
        assert!(validate_message_size(MAX_WS_MESSAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_into_queue_error() {
        let err: QueueError = ValidationError::AngleOutOfRange(120).into();
        assert_eq!(err.code(), "invalid_input");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_id_charset_accepted(id in "[A-Za-z0-9_-]{1,64}") {
                prop_assert!(validate_session_id(&id).is_ok());
            }

            #[test]
            fn prop_session_id_never_panics(id in ".{0,80}") {
                let valid = !id.is_empty()
                    && id.len() <= MAX_SESSION_ID_LEN
                    && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
                prop_assert_eq!(validate_session_id(&id).is_ok(), valid);
            }

            #[test]
            fn prop_angle_bound(angle in any::<u16>()) {
                prop_assert_eq!(validate_angle(angle).is_ok(), angle <= MAX_ANGLE);
            }
        }
    }
}
