//! Error codes carried by FAIL frames.

use std::fmt;

use serde::Serialize;

/// Protocol error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum ErrorCode {
    InvalidFormat = 0,
    Unauthorized = 1,
    PayloadLengthMismatch = 2,
    Timeout = 3,
    OrderViolation = 4,
    IllegalStream = 5,
    Cancelled = 6,
    ProtocolViolation = 7,
    InvalidHeader = 8,
    UnknownError = 9,
}

impl ErrorCode {
    const ALL: [ErrorCode; 10] = [
        ErrorCode::InvalidFormat,
        ErrorCode::Unauthorized,
        ErrorCode::PayloadLengthMismatch,
        ErrorCode::Timeout,
        ErrorCode::OrderViolation,
        ErrorCode::IllegalStream,
        ErrorCode::Cancelled,
        ErrorCode::ProtocolViolation,
        ErrorCode::InvalidHeader,
        ErrorCode::UnknownError,
    ];

    /// Look up a code by its numeric value. Unknown values yield `None`.
    pub fn from_i16(value: i16) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    #[inline]
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::PayloadLengthMismatch => "PAYLOAD_LENGTH_MISMATCH",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::OrderViolation => "ORDER_VIOLATION",
            ErrorCode::IllegalStream => "ILLEGAL_STREAM",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::InvalidHeader => "INVALID_HEADER",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_i16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_codes() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_i16(code.as_i16()), Some(code));
        }
        assert_eq!(ErrorCode::from_i16(4), Some(ErrorCode::OrderViolation));
    }

    #[test]
    fn test_lookup_unknown_codes() {
        assert_eq!(ErrorCode::from_i16(10), None);
        assert_eq!(ErrorCode::from_i16(-1), None);
        assert_eq!(ErrorCode::from_i16(i16::MAX), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::Unauthorized.to_string(), "UNAUTHORIZED(1)");
    }
}
