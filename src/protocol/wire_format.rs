//! Operation codes and fixed header sizes.
//!
//! Every frame starts with a one-byte operation code followed by a fixed
//! header whose size depends only on the code:
//! ```text
//! ┌────────┬──────────────────────┬─────────────────────────┐
//! │ Opcode │ Header               │ Trailer                 │
//! │ 1 byte │ header_len() bytes   │ sized by a header field │
//! └────────┴──────────────────────┴─────────────────────────┘
//! ```
//!
//! Only BLOCK, FAIL and DONE carry a trailer. All multi-byte integers are Big Endian.

use std::fmt;

use serde::Serialize;

use crate::error::FrameError;

/// Largest fixed header of any operation (RESPONSE).
pub const MAX_HEADER_LEN: usize = 20;

/// Default upper bound on a single trailer (16 MiB).
pub const DEFAULT_MAX_TRAILER_LEN: usize = 16 * 1024 * 1024;

/// Size of one DONE entry (an i64 stream id).
pub const DONE_ENTRY_LEN: usize = 8;

/// Operation code carried in the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OperationKind {
    Message = 0x00,
    Request = 0x01,
    Response = 0x02,
    Proceed = 0x03,
    Refuse = 0x04,
    Block = 0x05,
    BlockEnd = 0x06,
    Fail = 0x07,
    Done = 0x08,
    DisconnectRequest = 0x09,
    Disconnect = 0x0A,
}

impl OperationKind {
    /// Every kind, in operation-code order.
    pub const ALL: [OperationKind; 11] = [
        OperationKind::Message,
        OperationKind::Request,
        OperationKind::Response,
        OperationKind::Proceed,
        OperationKind::Refuse,
        OperationKind::Block,
        OperationKind::BlockEnd,
        OperationKind::Fail,
        OperationKind::Done,
        OperationKind::DisconnectRequest,
        OperationKind::Disconnect,
    ];

    /// Look up a kind by its operation code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The operation code byte.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Fixed header length, excluding the opcode byte and any trailer.
    pub fn header_len(self) -> usize {
        match self {
            OperationKind::Message => 11,
            OperationKind::Request => 17,
            OperationKind::Response => 20,
            OperationKind::Proceed => 2,
            OperationKind::Refuse => 2,
            OperationKind::Block => 4,
            OperationKind::BlockEnd => 8,
            OperationKind::Fail => 12,
            OperationKind::Done => 2,
            OperationKind::DisconnectRequest => 6,
            OperationKind::Disconnect => 0,
        }
    }

    /// Global operations are not scoped to the stream that carries them.
    ///
    /// They arrive on the control stream and are correlated with the
    /// stream they name.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            OperationKind::Proceed
                | OperationKind::Refuse
                | OperationKind::Fail
                | OperationKind::Done
                | OperationKind::DisconnectRequest
                | OperationKind::Disconnect
        )
    }

    /// Wire name, as used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Message => "MESSAGE",
            OperationKind::Request => "REQUEST",
            OperationKind::Response => "RESPONSE",
            OperationKind::Proceed => "PROCEED",
            OperationKind::Refuse => "REFUSE",
            OperationKind::Block => "BLOCK",
            OperationKind::BlockEnd => "BLOCK_END",
            OperationKind::Fail => "FAIL",
            OperationKind::Done => "DONE",
            OperationKind::DisconnectRequest => "DISCONNECT_REQUEST",
            OperationKind::Disconnect => "DISCONNECT",
        }
    }

    /// Number of trailer bytes declared by `header`.
    ///
    /// `header` must hold at least `header_len()` bytes (without the opcode).
    pub fn trailer_len(self, header: &[u8]) -> Result<usize, FrameError> {
        let needed = self.header_len();
        if header.len() < needed {
            return Err(FrameError::Truncated {
                kind: self,
                needed,
                available: header.len(),
            });
        }

        let declared = match self {
            OperationKind::Block => {
                i32::from_be_bytes([header[0], header[1], header[2], header[3]]) as i64
            }
            OperationKind::Fail => i16::from_be_bytes([header[10], header[11]]) as i64,
            OperationKind::Done => {
                i16::from_be_bytes([header[0], header[1]]) as i64 * DONE_ENTRY_LEN as i64
            }
            _ => return Ok(0),
        };

        if declared < 0 {
            return Err(FrameError::NegativeLength {
                kind: self,
                value: declared,
            });
        }
        Ok(declared as usize)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_contiguous() {
        for (i, kind) in OperationKind::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, i);
            assert_eq!(OperationKind::from_code(i as u8), Some(*kind));
        }
        assert_eq!(OperationKind::from_code(0x0B), None);
        assert_eq!(OperationKind::from_code(0xFF), None);
    }

    #[test]
    fn test_global_scope() {
        let global: Vec<_> = OperationKind::ALL
            .iter()
            .filter(|k| k.is_global())
            .map(|k| k.name())
            .collect();
        assert_eq!(
            global,
            ["PROCEED", "REFUSE", "FAIL", "DONE", "DISCONNECT_REQUEST", "DISCONNECT"]
        );
    }

    #[test]
    fn test_max_header_len() {
        let max = OperationKind::ALL.iter().map(|k| k.header_len()).max();
        assert_eq!(max, Some(MAX_HEADER_LEN));
    }

    #[test]
    fn test_trailer_len_block() {
        assert_eq!(OperationKind::Block.trailer_len(&[0, 0, 1, 0]), Ok(256));
        assert_eq!(
            OperationKind::Block.trailer_len(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(FrameError::NegativeLength {
                kind: OperationKind::Block,
                value: -1
            })
        );
    }

    #[test]
    fn test_trailer_len_fail_and_done() {
        let mut fail = [0u8; 12];
        fail[11] = 5;
        assert_eq!(OperationKind::Fail.trailer_len(&fail), Ok(5));
        assert_eq!(OperationKind::Done.trailer_len(&[0, 3]), Ok(24));
    }

    #[test]
    fn test_trailer_len_short_header() {
        let err = OperationKind::Fail.trailer_len(&[0; 4]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { needed: 12, available: 4, .. }));
    }

    #[test]
    fn test_fixed_kinds_have_no_trailer() {
        assert_eq!(OperationKind::Message.trailer_len(&[0; 11]), Ok(0));
        assert_eq!(OperationKind::Disconnect.trailer_len(&[]), Ok(0));
    }
}
