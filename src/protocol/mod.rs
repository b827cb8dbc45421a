//! Protocol module - operation codes, typed operations, error codes.
//!
//! This module implements the pure wire codec:
//! - Operation codes with fixed header sizes and global/stream scope
//! - Typed `Operation` values with Big Endian encode/decode
//! - The error taxonomy carried in FAIL frames
//!
//! No I/O happens here; reading frames off a stream lives in [`crate::stream`].

mod error_code;
mod operation;
mod wire_format;

pub use error_code::ErrorCode;
pub use operation::Operation;
pub use wire_format::{OperationKind, DEFAULT_MAX_TRAILER_LEN, DONE_ENTRY_LEN, MAX_HEADER_LEN};
