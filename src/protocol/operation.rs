//! Typed operations and their wire encoding.
//!
//! Uses `bytes::Bytes` for zero-copy sharing of BLOCK payloads and FAIL reasons.
//!
//! # Example
//!
//! ```
//! use wireprobe::protocol::{Operation, OperationKind};
//!
//! let op = Operation::Message { msg_id: 1, payload_len: 0, priority: 0 };
//! assert_eq!(&op.encode()[..], &[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
//!
//! let frame = op.encode_frame();
//! assert_eq!(frame[0], OperationKind::Message.code());
//! assert_eq!(Operation::decode_frame(&frame).unwrap(), op);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error_code::ErrorCode;
use super::wire_format::{OperationKind, DONE_ENTRY_LEN};
use crate::error::FrameError;
use crate::stream::StreamId;

/// One protocol operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// One-way message header; the payload follows as BLOCK frames.
    Message {
        msg_id: i16,
        payload_len: i64,
        priority: i8,
    },
    /// Request header; the server answers with PROCEED or REFUSE.
    Request {
        msg_id: i16,
        response_id: i16,
        payload_len: i64,
        priority: i8,
        timeout_ms: i32,
    },
    /// Response header on a request stream.
    Response { payload: i64, start: i64, end: i32 },
    /// Server is ready to receive the payload of `target`.
    Proceed { target: i16 },
    /// Server declines the request on `target`.
    Refuse { target: i16 },
    /// A chunk of payload.
    Block { data: Bytes },
    /// End of the BLOCK sequence, with the total byte count.
    BlockEnd { total: i64 },
    /// Error report for a stream.
    Fail {
        target: StreamId,
        code: ErrorCode,
        reason: Bytes,
    },
    /// Streams whose exchange completed.
    Done { streams: Vec<StreamId> },
    /// Ask the peer to wind down the session.
    DisconnectRequest { code: i16, grace_ms: i32 },
    /// The session is ending.
    Disconnect,
}

impl Operation {
    /// Create a BLOCK frame from any byte source.
    pub fn block(data: impl Into<Bytes>) -> Self {
        Operation::Block { data: data.into() }
    }

    /// Create a FAIL frame with a UTF-8 reason.
    pub fn fail(target: StreamId, code: ErrorCode, reason: &str) -> Self {
        Operation::Fail {
            target,
            code,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Message { .. } => OperationKind::Message,
            Operation::Request { .. } => OperationKind::Request,
            Operation::Response { .. } => OperationKind::Response,
            Operation::Proceed { .. } => OperationKind::Proceed,
            Operation::Refuse { .. } => OperationKind::Refuse,
            Operation::Block { .. } => OperationKind::Block,
            Operation::BlockEnd { .. } => OperationKind::BlockEnd,
            Operation::Fail { .. } => OperationKind::Fail,
            Operation::Done { .. } => OperationKind::Done,
            Operation::DisconnectRequest { .. } => OperationKind::DisconnectRequest,
            Operation::Disconnect => OperationKind::Disconnect,
        }
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.kind().is_global()
    }

    /// Message id of MESSAGE and REQUEST headers.
    pub fn message_id(&self) -> Option<i16> {
        match self {
            Operation::Message { msg_id, .. } | Operation::Request { msg_id, .. } => Some(*msg_id),
            _ => None,
        }
    }

    /// Streams named by a global operation.
    ///
    /// Empty for stream-scoped operations and for the DISCONNECT pair.
    pub fn targets(&self) -> Vec<StreamId> {
        match self {
            Operation::Proceed { target } | Operation::Refuse { target } => {
                vec![StreamId::from(*target)]
            }
            Operation::Fail { target, .. } => vec![*target],
            Operation::Done { streams } => streams.clone(),
            _ => Vec::new(),
        }
    }

    /// FAIL reason as text, lossily decoded.
    pub fn reason(&self) -> Option<String> {
        match self {
            Operation::Fail { reason, .. } => Some(String::from_utf8_lossy(reason).into_owned()),
            _ => None,
        }
    }

    /// Encode header and trailer, without the opcode byte.
    ///
    /// Encoding is total: a trailer longer than its length field can express
    /// is cut at the field's maximum, so the output always decodes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.kind().header_len() + self.trailer_hint());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode a complete frame: opcode byte, header and trailer.
    pub fn encode_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.kind().header_len() + self.trailer_hint());
        buf.put_u8(self.kind().code());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn trailer_hint(&self) -> usize {
        match self {
            Operation::Block { data } => data.len(),
            Operation::Fail { reason, .. } => reason.len(),
            Operation::Done { streams } => streams.len() * DONE_ENTRY_LEN,
            _ => 0,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Operation::Message {
                msg_id,
                payload_len,
                priority,
            } => {
                buf.put_i16(*msg_id);
                buf.put_i64(*payload_len);
                buf.put_i8(*priority);
            }
            Operation::Request {
                msg_id,
                response_id,
                payload_len,
                priority,
                timeout_ms,
            } => {
                buf.put_i16(*msg_id);
                buf.put_i16(*response_id);
                buf.put_i64(*payload_len);
                buf.put_i8(*priority);
                buf.put_i32(*timeout_ms);
            }
            Operation::Response {
                payload,
                start,
                end,
            } => {
                buf.put_i64(*payload);
                buf.put_i64(*start);
                buf.put_i32(*end);
            }
            Operation::Proceed { target } | Operation::Refuse { target } => {
                buf.put_i16(*target);
            }
            Operation::Block { data } => {
                let len = data.len().min(i32::MAX as usize);
                buf.put_i32(len as i32);
                buf.put_slice(&data[..len]);
            }
            Operation::BlockEnd { total } => {
                buf.put_i64(*total);
            }
            Operation::Fail {
                target,
                code,
                reason,
            } => {
                let len = reason.len().min(i16::MAX as usize);
                buf.put_i64(*target);
                buf.put_i16(code.as_i16());
                buf.put_i16(len as i16);
                buf.put_slice(&reason[..len]);
            }
            Operation::Done { streams } => {
                let count = streams.len().min(i16::MAX as usize);
                buf.put_i16(count as i16);
                for stream in &streams[..count] {
                    buf.put_i64(*stream);
                }
            }
            Operation::DisconnectRequest { code, grace_ms } => {
                buf.put_i16(*code);
                buf.put_i32(*grace_ms);
            }
            Operation::Disconnect => {}
        }
    }

    /// Decode header and trailer of a known kind (no opcode byte).
    ///
    /// `bytes` must hold exactly the header plus the trailer it declares.
    /// DONE is the exception: its entries are every whole 8-byte group after
    /// the header, whatever count the header carries.
    pub fn decode(kind: OperationKind, bytes: &[u8]) -> Result<Self, FrameError> {
        let trailer = kind.trailer_len(bytes)?;
        if kind == OperationKind::Done {
            return Self::decode_done(bytes);
        }
        let needed = kind.header_len() + trailer;
        if bytes.len() < needed {
            return Err(FrameError::Truncated {
                kind,
                needed,
                available: bytes.len(),
            });
        }
        if bytes.len() > needed {
            return Err(FrameError::TrailingBytes {
                kind,
                extra: bytes.len() - needed,
            });
        }

        let mut buf = bytes;
        let op = match kind {
            OperationKind::Message => Operation::Message {
                msg_id: buf.get_i16(),
                payload_len: buf.get_i64(),
                priority: buf.get_i8(),
            },
            OperationKind::Request => Operation::Request {
                msg_id: buf.get_i16(),
                response_id: buf.get_i16(),
                payload_len: buf.get_i64(),
                priority: buf.get_i8(),
                timeout_ms: buf.get_i32(),
            },
            OperationKind::Response => Operation::Response {
                payload: buf.get_i64(),
                start: buf.get_i64(),
                end: buf.get_i32(),
            },
            OperationKind::Proceed => Operation::Proceed {
                target: buf.get_i16(),
            },
            OperationKind::Refuse => Operation::Refuse {
                target: buf.get_i16(),
            },
            OperationKind::Block => {
                buf.advance(4);
                Operation::Block {
                    data: Bytes::copy_from_slice(buf),
                }
            }
            OperationKind::BlockEnd => Operation::BlockEnd {
                total: buf.get_i64(),
            },
            OperationKind::Fail => {
                let target = buf.get_i64();
                let raw = buf.get_i16();
                let code = ErrorCode::from_i16(raw).ok_or(FrameError::UnknownErrorCode(raw))?;
                buf.advance(2);
                Operation::Fail {
                    target,
                    code,
                    reason: Bytes::copy_from_slice(buf),
                }
            }
            OperationKind::Done => return Self::decode_done(bytes),
            OperationKind::DisconnectRequest => Operation::DisconnectRequest {
                code: buf.get_i16(),
                grace_ms: buf.get_i32(),
            },
            OperationKind::Disconnect => Operation::Disconnect,
        };
        Ok(op)
    }

    fn decode_done(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut entries = &bytes[OperationKind::Done.header_len()..];
        let partial = entries.len() % DONE_ENTRY_LEN;
        if partial != 0 {
            return Err(FrameError::Truncated {
                kind: OperationKind::Done,
                needed: bytes.len() + DONE_ENTRY_LEN - partial,
                available: bytes.len(),
            });
        }
        let mut streams = Vec::with_capacity(entries.len() / DONE_ENTRY_LEN);
        while entries.has_remaining() {
            streams.push(entries.get_i64());
        }
        Ok(Operation::Done { streams })
    }

    /// Decode a complete frame, dispatching on its opcode byte.
    pub fn decode_frame(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&code, body) = bytes.split_first().ok_or(FrameError::Empty)?;
        let kind = OperationKind::from_code(code).ok_or(FrameError::UnknownOpcode(code))?;
        Self::decode(kind, body)
    }

    /// Decode a complete frame that must be of `expected` kind.
    pub fn decode_frame_as(expected: OperationKind, bytes: &[u8]) -> Result<Self, FrameError> {
        let (&code, body) = bytes.split_first().ok_or(FrameError::Truncated {
            kind: expected,
            needed: 1 + expected.header_len(),
            available: 0,
        })?;
        let found = OperationKind::from_code(code).ok_or(FrameError::UnknownOpcode(code))?;
        if found != expected {
            return Err(FrameError::WrongVariant { expected, found });
        }
        Self::decode(expected, body)
    }
}
