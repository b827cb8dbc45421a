//! Built-in situation catalogue.
//!
//! | Id | Depends on |
//! |---|---|
//! | `session.authentication` | |
//! | `session.unauthorized_access` | |
//! | `session.control_stream` | `session.authentication` |
//! | `exchange.message_delivery` | `session.authentication` |
//! | `exchange.request_proceed` | `session.authentication` |
//! | `exchange.request_echo` | `exchange.request_proceed` |
//! | `violation.payload_length_mismatch` | `exchange.request_proceed` |
//! | `violation.order` | `session.authentication` |
//! | `violation.invalid_operation_code` | `session.authentication` |
//! | `violation.request_timeout` | `exchange.request_proceed` |
//! | `session.disconnect` | `session.authentication` |

mod exchange;
mod session;
mod violation;

use std::sync::atomic::{AtomicI16, Ordering};

use bytes::Bytes;

use crate::error::{ProtocolFailure, Result};
use crate::protocol::{ErrorCode, Operation};
use crate::situation::{Outcome, SituationContext, SituationRegistry};
use crate::stream::StreamId;

pub use exchange::{MessageDelivery, RequestEcho, RequestProceed};
pub use session::{Authentication, ControlStream, Disconnect, UnauthorizedAccess};
pub use violation::{InvalidOperationCode, OrderViolation, PayloadLengthMismatch, RequestTimeout};

/// Role of the shared, authenticated connection.
pub const PRIMARY: &str = "primary";

/// Every built-in situation, in declaration order.
pub fn builtin() -> Result<SituationRegistry> {
    let mut registry = SituationRegistry::new();
    registry.register(Authentication)?;
    registry.register(UnauthorizedAccess)?;
    registry.register(ControlStream)?;
    registry.register(MessageDelivery)?;
    registry.register(RequestProceed)?;
    registry.register(RequestEcho)?;
    registry.register(PayloadLengthMismatch)?;
    registry.register(OrderViolation)?;
    registry.register(InvalidOperationCode)?;
    registry.register(RequestTimeout)?;
    registry.register(Disconnect)?;
    Ok(registry)
}

static NEXT_MESSAGE_ID: AtomicI16 = AtomicI16::new(1);

/// Fresh positive message id.
pub(crate) fn next_message_id() -> i16 {
    let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
    if id > 0 {
        id
    } else {
        NEXT_MESSAGE_ID.store(2, Ordering::Relaxed);
        1
    }
}

/// Deterministic payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

/// Flatten a diagnostic result: errors become violations.
pub(crate) fn settle(result: Result<Outcome>) -> Outcome {
    result.unwrap_or_else(Outcome::from)
}

/// [`settle`], then drain the anomalies logged on the `role` connection.
pub(crate) async fn settle_on(ctx: &SituationContext, role: &str, result: Result<Outcome>) -> Outcome {
    let anomalies = ctx.take_anomalies(role).await;
    claim_anomalies(settle(result), role, &anomalies)
}

/// A conformant outcome with anomalies on its connection is a violation.
fn claim_anomalies(outcome: Outcome, role: &str, anomalies: &[ProtocolFailure]) -> Outcome {
    match anomalies.first() {
        Some(first) if !outcome.is_failure() => Outcome::violation(format!(
            "{} anomalies on the {} connection, first: {}",
            anomalies.len(),
            role,
            first
        )),
        _ => outcome,
    }
}

/// Expect `answer` to be a FAIL with `code` naming `stream`.
pub(crate) fn expect_fail(answer: &Operation, stream: StreamId, code: ErrorCode) -> Outcome {
    match answer {
        Operation::Fail {
            target,
            code: actual,
            ..
        } if *target == stream && *actual == code => Outcome::conformant(format!(
            "FAIL {} for stream {}: {}",
            code,
            stream,
            answer.reason().unwrap_or_default()
        )),
        other => Outcome::violation(format!(
            "expected FAIL {} for stream {}, got {:?}",
            code, stream, other
        )),
    }
}

/// Expect `answer` to be a PROCEED naming `stream`.
pub(crate) fn expect_proceed(answer: &Operation, stream: StreamId) -> Option<Outcome> {
    match answer {
        Operation::Proceed { target } if StreamId::from(*target) == stream => None,
        other => Some(Outcome::violation(format!(
            "expected PROCEED for stream {}, got {:?}",
            stream, other
        ))),
    }
}
