//! Deliberate protocol violations the server must reject with FAIL.

use std::time::Duration;

use crate::correlation::CorrelationKey;
use crate::error::Result;
use crate::protocol::{ErrorCode, Operation};
use crate::situation::{Outcome, Situation, SituationContext};
use crate::BoxFuture;

use super::exchange::request_timeout_ms;
use super::{expect_fail, expect_proceed, next_message_id, payload, settle_on, PRIMARY};

/// BLOCK_END total short of the REQUEST's payload length.
pub struct PayloadLengthMismatch;

impl PayloadLengthMismatch {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_bidirectional().await?;
        let id = stream.id();
        let timeout = ctx.await_timeout();
        let sent = payload(8);
        let msg_id = next_message_id();

        let mut inbound = connection.subscribe(CorrelationKey::Stream(id))?;
        stream
            .send(&Operation::Request {
                msg_id,
                response_id: msg_id,
                payload_len: 16,
                priority: 0,
                timeout_ms: request_timeout_ms(ctx),
            })
            .await?;
        if let Some(violation) = expect_proceed(&inbound.next(timeout).await?, id) {
            return Ok(violation);
        }
        stream.send(&Operation::block(sent.clone())).await?;
        stream
            .send(&Operation::BlockEnd {
                total: sent.len() as i64,
            })
            .await?;

        let answer = inbound.next(timeout).await?;
        Ok(expect_fail(&answer, id, ErrorCode::PayloadLengthMismatch))
    }
}

impl Situation for PayloadLengthMismatch {
    fn id(&self) -> &'static str {
        "violation.payload_length_mismatch"
    }

    fn name(&self) -> &'static str {
        "Short payload is rejected"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["exchange.request_proceed"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

/// BLOCK with no header before it.
pub struct OrderViolation;

impl OrderViolation {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_unidirectional().await?;
        let answer = connection
            .exchange(&mut stream, &Operation::block(payload(4)), ctx.await_timeout())
            .await?;
        Ok(expect_fail(&answer, stream.id(), ErrorCode::OrderViolation))
    }
}

impl Situation for OrderViolation {
    fn id(&self) -> &'static str {
        "violation.order"
    }

    fn name(&self) -> &'static str {
        "BLOCK before header is rejected"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

/// Operation code outside the known range.
pub struct InvalidOperationCode;

const UNKNOWN_OPCODE: u8 = 0x7F;

impl InvalidOperationCode {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_unidirectional().await?;
        let id = stream.id();

        let waiter = connection.expect(CorrelationKey::Stream(id))?;
        stream.write(&[UNKNOWN_OPCODE, 0, 0, 0, 0]).await?;
        let answer = waiter.wait(ctx.await_timeout()).await?;
        Ok(expect_fail(&answer, id, ErrorCode::InvalidHeader))
    }
}

impl Situation for InvalidOperationCode {
    fn id(&self) -> &'static str {
        "violation.invalid_operation_code"
    }

    fn name(&self) -> &'static str {
        "Unknown operation code is rejected"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

/// REQUEST whose payload never arrives.
pub struct RequestTimeout;

/// Timeout advertised in the REQUEST header.
const SHORT_TIMEOUT: Duration = Duration::from_millis(100);

impl RequestTimeout {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_bidirectional().await?;
        let id = stream.id();
        let timeout = ctx.await_timeout();
        let msg_id = next_message_id();

        let mut inbound = connection.subscribe(CorrelationKey::Stream(id))?;
        stream
            .send(&Operation::Request {
                msg_id,
                response_id: msg_id,
                payload_len: 8,
                priority: 0,
                timeout_ms: SHORT_TIMEOUT.as_millis() as i32,
            })
            .await?;
        if let Some(violation) = expect_proceed(&inbound.next(timeout).await?, id) {
            return Ok(violation);
        }

        let answer = inbound.next(timeout + SHORT_TIMEOUT).await?;
        Ok(expect_fail(&answer, id, ErrorCode::Timeout))
    }
}

impl Situation for RequestTimeout {
    fn id(&self) -> &'static str {
        "violation.request_timeout"
    }

    fn name(&self) -> &'static str {
        "Stalled REQUEST times out"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["exchange.request_proceed"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}
