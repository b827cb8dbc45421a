//! Normal exchanges: MESSAGE delivery and REQUEST/RESPONSE.

use bytes::BytesMut;

use crate::correlation::CorrelationKey;
use crate::error::Result;
use crate::protocol::Operation;
use crate::situation::{Outcome, Situation, SituationContext};
use crate::BoxFuture;

use super::{expect_proceed, next_message_id, payload, settle_on, PRIMARY};

/// Payload size used by the exchange situations.
const PAYLOAD_LEN: usize = 96;

/// MESSAGE + BLOCK + BLOCK_END on a unidirectional stream draws DONE.
pub struct MessageDelivery;

impl MessageDelivery {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_unidirectional().await?;
        let id = stream.id();
        let data = payload(PAYLOAD_LEN);

        let waiter = connection.expect(CorrelationKey::Stream(id))?;
        stream
            .send(&Operation::Message {
                msg_id: next_message_id(),
                payload_len: data.len() as i64,
                priority: 0,
            })
            .await?;
        // Two BLOCKs so the server has to reassemble.
        let (head, tail) = data.split_at(data.len() / 2);
        stream.send(&Operation::block(head.to_vec())).await?;
        stream.send(&Operation::block(tail.to_vec())).await?;
        stream
            .send(&Operation::BlockEnd {
                total: data.len() as i64,
            })
            .await?;
        stream.finish().await?;

        Ok(match waiter.wait(ctx.await_timeout()).await? {
            Operation::Done { streams } if streams.contains(&id) => {
                Outcome::conformant(format!("DONE for stream {}", id))
            }
            other => Outcome::violation(format!("expected DONE for stream {}, got {:?}", id, other)),
        })
    }
}

impl Situation for MessageDelivery {
    fn id(&self) -> &'static str {
        "exchange.message_delivery"
    }

    fn name(&self) -> &'static str {
        "MESSAGE delivery"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

fn request(payload_len: usize, timeout_ms: i32) -> Operation {
    let msg_id = next_message_id();
    Operation::Request {
        msg_id,
        response_id: msg_id,
        payload_len: payload_len as i64,
        priority: 0,
        timeout_ms,
    }
}

/// Timeout advertised in REQUEST headers for a normal exchange.
pub(super) fn request_timeout_ms(ctx: &SituationContext) -> i32 {
    i32::try_from(ctx.config().timeouts.await_ms).unwrap_or(i32::MAX)
}

/// REQUEST on a bidirectional stream draws PROCEED.
pub struct RequestProceed;

impl RequestProceed {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_bidirectional().await?;
        let id = stream.id();

        let answer = connection
            .exchange(&mut stream, &request(PAYLOAD_LEN, request_timeout_ms(ctx)), ctx.await_timeout())
            .await?;
        stream.close().await;

        Ok(expect_proceed(&answer, id)
            .unwrap_or_else(|| Outcome::conformant(format!("PROCEED for stream {}", id))))
    }
}

impl Situation for RequestProceed {
    fn id(&self) -> &'static str {
        "exchange.request_proceed"
    }

    fn name(&self) -> &'static str {
        "REQUEST draws PROCEED"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

/// Full REQUEST exchange with the payload echoed back.
///
/// RESPONSE, BLOCKs and BLOCK_END come on the request stream while DONE
/// comes on the control stream, so BLOCK_END and DONE may arrive in either
/// order.
pub struct RequestEcho;

impl RequestEcho {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        let mut stream = connection.open_bidirectional().await?;
        let id = stream.id();
        let data = payload(PAYLOAD_LEN);
        let len = data.len() as i64;
        let timeout = ctx.await_timeout();

        let mut inbound = connection.subscribe(CorrelationKey::Stream(id))?;
        stream.send(&request(data.len(), request_timeout_ms(ctx))).await?;
        if let Some(violation) = expect_proceed(&inbound.next(timeout).await?, id) {
            return Ok(violation);
        }

        stream.send(&Operation::block(data.clone())).await?;
        stream.send(&Operation::BlockEnd { total: len }).await?;

        let mut response = None;
        let mut echoed = BytesMut::new();
        let mut total = None;
        let mut done = false;
        while total.is_none() || !done {
            match inbound.next(timeout).await? {
                Operation::Response { payload: size, start, end } => {
                    if response.replace((size, start, end)).is_some() {
                        return Ok(Outcome::violation("second RESPONSE on the same stream"));
                    }
                }
                Operation::Block { data } => {
                    if response.is_none() {
                        return Ok(Outcome::violation("BLOCK before RESPONSE"));
                    }
                    echoed.extend_from_slice(&data);
                }
                Operation::BlockEnd { total: t } => {
                    if response.is_none() {
                        return Ok(Outcome::violation("BLOCK_END before RESPONSE"));
                    }
                    total = Some(t);
                }
                Operation::Done { streams } if streams.contains(&id) => done = true,
                other => {
                    return Ok(Outcome::violation(format!(
                        "unexpected {:?} on stream {}",
                        other, id
                    )))
                }
            }
        }
        drop(inbound);
        stream.close().await;

        let expected = (len, 0, len as i32);
        if response != Some(expected) {
            return Ok(Outcome::violation(format!(
                "RESPONSE header {:?}, expected {:?}",
                response, expected
            )));
        }
        if echoed[..] != data[..] {
            return Ok(Outcome::violation(format!(
                "echoed {} bytes differ from the {} sent",
                echoed.len(),
                data.len()
            )));
        }
        if total != Some(len) {
            return Ok(Outcome::violation(format!(
                "BLOCK_END total {:?}, expected {}",
                total, len
            )));
        }
        Ok(Outcome::conformant(format!("{} bytes echoed on stream {}", len, id)))
    }
}

impl Situation for RequestEcho {
    fn id(&self) -> &'static str {
        "exchange.request_echo"
    }

    fn name(&self) -> &'static str {
        "REQUEST/RESPONSE echo"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["exchange.request_proceed"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}
