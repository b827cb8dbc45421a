//! Session-level situations: handshake, control stream, disconnect.

use crate::correlation::CorrelationKey;
use crate::error::Result;
use crate::protocol::{ErrorCode, Operation};
use crate::situation::{Outcome, Situation, SituationContext};
use crate::BoxFuture;

use super::{expect_fail, next_message_id, payload, settle, settle_on, PRIMARY};

/// The handshake is accepted and the primary connection is usable.
pub struct Authentication;

impl Authentication {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(PRIMARY).await?;
        if !connection.is_usable() {
            return Ok(Outcome::violation("connection not usable after handshake"));
        }
        Ok(Outcome::conformant(format!(
            "accepted {} credentials",
            ctx.config().auth.kind
        )))
    }
}

impl Situation for Authentication {
    fn id(&self) -> &'static str {
        "session.authentication"
    }

    fn name(&self) -> &'static str {
        "Authentication handshake"
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle_on(ctx, PRIMARY, self.run(ctx).await).await })
    }
}

/// MESSAGE before authenticating draws FAIL(UNAUTHORIZED) for that stream.
pub struct UnauthorizedAccess;

impl UnauthorizedAccess {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.unauthenticated("unauthenticated").await?;
        let mut stream = connection.open_unidirectional().await?;
        let message = Operation::Message {
            msg_id: next_message_id(),
            payload_len: 0,
            priority: 0,
        };
        let answer = connection
            .exchange(&mut stream, &message, ctx.await_timeout())
            .await;
        let id = stream.id();
        stream.close().await;
        connection.close();
        Ok(expect_fail(&answer?, id, ErrorCode::Unauthorized))
    }
}

impl Situation for UnauthorizedAccess {
    fn id(&self) -> &'static str {
        "session.unauthorized_access"
    }

    fn name(&self) -> &'static str {
        "Unauthenticated MESSAGE is rejected"
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle(self.run(ctx).await) })
    }
}

/// Global frames arrive on one server-opened control stream.
pub struct ControlStream;

impl ControlStream {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection("control").await?;
        let data = payload(32);

        // Two exchanges, so a second global stream would show up as a conflict.
        let mut waited = Ok(());
        for _ in 0..2 {
            let mut stream = connection.open_unidirectional().await?;
            let done = connection.expect(CorrelationKey::Stream(stream.id()))?;
            stream
                .send(&Operation::Message {
                    msg_id: next_message_id(),
                    payload_len: data.len() as i64,
                    priority: 0,
                })
                .await?;
            stream.send(&Operation::block(data.clone())).await?;
            stream
                .send(&Operation::BlockEnd {
                    total: data.len() as i64,
                })
                .await?;
            waited = done.wait(ctx.await_timeout()).await.map(drop);
            stream.close().await;
            if waited.is_err() {
                break;
            }
        }

        let anomalies = connection.take_anomalies();
        if let Some(first) = anomalies.first() {
            return Ok(Outcome::violation(format!(
                "{} anomalies, first: {}",
                anomalies.len(),
                first
            )));
        }
        waited?;

        let Some(control) = connection.control_stream() else {
            return Ok(Outcome::violation("no control stream discovered"));
        };
        // Server-initiated ids have the low bit set.
        if control & 1 == 0 {
            return Ok(Outcome::violation(format!(
                "control stream {} was opened by the client",
                control
            )));
        }
        Ok(Outcome::conformant(format!("control stream {}", control)))
    }
}

impl Situation for ControlStream {
    fn id(&self) -> &'static str {
        "session.control_stream"
    }

    fn name(&self) -> &'static str {
        "Single global control stream"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle(self.run(ctx).await) })
    }
}

/// DISCONNECT_REQUEST draws DISCONNECT.
pub struct Disconnect;

const DISCONNECT_ROLE: &str = "disconnect";

impl Disconnect {
    async fn run(&self, ctx: &SituationContext) -> Result<Outcome> {
        let connection = ctx.connection(DISCONNECT_ROLE).await?;
        let mut stream = connection.open_unidirectional().await?;
        let request = Operation::DisconnectRequest {
            code: 0,
            grace_ms: 100,
        };

        let waiter = connection.expect(CorrelationKey::Control)?;
        stream.send(&request).await?;
        let answer = waiter.wait(ctx.await_timeout()).await;
        ctx.discard(DISCONNECT_ROLE).await;

        Ok(match answer? {
            Operation::Disconnect => Outcome::conformant("server acknowledged with DISCONNECT"),
            other => Outcome::violation(format!("expected DISCONNECT, got {:?}", other)),
        })
    }
}

impl Situation for Disconnect {
    fn id(&self) -> &'static str {
        "session.disconnect"
    }

    fn name(&self) -> &'static str {
        "Orderly disconnect"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["session.authentication"]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { settle(self.run(ctx).await) })
    }
}
