//! Inbound frame classification and dispatch.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::Shared;
use crate::correlation::{CorrelationKey, Resolution};
use crate::error::{FrameError, ProtocolFailure};
use crate::protocol::{Operation, OperationKind};
use crate::stream::StreamId;

/// What a stream reader reports to the demultiplexer.
pub(crate) enum Inbound {
    Frame { stream: StreamId, op: Operation },
    Malformed { stream: StreamId, error: FrameError },
    /// Peer finished the stream on a frame boundary.
    Finished { stream: StreamId },
    /// Read failed below the frame layer (reset, connection loss).
    Failed { stream: StreamId, error: String },
}

pub(crate) async fn demux_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = rx.recv().await {
        match inbound {
            Inbound::Frame { stream, op } => shared.dispatch(stream, op),
            Inbound::Malformed { stream, error } => {
                let failure = ProtocolFailure::Malformed { stream, error };
                shared
                    .registry
                    .fail(CorrelationKey::Stream(stream), failure.clone());
                shared.record(failure);
            }
            Inbound::Finished { stream } => {
                tracing::trace!(stream, "peer finished stream");
            }
            Inbound::Failed { stream, error } => {
                tracing::debug!(stream, %error, "stream read failed");
                shared.registry.fail(
                    CorrelationKey::Stream(stream),
                    ProtocolFailure::TransportLost(format!("stream {}: {}", stream, error)),
                );
            }
        }
    }
}

impl Shared {
    /// Route one inbound operation to its waiter.
    pub(crate) fn dispatch(&self, arrival: StreamId, op: Operation) {
        let kind = op.kind();
        tracing::trace!(stream = arrival, %kind, "inbound");

        if !kind.is_global() {
            if let Some(msg_id) = op.message_id() {
                let key = CorrelationKey::Message(msg_id);
                if self.registry.contains(key) {
                    self.deliver(key, op);
                    return;
                }
            }
            self.deliver(CorrelationKey::Stream(arrival), op);
            return;
        }

        if let Err(conflict) = self.claim_control(arrival, kind) {
            self.record(conflict);
            return;
        }

        if matches!(kind, OperationKind::Disconnect | OperationKind::DisconnectRequest) {
            self.deliver(CorrelationKey::Control, op);
            return;
        }

        for target in op.targets() {
            if !self.is_known(target) {
                self.record(ProtocolFailure::UnknownTarget { target, kind });
                continue;
            }
            self.deliver(CorrelationKey::Stream(target), op.clone());
        }
    }

    /// Check `arrival` against the control stream, establishing it on first sight.
    fn claim_control(&self, arrival: StreamId, kind: OperationKind) -> Result<(), ProtocolFailure> {
        let mut control = self.control.lock();
        match *control {
            Some(established) if established == arrival => Ok(()),
            Some(established) => Err(ProtocolFailure::GlobalStreamConflict {
                established,
                candidate: arrival,
                kind,
            }),
            None => {
                tracing::debug!(stream = arrival, "control stream established");
                *control = Some(arrival);
                Ok(())
            }
        }
    }

    fn deliver(&self, key: CorrelationKey, op: Operation) {
        if let Resolution::Unsolicited(op) = self.registry.resolve(key, op) {
            self.record(ProtocolFailure::Unsolicited {
                key,
                kind: op.kind(),
            });
        }
    }
}
