//! Scripted reference server over the in-memory transport.
//!
//! Behaves as a conformant server unless a [`Behaviour`] flag tells it to
//! misbehave in one specific way.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Mutex;

use wireprobe::auth::{AuthPayload, AuthReply, JsonHandshake};
use wireprobe::transport::{MemoryConnector, MemorySession, RawStream, Transport};
use wireprobe::{
    situations, Direction, Engine, ErrorCode, Operation, ProbeConfig, ProbeError, Report,
    SituationContext, SituationRegistry, Stream, StreamId,
};

pub const TOKEN: &str = "s3cret";

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Ways the reference server can deviate from the protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behaviour {
    /// Refuse every handshake.
    pub reject_auth: bool,
    /// Never send DONE.
    pub skip_done: bool,
    /// Flip one byte of every echoed payload.
    pub corrupt_echo: bool,
    /// Ignore protocol violations instead of answering with FAIL.
    pub silent_on_violations: bool,
    /// Send DONE on a second server stream instead of the control stream.
    pub stray_done_stream: bool,
    /// After each echo, repeat DONE and send a FAIL nobody asked for.
    pub late_frames_after_echo: bool,
}

/// Spawn a server that serves every session the returned connector creates.
pub fn spawn_server(behaviour: Behaviour) -> MemoryConnector {
    spawn_server_for(behaviour, usize::MAX)
}

/// Spawn a server that accepts `sessions` sessions, then stops listening.
pub fn spawn_server_for(behaviour: Behaviour, sessions: usize) -> MemoryConnector {
    let (connector, mut incoming) = MemoryConnector::new();
    tokio::spawn(async move {
        for _ in 0..sessions {
            let Some(session) = incoming.recv().await else {
                break;
            };
            tokio::spawn(serve_session(session, behaviour));
        }
    });
    connector
}

/// Probe configuration matching the reference server, with short timeouts.
pub fn config() -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.auth.token = TOKEN.to_string();
    config.timeouts.await_ms = 500;
    config.timeouts.read_ms = 500;
    config
}

pub async fn run(behaviour: Behaviour, config: ProbeConfig) -> Report {
    run_registry(behaviour, config, situations::builtin().unwrap()).await
}

pub async fn run_registry(
    behaviour: Behaviour,
    config: ProbeConfig,
    registry: SituationRegistry,
) -> Report {
    let authenticator = JsonHandshake::new(config.timeouts.read());
    let context = SituationContext::new(
        config,
        Arc::new(spawn_server(behaviour)),
        Arc::new(authenticator),
    );
    Engine::new(registry, context).run().await.unwrap()
}

struct Session {
    transport: MemorySession,
    control: Mutex<Stream>,
    authenticated: AtomicBool,
    behaviour: Behaviour,
}

impl Session {
    async fn send_global(&self, op: Operation) {
        if self.behaviour.stray_done_stream && matches!(op, Operation::Done { .. }) {
            if let Ok(raw) = self.transport.open_unidirectional().await {
                let _ = Stream::new(raw).send(&op).await;
            }
            return;
        }
        let _ = self.control.lock().await.send(&op).await;
    }

    async fn fail(&self, target: StreamId, code: ErrorCode, reason: &str) {
        if self.behaviour.silent_on_violations && code != ErrorCode::Unauthorized {
            return;
        }
        self.send_global(Operation::fail(target, code, reason)).await;
    }

    async fn done(&self, stream: StreamId) {
        if !self.behaviour.skip_done {
            self.send_global(Operation::Done {
                streams: vec![stream],
            })
            .await;
        }
    }
}

async fn serve_session(transport: MemorySession, behaviour: Behaviour) {
    let Ok(control) = transport.open_unidirectional().await else {
        return;
    };
    let session = Arc::new(Session {
        transport,
        control: Mutex::new(Stream::new(control)),
        authenticated: AtomicBool::new(false),
        behaviour,
    });

    let mut handshake_pending = true;
    while let Ok(raw) = session.transport.accept_peer_stream().await {
        let session = Arc::clone(&session);
        if handshake_pending && raw.direction == Direction::Bidirectional {
            handshake_pending = false;
            tokio::spawn(async move {
                if let Err(e) = handshake(&session, raw).await {
                    tracing::debug!(error = %e, "handshake failed");
                }
            });
        } else {
            tokio::spawn(async move { serve_stream(&session, Stream::new(raw)).await });
        }
    }
}

async fn handshake(session: &Session, raw: RawStream) -> Result<(), ProbeError> {
    let mut stream = Stream::new(raw);
    let len = stream.read_exact(4, READ_TIMEOUT).await?.get_u32() as usize;
    let payload: AuthPayload = serde_json::from_slice(&stream.read_exact(len, READ_TIMEOUT).await?)?;

    let accepted = !session.behaviour.reject_auth && payload.token == TOKEN;
    let reply = AuthReply {
        accepted,
        reason: (!accepted).then(|| "invalid credentials".to_string()),
    };
    session.authenticated.store(accepted, Ordering::SeqCst);

    let body = serde_json::to_vec(&reply)?;
    stream.write(&(body.len() as u32).to_be_bytes()).await?;
    stream.write(&body).await?;
    stream.finish().await
}

/// Read BLOCKs until BLOCK_END. `None` if the stream ends or breaks first.
async fn collect(stream: &mut Stream) -> Option<(Bytes, i64)> {
    let mut data = BytesMut::new();
    loop {
        match stream.read_operation().await {
            Ok(Some(Operation::Block { data: chunk })) => data.extend_from_slice(&chunk),
            Ok(Some(Operation::BlockEnd { total })) => return Some((data.freeze(), total)),
            _ => return None,
        }
    }
}

async fn serve_stream(session: &Session, mut stream: Stream) {
    let id = stream.id();
    let first = match stream.read_operation().await {
        Ok(Some(op)) => op,
        Ok(None) => return,
        Err(ProbeError::Frame(e)) => {
            session.fail(id, ErrorCode::InvalidHeader, &e.to_string()).await;
            return;
        }
        Err(_) => return,
    };

    if !session.authenticated.load(Ordering::SeqCst) {
        session.fail(id, ErrorCode::Unauthorized, "not authenticated").await;
        return;
    }

    match first {
        Operation::Message { payload_len, .. } => {
            let Some((data, total)) = collect(&mut stream).await else {
                return;
            };
            if total != payload_len || data.len() as i64 != payload_len {
                session
                    .fail(id, ErrorCode::PayloadLengthMismatch, "payload length mismatch")
                    .await;
                return;
            }
            session.done(id).await;
        }
        Operation::Request {
            payload_len,
            timeout_ms,
            ..
        } => {
            session.send_global(Operation::Proceed { target: id as i16 }).await;
            let limit = Duration::from_millis(timeout_ms.max(0) as u64);
            let Ok(collected) = tokio::time::timeout(limit, collect(&mut stream)).await else {
                session.fail(id, ErrorCode::Timeout, "payload not received in time").await;
                return;
            };
            let Some((data, total)) = collected else {
                return;
            };
            if total != payload_len || data.len() as i64 != payload_len {
                session
                    .fail(id, ErrorCode::PayloadLengthMismatch, "payload length mismatch")
                    .await;
                return;
            }

            let mut echo = data.to_vec();
            if session.behaviour.corrupt_echo {
                if let Some(first) = echo.first_mut() {
                    *first ^= 0xFF;
                }
            }
            let len = data.len() as i64;
            let _ = stream
                .send(&Operation::Response {
                    payload: len,
                    start: 0,
                    end: len as i32,
                })
                .await;
            let _ = stream.send(&Operation::block(echo)).await;
            let _ = stream.send(&Operation::BlockEnd { total: len }).await;
            session.done(id).await;

            if session.behaviour.late_frames_after_echo {
                tokio::time::sleep(Duration::from_millis(50)).await;
                session
                    .send_global(Operation::Done { streams: vec![id] })
                    .await;
                session
                    .send_global(Operation::fail(id, ErrorCode::UnknownError, "late"))
                    .await;
            }
        }
        Operation::DisconnectRequest { grace_ms, .. } => {
            session.send_global(Operation::Disconnect).await;
            tokio::time::sleep(Duration::from_millis(grace_ms.max(0) as u64)).await;
        }
        Operation::Block { .. } | Operation::BlockEnd { .. } => {
            session
                .fail(id, ErrorCode::OrderViolation, "payload before header")
                .await;
        }
        _ => {
            session
                .fail(id, ErrorCode::ProtocolViolation, "unexpected operation")
                .await;
        }
    }
}
