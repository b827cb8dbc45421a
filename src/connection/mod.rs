//! Connection to the server under test.
//!
//! A [`Connection`] owns one transport session and runs three kinds of task:
//! - an acceptor, which picks up every stream the peer opens
//! - one reader per readable stream, parsing frames in arrival order
//! - a single demultiplexer, which classifies each frame and resolves the
//!   waiter correlated with it
//!
//! Frames from all readers funnel through one channel into the
//! demultiplexer, so classification and dispatch are serialized.
//!
//! # Example
//!
//! ```ignore
//! let connection = Connection::connect(&QuicConnector::new(), &config, "primary").await?;
//! connection.authenticate(&JsonHandshake::new(config.timeouts.read()), &config.auth_payload()?).await?;
//!
//! let mut stream = connection.open_bidirectional().await?;
//! let request = Operation::Request { msg_id: 1, response_id: 1, payload_len: 0, priority: 0, timeout_ms: 1000 };
//! let answer = connection.exchange(&mut stream, &request, config.timeouts.await_operation()).await?;
//! ```

mod demux;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::auth::{AuthPayload, Authenticator};
use crate::config::{GlobalStreamRule, ProbeConfig};
use crate::correlation::{CorrelationKey, Registry, Subscription, Waiter};
use crate::error::{ProbeError, ProtocolFailure, Result};
use crate::protocol::Operation;
use crate::stream::{Stream, StreamId, StreamReader};
use crate::transport::{Connector, RawStream, Transport};

use demux::Inbound;

/// Ids this connection has seen, and which of them are still open.
#[derive(Default)]
struct StreamTable {
    known: HashSet<StreamId>,
    open: HashSet<StreamId>,
    readers: HashMap<StreamId, AbortHandle>,
}

/// State shared between the connection handle and its tasks.
pub(crate) struct Shared {
    registry: Arc<Registry>,
    streams: Mutex<StreamTable>,
    control: Mutex<Option<StreamId>>,
    anomalies: Mutex<Vec<ProtocolFailure>>,
    lost: AtomicBool,
    closing: AtomicBool,
    inbound: mpsc::UnboundedSender<Inbound>,
    max_trailer_len: usize,
}

impl Shared {
    /// Record a newly opened or accepted stream id.
    fn track(&self, id: StreamId) -> Result<()> {
        let mut streams = self.streams.lock();
        if !streams.known.insert(id) {
            return Err(ProbeError::StreamIdReused(id));
        }
        streams.open.insert(id);
        Ok(())
    }

    fn is_known(&self, id: StreamId) -> bool {
        self.streams.lock().known.contains(&id)
    }

    /// Refuse waits keyed on a stream whose handle is gone.
    fn check_waitable(&self, key: CorrelationKey) -> Result<()> {
        if let CorrelationKey::Stream(id) = key {
            let streams = self.streams.lock();
            if streams.known.contains(&id) && !streams.open.contains(&id) {
                return Err(ProbeError::StreamReleased(id));
            }
        }
        Ok(())
    }

    /// Stream handle released: stop its reader and withdraw waits on it.
    ///
    /// The id stays known so late global frames naming it are not reported
    /// as unknown targets.
    fn release(&self, id: StreamId) {
        let reader = {
            let mut streams = self.streams.lock();
            streams.open.remove(&id);
            streams.readers.remove(&id)
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        if self.registry.cancel(CorrelationKey::Stream(id)) {
            tracing::debug!(stream = id, "pending wait cancelled by close");
        }
    }

    fn record(&self, failure: ProtocolFailure) {
        tracing::warn!(%failure, "protocol anomaly");
        self.anomalies.lock().push(failure);
    }

    /// Spawn a task that parses frames from `reader` into the demux channel.
    fn spawn_reader(&self, id: StreamId, reader: crate::transport::BoxReader) {
        let mut reader = StreamReader::new(reader).with_max_trailer_len(self.max_trailer_len);
        let tx = self.inbound.clone();
        let handle = tokio::spawn(async move {
            loop {
                let inbound = match reader.read_operation().await {
                    Ok(Some(op)) => Inbound::Frame { stream: id, op },
                    Ok(None) => {
                        let _ = tx.send(Inbound::Finished { stream: id });
                        break;
                    }
                    Err(ProbeError::Frame(error)) => {
                        let _ = tx.send(Inbound::Malformed { stream: id, error });
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Inbound::Failed {
                            stream: id,
                            error: e.to_string(),
                        });
                        break;
                    }
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
        });

        let mut streams = self.streams.lock();
        streams.readers.retain(|_, h| !h.is_finished());
        streams.readers.insert(id, handle.abort_handle());
    }

    fn transport_lost(&self, reason: String) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        let failure = ProtocolFailure::TransportLost(reason);
        if !self.closing.load(Ordering::SeqCst) {
            self.record(failure.clone());
        }
        self.registry.fail_all(failure);
    }

    fn abort_readers(&self) {
        let readers: Vec<_> = self.streams.lock().readers.drain().map(|(_, h)| h).collect();
        for reader in readers {
            reader.abort();
        }
    }
}

/// Accept peer streams until the session ends.
async fn accept_loop(shared: Arc<Shared>, transport: Arc<dyn Transport>) {
    loop {
        match transport.accept_peer_stream().await {
            Ok(raw) => {
                let RawStream { id, direction, reader, .. } = raw;
                if let Err(e) = shared.track(id) {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
                tracing::debug!(stream = id, ?direction, "peer opened stream");
                if let Some(reader) = reader {
                    shared.spawn_reader(id, reader);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "accept loop finished");
                shared.transport_lost(e.to_string());
                break;
            }
        }
    }
}

/// An authenticated (or not yet authenticated) session with the server.
pub struct Connection {
    role: String,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    authenticated: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Establish a transport session and start the connection tasks.
    pub async fn connect(connector: &dyn Connector, config: &ProbeConfig, role: &str) -> Result<Arc<Self>> {
        let transport = connector.connect(config).await?;
        Ok(Arc::new(Self::from_transport(transport, config, role)))
    }

    /// Start the connection tasks over an existing session.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_transport(transport: Arc<dyn Transport>, config: &ProbeConfig, role: &str) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let control = match config.global_stream {
            GlobalStreamRule::FirstSeen => None,
            GlobalStreamRule::Fixed { stream_id } => Some(stream_id),
        };
        let shared = Arc::new(Shared {
            registry: Arc::new(Registry::new()),
            streams: Mutex::new(StreamTable::default()),
            control: Mutex::new(control),
            anomalies: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            inbound,
            max_trailer_len: config.max_trailer_len,
        });

        let tasks = vec![
            tokio::spawn(demux::demux_loop(Arc::clone(&shared), rx)),
            tokio::spawn(accept_loop(Arc::clone(&shared), Arc::clone(&transport))),
        ];

        tracing::debug!(role, "connection started");
        Self {
            role: role.to_string(),
            transport,
            shared,
            authenticated: AtomicBool::new(false),
            tasks,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Run the handshake; marks the connection authenticated only on success.
    pub async fn authenticate(&self, authenticator: &dyn Authenticator, payload: &AuthPayload) -> Result<()> {
        match authenticator.authenticate(self, payload).await {
            Ok(()) => {
                self.authenticated.store(true, Ordering::SeqCst);
                tracing::info!(role = %self.role, "authenticated");
                Ok(())
            }
            Err(e) => {
                self.authenticated.store(false, Ordering::SeqCst);
                tracing::warn!(role = %self.role, error = %e, "authentication failed");
                Err(e)
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.lost.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Authenticated and connected: safe to reuse.
    pub fn is_usable(&self) -> bool {
        self.is_authenticated() && self.is_connected()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProbeError::NotConnected)
        }
    }

    fn release_hook(&self) -> crate::stream::ReleaseHook {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Box::new(move |id| {
            if let Some(shared) = shared.upgrade() {
                shared.release(id);
            }
        })
    }

    /// Wrap a raw stream, optionally attaching its read half to the demultiplexer.
    fn adopt(&self, mut raw: RawStream, attach: bool) -> Result<Stream> {
        self.shared.track(raw.id)?;
        if attach {
            if let Some(reader) = raw.reader.take() {
                self.shared.spawn_reader(raw.id, reader);
            }
        }
        tracing::debug!(role = %self.role, stream = raw.id, direction = ?raw.direction, "stream opened");
        Ok(Stream::new(raw)
            .with_max_trailer_len(self.shared.max_trailer_len)
            .with_release(self.release_hook()))
    }

    pub async fn open_unidirectional(&self) -> Result<Stream> {
        self.ensure_connected()?;
        let raw = self.transport.open_unidirectional().await?;
        self.adopt(raw, false)
    }

    /// Open a bidirectional stream whose inbound frames go through the demultiplexer.
    pub async fn open_bidirectional(&self) -> Result<Stream> {
        self.ensure_connected()?;
        let raw = self.transport.open_bidirectional().await?;
        self.adopt(raw, true)
    }

    /// Open a bidirectional stream that keeps its read half for byte-level reads.
    pub async fn open_bidirectional_detached(&self) -> Result<Stream> {
        self.ensure_connected()?;
        let raw = self.transport.open_bidirectional().await?;
        self.adopt(raw, false)
    }

    /// Register a single-shot waiter. Register before writing to avoid missing the answer.
    pub fn expect(&self, key: CorrelationKey) -> Result<Waiter> {
        self.shared.check_waitable(key)?;
        self.shared.registry.register(key)
    }

    /// Register an ordered subscription for every frame correlated with `key`.
    pub fn subscribe(&self, key: CorrelationKey) -> Result<Subscription> {
        self.shared.check_waitable(key)?;
        self.shared.registry.subscribe(key)
    }

    /// Wait for the next operation correlated with `stream`.
    pub async fn await_operation(&self, stream: StreamId, timeout: Duration) -> Result<Operation> {
        let waiter = self.expect(CorrelationKey::Stream(stream))?;
        Ok(waiter.wait(timeout).await?)
    }

    /// Wait for DISCONNECT or DISCONNECT_REQUEST.
    pub async fn await_control(&self, timeout: Duration) -> Result<Operation> {
        let waiter = self.expect(CorrelationKey::Control)?;
        Ok(waiter.wait(timeout).await?)
    }

    /// Write `op` on `stream` and wait for the operation correlated with that stream.
    pub async fn exchange(&self, stream: &mut Stream, op: &Operation, timeout: Duration) -> Result<Operation> {
        let waiter = self.expect(CorrelationKey::Stream(stream.id()))?;
        stream.send(op).await?;
        Ok(waiter.wait(timeout).await?)
    }

    /// The discovered (or configured) global control stream.
    pub fn control_stream(&self) -> Option<StreamId> {
        *self.shared.control.lock()
    }

    pub fn knows_stream(&self, id: StreamId) -> bool {
        self.shared.is_known(id)
    }

    /// Protocol anomalies recorded so far.
    pub fn anomalies(&self) -> Vec<ProtocolFailure> {
        self.shared.anomalies.lock().clone()
    }

    /// Drain the anomaly log.
    pub fn take_anomalies(&self) -> Vec<ProtocolFailure> {
        std::mem::take(&mut *self.shared.anomalies.lock())
    }

    /// Close the session. Pending waits fail with [`ProtocolFailure::TransportLost`].
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.transport.close();
        self.shared.transport_lost("connection closed locally".to_string());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        for task in &self.tasks {
            task.abort();
        }
        self.shared.abort_readers();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("authenticated", &self.is_authenticated())
            .field("connected", &self.is_connected())
            .field("control_stream", &self.control_stream())
            .finish()
    }
}
