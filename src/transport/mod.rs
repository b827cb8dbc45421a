//! Transport module - multiplexed stream sessions.
//!
//! The core only needs a narrow contract from the transport:
//! open a stream, accept a peer stream, is-connected, close.
//! Two implementations ship:
//! - QUIC via `quinn` ([`quic`])
//! - In-memory sessions over `tokio::io::duplex` ([`memory`])

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ProbeConfig;
use crate::error::Result;
use crate::stream::{Direction, StreamId};
use crate::BoxFuture;

pub mod memory;
pub mod quic;

pub use memory::{MemoryConnector, MemorySession};
pub use quic::{QuicConnector, QuicSession};

/// Read half of a transport stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly opened or accepted transport stream.
///
/// Unidirectional streams carry only the half that applies to this end.
pub struct RawStream {
    /// Transport-level stream id, identical on both ends.
    pub id: StreamId,
    pub direction: Direction,
    pub reader: Option<BoxReader>,
    pub writer: Option<BoxWriter>,
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("readable", &self.reader.is_some())
            .field("writable", &self.writer.is_some())
            .finish()
    }
}

/// A connected multiplexed session.
pub trait Transport: Send + Sync + 'static {
    /// Open a send-only stream.
    fn open_unidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>>;

    /// Open a stream readable and writable on both ends.
    fn open_bidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>>;

    /// Wait for the peer to open a stream.
    ///
    /// Fails once the session is gone; callers treat that as transport loss.
    fn accept_peer_stream(&self) -> BoxFuture<'_, io::Result<RawStream>>;

    fn is_connected(&self) -> bool;

    fn close(&self);
}

/// Produces transport sessions from configuration.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, config: &'a ProbeConfig) -> BoxFuture<'a, Result<Arc<dyn Transport>>>;
}
