//! In-memory sessions backed by `tokio::io::duplex`.
//!
//! Stream ids follow the QUIC numbering so both ends agree on them:
//! bit 0 is the initiator (0 = client, 1 = server), bit 1 the direction
//! (0 = bidirectional, 1 = unidirectional).
//!
//! # Example
//!
//! ```
//! use wireprobe::transport::{MemorySession, Transport};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (client, server) = MemorySession::pair();
//! let local = client.open_unidirectional().await.unwrap();
//! let remote = server.accept_peer_stream().await.unwrap();
//! assert_eq!(local.id, remote.id);
//! assert_eq!(local.id, 2);
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use super::{BoxReader, BoxWriter, Connector, RawStream, Transport};
use crate::config::ProbeConfig;
use crate::error::Result;
use crate::stream::{Direction, StreamId};
use crate::BoxFuture;

/// Default duplex buffer per stream.
pub const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One end of an in-memory session.
pub struct MemorySession {
    side: Side,
    buffer: usize,
    next_bidi: AtomicU64,
    next_uni: AtomicU64,
    outgoing: mpsc::UnboundedSender<RawStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<RawStream>>,
    open: Arc<watch::Sender<bool>>,
}

impl MemorySession {
    /// Create a connected (client, server) pair.
    pub fn pair() -> (MemorySession, MemorySession) {
        Self::pair_with_buffer(DEFAULT_STREAM_BUFFER)
    }

    /// Create a pair whose streams buffer at most `buffer` bytes in flight.
    pub fn pair_with_buffer(buffer: usize) -> (MemorySession, MemorySession) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let open = Arc::new(watch::channel(true).0);

        let client = MemorySession::new(Side::Client, buffer, to_server, from_server, open.clone());
        let server = MemorySession::new(Side::Server, buffer, to_client, from_client, open);
        (client, server)
    }

    fn new(
        side: Side,
        buffer: usize,
        outgoing: mpsc::UnboundedSender<RawStream>,
        incoming: mpsc::UnboundedReceiver<RawStream>,
        open: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            side,
            buffer,
            next_bidi: AtomicU64::new(0),
            next_uni: AtomicU64::new(0),
            outgoing,
            incoming: Mutex::new(incoming),
            open,
        }
    }

    fn next_id(&self, direction: Direction) -> StreamId {
        let (counter, dir_bit) = match direction {
            Direction::Bidirectional => (&self.next_bidi, 0),
            Direction::Unidirectional => (&self.next_uni, 2),
        };
        let side_bit = match self.side {
            Side::Client => 0,
            Side::Server => 1,
        };
        let seq = counter.fetch_add(1, Ordering::Relaxed);
        ((seq << 2) | dir_bit | side_bit) as StreamId
    }

    fn open_stream(&self, direction: Direction) -> io::Result<RawStream> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session closed"));
        }

        let id = self.next_id(direction);
        let (local, remote) = tokio::io::duplex(self.buffer);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let (local, remote) = match direction {
            Direction::Bidirectional => (
                RawStream {
                    id,
                    direction,
                    reader: Some(Box::new(local_read) as BoxReader),
                    writer: Some(Box::new(local_write) as BoxWriter),
                },
                RawStream {
                    id,
                    direction,
                    reader: Some(Box::new(remote_read) as BoxReader),
                    writer: Some(Box::new(remote_write) as BoxWriter),
                },
            ),
            Direction::Unidirectional => (
                RawStream {
                    id,
                    direction,
                    reader: None,
                    writer: Some(Box::new(local_write) as BoxWriter),
                },
                RawStream {
                    id,
                    direction,
                    reader: Some(Box::new(remote_read) as BoxReader),
                    writer: None,
                },
            ),
        };

        self.outgoing
            .send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionReset, "peer session dropped"))?;
        Ok(local)
    }
}

impl Transport for MemorySession {
    fn open_unidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move { self.open_stream(Direction::Unidirectional) })
    }

    fn open_bidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move { self.open_stream(Direction::Bidirectional) })
    }

    fn accept_peer_stream(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move {
            let mut closed = self.open.subscribe();
            let mut incoming = self.incoming.lock().await;
            tokio::select! {
                stream = incoming.recv() => stream.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::ConnectionReset, "peer session dropped")
                }),
                _ = async { let _ = closed.wait_for(|open| !*open).await; } => {
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, "session closed"))
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        *self.open.borrow() && !self.outgoing.is_closed()
    }

    fn close(&self) {
        self.open.send_replace(false);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.open.send_replace(false);
    }
}

/// Connector that creates a fresh in-memory pair per connection.
///
/// The server end of each pair is handed to the receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    servers: mpsc::UnboundedSender<MemorySession>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Self { servers }, rx)
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _config: &'a ProbeConfig) -> BoxFuture<'a, Result<Arc<dyn Transport>>> {
        Box::pin(async move {
            let (client, server) = MemorySession::pair();
            self.servers.send(server).map_err(|_| {
                crate::ProbeError::Transport("no server is accepting in-memory sessions".into())
            })?;
            Ok(Arc::new(client) as Arc<dyn Transport>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_ids_follow_quic_numbering() {
        let (client, server) = MemorySession::pair();
        assert_eq!(client.open_bidirectional().await.unwrap().id, 0);
        assert_eq!(client.open_bidirectional().await.unwrap().id, 4);
        assert_eq!(client.open_unidirectional().await.unwrap().id, 2);
        assert_eq!(server.open_unidirectional().await.unwrap().id, 3);
        assert_eq!(server.open_bidirectional().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_unidirectional_bytes_reach_peer() {
        let (client, server) = MemorySession::pair();
        let local = client.open_unidirectional().await.unwrap();
        assert!(local.reader.is_none());
        let mut writer = local.writer.unwrap();
        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        let remote = server.accept_peer_stream().await.unwrap();
        assert_eq!(remote.direction, Direction::Unidirectional);
        assert!(remote.writer.is_none());
        let mut buf = Vec::new();
        remote.reader.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_bidirectional_echo() {
        let (client, server) = MemorySession::pair();
        let local = client.open_bidirectional().await.unwrap();
        let remote = server.accept_peer_stream().await.unwrap();

        let mut remote_writer = remote.writer.unwrap();
        remote_writer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        local.reader.unwrap().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_fails_accept_and_open() {
        let (client, server) = MemorySession::pair();
        assert!(client.is_connected());
        server.close();
        assert!(!client.is_connected());
        assert!(client.accept_peer_stream().await.is_err());
        assert!(client.open_unidirectional().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_disconnects() {
        let (client, server) = MemorySession::pair();
        drop(server);
        assert!(!client.is_connected());
        assert!(client.accept_peer_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_connector_hands_out_server_end() {
        let (connector, mut servers) = MemoryConnector::new();
        let transport = connector.connect(&ProbeConfig::default()).await.unwrap();
        let server = servers.recv().await.unwrap();
        server.open_unidirectional().await.unwrap();
        let accepted = transport.accept_peer_stream().await.unwrap();
        assert_eq!(accepted.id, 3);
    }
}
