//! QUIC sessions via `quinn`.
//!
//! The server certificate is verified against the PEM CA bundle named by
//! `server.ca_cert`; ALPN protocols come from `server.alpn`.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use quinn::VarInt;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;

use super::{BoxReader, BoxWriter, Connector, RawStream, Transport};
use crate::config::{ProbeConfig, ServerConfig};
use crate::error::{ProbeError, Result};
use crate::stream::{Direction, StreamId};
use crate::BoxFuture;

/// Application close code sent when the probe closes a session.
const CLOSE_CODE: u32 = 0;

fn stream_id(id: quinn::StreamId) -> StreamId {
    VarInt::from(id).into_inner() as StreamId
}

/// A live QUIC connection.
pub struct QuicSession {
    // Kept so the endpoint outlives the connection.
    _endpoint: quinn::Endpoint,
    connection: quinn::Connection,
}

impl QuicSession {
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

impl Transport for QuicSession {
    fn open_unidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move {
            let send = self.connection.open_uni().await?;
            Ok(RawStream {
                id: stream_id(send.id()),
                direction: Direction::Unidirectional,
                reader: None,
                writer: Some(Box::new(send) as BoxWriter),
            })
        })
    }

    fn open_bidirectional(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move {
            let (send, recv) = self.connection.open_bi().await?;
            Ok(RawStream {
                id: stream_id(send.id()),
                direction: Direction::Bidirectional,
                reader: Some(Box::new(recv) as BoxReader),
                writer: Some(Box::new(send) as BoxWriter),
            })
        })
    }

    fn accept_peer_stream(&self) -> BoxFuture<'_, io::Result<RawStream>> {
        Box::pin(async move {
            tokio::select! {
                result = self.connection.accept_uni() => {
                    let recv = result?;
                    Ok(RawStream {
                        id: stream_id(recv.id()),
                        direction: Direction::Unidirectional,
                        reader: Some(Box::new(recv) as BoxReader),
                        writer: None,
                    })
                }
                result = self.connection.accept_bi() => {
                    let (send, recv) = result?;
                    Ok(RawStream {
                        id: stream_id(send.id()),
                        direction: Direction::Bidirectional,
                        reader: Some(Box::new(recv) as BoxReader),
                        writer: Some(Box::new(send) as BoxWriter),
                    })
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(CLOSE_CODE), b"probe finished");
    }
}

/// Connects to the configured server over QUIC.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuicConnector;

impl QuicConnector {
    pub fn new() -> Self {
        Self
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| ProbeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    for cert in certs {
        let cert = cert
            .map_err(|e| ProbeError::Config(format!("bad certificate in {}: {}", path.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| ProbeError::Config(format!("rejected certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(ProbeError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn client_config(server: &ServerConfig) -> Result<quinn::ClientConfig> {
    let ca_cert = server
        .ca_cert
        .as_deref()
        .ok_or_else(|| ProbeError::Config("server.ca_cert is required for QUIC".into()))?;
    let roots = load_roots(ca_cert)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProbeError::Transport(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    crypto.alpn_protocols = server.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

impl Connector for QuicConnector {
    fn connect<'a>(&'a self, config: &'a ProbeConfig) -> BoxFuture<'a, Result<Arc<dyn Transport>>> {
        Box::pin(async move {
            let server = &config.server;
            let addr = tokio::net::lookup_host((server.host.as_str(), server.port))
                .await?
                .next()
                .ok_or_else(|| ProbeError::Transport(format!("cannot resolve {}", server.host)))?;

            let bind: SocketAddr = if addr.is_ipv6() {
                (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
            } else {
                (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
            };
            let mut endpoint = quinn::Endpoint::client(bind)?;
            endpoint.set_default_client_config(client_config(server)?);

            let connecting = endpoint
                .connect(addr, server.server_name())
                .map_err(|e| ProbeError::Transport(e.to_string()))?;
            let connection = tokio::time::timeout(config.timeouts.connect(), connecting)
                .await
                .map_err(|_| ProbeError::Transport(format!("connect to {} timed out", addr)))?
                .map_err(|e| ProbeError::Transport(e.to_string()))?;

            tracing::debug!(%addr, "QUIC session established");
            Ok(Arc::new(QuicSession {
                _endpoint: endpoint,
                connection,
            }) as Arc<dyn Transport>)
        })
    }
}
