//! # wireprobe
//!
//! Conformance-testing client for a binary protocol that multiplexes
//! request/response and streaming exchanges over the streams of a QUIC
//! (or in-memory) session.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): fixed-header frames, Big Endian, no I/O
//! - **Streams and connections** ([`stream`], [`connection`]): one
//!   demultiplexer per connection routes inbound frames to the waiter
//!   correlated with them ([`correlation`])
//! - **Situations** ([`situation`], [`situations`]): scripted exchanges with
//!   declared dependencies, run in topological order into a [`Report`]
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wireprobe::{situations, Engine, ProbeConfig, SituationContext};
//! use wireprobe::auth::JsonHandshake;
//! use wireprobe::transport::QuicConnector;
//!
//! #[tokio::main]
//! async fn main() -> wireprobe::error::Result<()> {
//!     let config = ProbeConfig::load("probe.json".as_ref())?;
//!     let authenticator = JsonHandshake::new(config.timeouts.read());
//!     let context = SituationContext::new(config, Arc::new(QuicConnector::new()), Arc::new(authenticator));
//!     let report = Engine::new(situations::builtin()?, context).run().await?;
//!     print!("{}", report.render_text());
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod auth;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod situation;
pub mod situations;
pub mod stream;
pub mod transport;

/// Boxed future used at trait seams (transports, authenticators, situations).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::ProbeConfig;
pub use connection::Connection;
pub use error::{FrameError, ProbeError, ProtocolFailure};
pub use protocol::{ErrorCode, Operation, OperationKind};
pub use situation::{Engine, Outcome, Report, Situation, SituationContext, SituationRegistry, Verdict};
pub use stream::{Direction, Stream, StreamId};
