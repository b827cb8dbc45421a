//! Situation engine.
//!
//! A [`Situation`] is one scripted exchange with the server under test. It
//! declares the situations it depends on by id. The [`SituationRegistry`]
//! orders them topologically, and the [`Engine`] runs them into a [`Report`].
//!
//! # Example
//!
//! ```ignore
//! struct Ping;
//!
//! impl Situation for Ping {
//!     fn id(&self) -> &'static str { "session.ping" }
//!     fn name(&self) -> &'static str { "Ping" }
//!     fn dependencies(&self) -> &'static [&'static str] { &["session.authentication"] }
//!     fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
//!         Box::pin(async move { Outcome::conformant("pong") })
//!     }
//! }
//! ```

mod context;
mod engine;
mod registry;
mod report;

pub use context::SituationContext;
pub use engine::Engine;
pub use registry::SituationRegistry;
pub use report::{Anomaly, Report, SituationResult, Verdict};

use crate::error::ProbeError;
use crate::BoxFuture;

/// Result of one diagnostic run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    failed: bool,
    detail: String,
}

impl Outcome {
    /// The server behaved as the protocol requires.
    pub fn conformant(detail: impl Into<String>) -> Self {
        Self {
            failed: false,
            detail: detail.into(),
        }
    }

    /// The server did not behave as the protocol requires.
    pub fn violation(detail: impl Into<String>) -> Self {
        Self {
            failed: true,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        self.failed
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<ProbeError> for Outcome {
    fn from(err: ProbeError) -> Self {
        Outcome::violation(err.to_string())
    }
}

/// One scripted scenario.
pub trait Situation: Send + Sync + 'static {
    /// Unique id, also used to declare dependencies.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Ids of situations that must pass before this one runs.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    fn diagnostic<'a>(&'a self, ctx: &'a SituationContext) -> BoxFuture<'a, Outcome>;
}
