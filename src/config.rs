//! Probe configuration.
//!
//! One [`ProbeConfig`] is built at startup (JSON file plus CLI overrides) and
//! passed by reference to everything that needs it. Every field has a
//! default, so a partial file is valid.
//!
//! # Example
//!
//! ```
//! use wireprobe::config::{GlobalStreamRule, ProbeConfig};
//!
//! let config = ProbeConfig::from_json(r#"{
//!     "server": { "host": "example.net", "port": 7000 },
//!     "global_stream": { "rule": "fixed", "stream_id": 3 }
//! }"#).unwrap();
//!
//! assert_eq!(config.server.port, 7000);
//! assert_eq!(config.global_stream, GlobalStreamRule::Fixed { stream_id: 3 });
//! assert_eq!(config.timeouts.await_ms, 3000);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthPayload, ProtocolVersion};
use crate::error::{ProbeError, Result};
use crate::protocol::DEFAULT_MAX_TRAILER_LEN;
use crate::stream::StreamId;

/// Default QUIC port.
pub const DEFAULT_PORT: u16 = 4433;

/// Where the server under test lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// TLS server name; defaults to `host`.
    pub server_name: Option<String>,
    /// PEM bundle of trusted CA certificates.
    pub ca_cert: Option<PathBuf>,
    pub alpn: Vec<String>,
}

impl ServerConfig {
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            server_name: None,
            ca_cert: None,
            alpn: Vec::new(),
        }
    }
}

/// Credentials presented in the authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    pub metadata: BTreeMap<String, String>,
    pub version: String,
    pub vendor: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            kind: "token".to_string(),
            token: String::new(),
            metadata: BTreeMap::new(),
            version: "1.0.0".to_string(),
            vendor: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport session establishment.
    pub connect_ms: u64,
    /// Waiting for a correlated operation.
    pub await_ms: u64,
    /// Byte-level reads (handshake replies).
    pub read_ms: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn await_operation(&self) -> Duration {
        Duration::from_millis(self.await_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            await_ms: 3_000,
            read_ms: 3_000,
        }
    }
}

/// How the connection recognises the global control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum GlobalStreamRule {
    /// The first stream carrying a global operation becomes the control stream.
    #[default]
    FirstSeen,
    /// Only this stream may carry global operations.
    Fixed { stream_id: StreamId },
}

/// Complete probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub timeouts: TimeoutConfig,
    pub global_stream: GlobalStreamRule,
    /// Situations allowed to run at the same time.
    pub max_concurrent_situations: usize,
    /// Largest BLOCK/FAIL/DONE trailer accepted from the server.
    pub max_trailer_len: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            timeouts: TimeoutConfig::default(),
            global_stream: GlobalStreamRule::default(),
            max_concurrent_situations: 1,
            max_trailer_len: DEFAULT_MAX_TRAILER_LEN,
        }
    }
}

impl ProbeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: ProbeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(ProbeError::Config("server.host must not be empty".into()));
        }
        let timeouts = [
            ("connect_ms", self.timeouts.connect_ms),
            ("await_ms", self.timeouts.await_ms),
            ("read_ms", self.timeouts.read_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ProbeError::Config(format!("timeouts.{} must be positive", name)));
            }
        }
        if self.max_concurrent_situations == 0 {
            return Err(ProbeError::Config(
                "max_concurrent_situations must be at least 1".into(),
            ));
        }
        if self.max_trailer_len == 0 {
            return Err(ProbeError::Config("max_trailer_len must be positive".into()));
        }
        self.auth.version.parse::<ProtocolVersion>()?;
        Ok(())
    }

    /// Build the handshake payload from the auth section.
    pub fn auth_payload(&self) -> Result<AuthPayload> {
        Ok(AuthPayload {
            kind: self.auth.kind.clone(),
            token: self.auth.token.clone(),
            metadata: self.auth.metadata.clone(),
            version: self.auth.version.parse()?,
            vendor: self.auth.vendor.clone(),
        })
    }
}
