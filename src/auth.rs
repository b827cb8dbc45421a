//! Authentication handshake.
//!
//! The core only relies on the pass/fail contract of [`Authenticator`]. The
//! default [`JsonHandshake`] sends the payload as length-prefixed JSON on a
//! fresh bidirectional stream:
//! ```text
//! client -> server   u32 BE length, JSON AuthPayload
//! server -> client   u32 BE length, JSON {"accepted": bool, "reason": string?}
//! ```
//!
//! # Example
//!
//! ```
//! use wireprobe::auth::{AuthPayload, ProtocolVersion};
//!
//! let payload = AuthPayload {
//!     kind: "token".into(),
//!     token: "s3cret".into(),
//!     metadata: Default::default(),
//!     version: "1.2.0".parse().unwrap(),
//!     vendor: "wireprobe".into(),
//! };
//! let json = serde_json::to_string(&payload).unwrap();
//! assert!(json.contains(r#""type":"token""#));
//! assert!(json.contains(r#""version":"1.2.0""#));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Buf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::connection::Connection;
use crate::error::{ProbeError, Result};
use crate::BoxFuture;

/// Largest handshake reply accepted.
const MAX_REPLY_LEN: usize = 64 * 1024;

/// `major.minor.patch` version presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for ProtocolVersion {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProbeError::Config(format!("invalid version {:?}, expected major.minor.patch", s));
        let mut parts = s.trim().split('.').map(|p| p.parse::<u32>());
        let mut next = || parts.next().and_then(|p| p.ok()).ok_or_else(invalid);
        let version = ProtocolVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Credentials and client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    pub metadata: BTreeMap<String, String>,
    pub version: ProtocolVersion,
    pub vendor: String,
}

/// Server's answer to the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Performs the authentication exchange on a connection.
pub trait Authenticator: Send + Sync + 'static {
    /// Succeeds only if the server accepted `payload`.
    fn authenticate<'a>(
        &'a self,
        connection: &'a Connection,
        payload: &'a AuthPayload,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Length-prefixed JSON handshake on a dedicated bidirectional stream.
#[derive(Debug, Clone)]
pub struct JsonHandshake {
    timeout: Duration,
}

impl JsonHandshake {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Authenticator for JsonHandshake {
    fn authenticate<'a>(
        &'a self,
        connection: &'a Connection,
        payload: &'a AuthPayload,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut stream = connection.open_bidirectional_detached().await?;
            let body = serde_json::to_vec(payload)?;
            stream.write(&(body.len() as u32).to_be_bytes()).await?;
            stream.write(&body).await?;
            stream.finish().await?;

            let len = stream.read_exact(4, self.timeout).await?.get_u32() as usize;
            if len > MAX_REPLY_LEN {
                stream.close().await;
                return Err(ProbeError::Authentication(format!(
                    "handshake reply of {} bytes exceeds {}",
                    len, MAX_REPLY_LEN
                )));
            }
            let reply: AuthReply = serde_json::from_slice(&stream.read_exact(len, self.timeout).await?)?;
            stream.close().await;

            if reply.accepted {
                Ok(())
            } else {
                Err(ProbeError::Authentication(
                    reply.reason.unwrap_or_else(|| "rejected without reason".to_string()),
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v: ProtocolVersion = "2.10.3".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 10, 3));
        assert_eq!(v.to_string(), "2.10.3");
        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
        assert!("1.x.3".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        let a: ProtocolVersion = "1.9.0".parse().unwrap();
        let b: ProtocolVersion = "1.10.0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_payload_json_shape() {
        let mut metadata = BTreeMap::new();
        metadata.insert("region".to_string(), "eu".to_string());
        let payload = AuthPayload {
            kind: "token".into(),
            token: "t".into(),
            metadata,
            version: "1.0.0".parse().unwrap(),
            vendor: "v".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "token");
        assert_eq!(value["metadata"]["region"], "eu");
        assert_eq!(value["version"], "1.0.0");

        let back: AuthPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_reply_reason_optional() {
        let reply: AuthReply = serde_json::from_str(r#"{"accepted": true}"#).unwrap();
        assert!(reply.accepted);
        assert_eq!(reply.reason, None);
    }
}
