//! Shared state handed to every situation.
//!
//! Holds the probe configuration and the role-keyed connection cache. A
//! cached connection is reused while it is authenticated and connected;
//! otherwise it is replaced by a fresh, authenticated one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::auth::Authenticator;
use crate::config::ProbeConfig;
use crate::connection::Connection;
use crate::error::{ProtocolFailure, Result};
use crate::transport::Connector;

/// Context passed to [`Situation::diagnostic`](super::Situation::diagnostic).
pub struct SituationContext {
    config: ProbeConfig,
    connector: Arc<dyn Connector>,
    authenticator: Arc<dyn Authenticator>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl SituationContext {
    pub fn new(
        config: ProbeConfig,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            connector,
            authenticator,
            connections: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// How long a situation waits for a correlated operation.
    #[inline]
    pub fn await_timeout(&self) -> Duration {
        self.config.timeouts.await_operation()
    }

    /// Authenticated connection for `role`, from the cache when still usable.
    pub async fn connection(&self, role: &str) -> Result<Arc<Connection>> {
        let mut cache = self.connections.lock().await;
        if let Some(cached) = cache.get(role) {
            if cached.is_usable() {
                return Ok(Arc::clone(cached));
            }
        }
        if let Some(stale) = cache.remove(role) {
            tracing::debug!(role, "cached connection unusable, reconnecting");
            stale.close();
        }

        let connection = self.unauthenticated(role).await?;
        connection
            .authenticate(self.authenticator.as_ref(), &self.config.auth_payload()?)
            .await?;
        cache.insert(role.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    pub async fn is_cached(&self, role: &str) -> bool {
        self.connections.lock().await.contains_key(role)
    }

    /// Fresh connection that skips the handshake. Never cached.
    pub async fn unauthenticated(&self, role: &str) -> Result<Arc<Connection>> {
        Connection::connect(self.connector.as_ref(), &self.config, role).await
    }

    /// Drain the anomaly log of the cached connection for `role`.
    pub async fn take_anomalies(&self, role: &str) -> Vec<ProtocolFailure> {
        match self.connections.lock().await.get(role) {
            Some(connection) => connection.take_anomalies(),
            None => Vec::new(),
        }
    }

    /// Drain the anomaly logs of every cached connection, tagged by role.
    pub async fn drain_anomalies(&self) -> Vec<(String, ProtocolFailure)> {
        let cache = self.connections.lock().await;
        let mut drained = Vec::new();
        for (role, connection) in cache.iter() {
            drained.extend(
                connection
                    .take_anomalies()
                    .into_iter()
                    .map(|failure| (role.clone(), failure)),
            );
        }
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Drop a role from the cache, closing its connection.
    pub async fn discard(&self, role: &str) {
        if let Some(connection) = self.connections.lock().await.remove(role) {
            connection.close();
        }
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (role, connection) in drained {
            tracing::debug!(role = %role, "closing connection");
            connection.close();
        }
    }
}
