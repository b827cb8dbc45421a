//! Correlation of inbound operations with the exchange waiting for them.
//!
//! Each [`CorrelationKey`] has at most one live entry: either a single-shot
//! [`Waiter`] or an ordered [`Subscription`]. Registration, resolution,
//! cancellation and timeout removal all go through one mutex, so they are
//! atomic with respect to each other.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wireprobe::correlation::{CorrelationKey, Registry, Resolution};
//! use wireprobe::protocol::Operation;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Arc::new(Registry::new());
//! let waiter = registry.register(CorrelationKey::Stream(4)).unwrap();
//!
//! let resolution = registry.resolve(CorrelationKey::Stream(4), Operation::Proceed { target: 4 });
//! assert!(matches!(resolution, Resolution::Delivered));
//! assert_eq!(
//!     waiter.wait(Duration::from_secs(1)).await,
//!     Ok(Operation::Proceed { target: 4 })
//! );
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProbeError, ProtocolFailure, Result};
use crate::protocol::Operation;
use crate::stream::StreamId;

/// What an inbound operation is correlated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKey {
    /// A stream, named by arrival (stream-scoped operations) or by target (global ones).
    Stream(StreamId),
    /// A MESSAGE/REQUEST message id.
    Message(i16),
    /// Connection-level control (DISCONNECT, DISCONNECT_REQUEST).
    Control,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Stream(id) => write!(f, "stream {}", id),
            CorrelationKey::Message(id) => write!(f, "message {}", id),
            CorrelationKey::Control => f.write_str("control"),
        }
    }
}

/// What a waiter receives.
pub type Delivery = std::result::Result<Operation, ProtocolFailure>;

enum Slot {
    Once(oneshot::Sender<Delivery>),
    Ordered(mpsc::UnboundedSender<Delivery>),
}

impl Slot {
    fn is_closed(&self) -> bool {
        match self {
            Slot::Once(tx) => tx.is_closed(),
            Slot::Ordered(tx) => tx.is_closed(),
        }
    }

    fn deliver(self, delivery: Delivery) {
        match self {
            Slot::Once(tx) => {
                let _ = tx.send(delivery);
            }
            Slot::Ordered(tx) => {
                let _ = tx.send(delivery);
            }
        }
    }
}

struct Entry {
    token: u64,
    slot: Slot,
}

/// Outcome of [`Registry::resolve`].
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// Nobody was waiting; the operation is handed back for reporting.
    Unsolicited(Operation),
}

/// Key to pending-waiter table.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<CorrelationKey, Entry>>,
    next_token: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: CorrelationKey, slot: Slot) -> Result<u64> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(ProbeError::DuplicateWaiter(key));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, Entry { token, slot });
        Ok(token)
    }

    /// Register a single-shot waiter.
    ///
    /// Fails with [`ProbeError::DuplicateWaiter`] if `key` already has an entry;
    /// the existing entry is left untouched.
    pub fn register(self: &Arc<Self>, key: CorrelationKey) -> Result<Waiter> {
        let (tx, rx) = oneshot::channel();
        let token = self.insert(key, Slot::Once(tx))?;
        Ok(Waiter {
            key,
            token,
            rx,
            registry: Arc::clone(self),
            armed: true,
        })
    }

    /// Register an ordered, multi-delivery subscription.
    pub fn subscribe(self: &Arc<Self>, key: CorrelationKey) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.insert(key, Slot::Ordered(tx))?;
        Ok(Subscription {
            key,
            token,
            rx,
            registry: Arc::clone(self),
        })
    }

    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver `op` to the entry under `key`.
    ///
    /// Single-shot entries are removed; subscriptions stay.
    pub fn resolve(&self, key: CorrelationKey, op: Operation) -> Resolution {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(&key) else {
            return Resolution::Unsolicited(op);
        };
        if entry.slot.is_closed() {
            return Resolution::Unsolicited(op);
        }
        if let Slot::Ordered(tx) = &entry.slot {
            let _ = tx.send(Ok(op));
            entries.insert(key, entry);
        } else {
            entry.slot.deliver(Ok(op));
        }
        Resolution::Delivered
    }

    /// Remove the entry under `key` and complete it with `failure`.
    pub fn fail(&self, key: CorrelationKey, failure: ProtocolFailure) -> bool {
        let entry = self.entries.lock().remove(&key);
        match entry {
            Some(entry) => {
                entry.slot.deliver(Err(failure));
                true
            }
            None => false,
        }
    }

    /// Withdraw the wait on `key`; its owner sees [`ProtocolFailure::Cancelled`].
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        self.fail(key, ProtocolFailure::Cancelled(key))
    }

    /// Complete every pending entry with `failure`.
    pub fn fail_all(&self, failure: ProtocolFailure) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, entry) in drained {
            entry.slot.deliver(Err(failure.clone()));
        }
    }

    /// Remove `key` only if it still holds the entry identified by `token`.
    fn remove_token(&self, key: CorrelationKey, token: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(|entry| entry.token == token) {
            entries.remove(&key);
            true
        } else {
            false
        }
    }
}

/// Single-shot wait on one key.
///
/// Dropping an unresolved waiter removes its registry entry.
pub struct Waiter {
    key: CorrelationKey,
    token: u64,
    rx: oneshot::Receiver<Delivery>,
    registry: Arc<Registry>,
    armed: bool,
}

impl Waiter {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Wait up to `timeout` for the resolution.
    ///
    /// On timeout the entry is removed, so a later frame for the key is
    /// reported as unsolicited. A resolution racing the timeout still wins.
    pub async fn wait(mut self, timeout: Duration) -> Delivery {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.armed = false;
        let timed_out = ProtocolFailure::Timeout {
            key: self.key,
            after: timeout,
        };
        match outcome {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(ProtocolFailure::Cancelled(self.key)),
            Err(_) => {
                if self.registry.remove_token(self.key, self.token) {
                    Err(timed_out)
                } else {
                    self.rx.try_recv().unwrap_or(Err(timed_out))
                }
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove_token(self.key, self.token);
        }
    }
}

/// Ordered stream of deliveries for one key.
///
/// Dropping the subscription removes its registry entry.
pub struct Subscription {
    key: CorrelationKey,
    token: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Next delivery in arrival order, or a timeout. The subscription stays registered.
    pub async fn next(&mut self, timeout: Duration) -> Delivery {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => Err(ProtocolFailure::Cancelled(self.key)),
            Err(_) => Err(ProtocolFailure::Timeout {
                key: self.key,
                after: timeout,
            }),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove_token(self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let registry = registry();
        let key = CorrelationKey::Stream(2);
        let waiter = registry.register(key).unwrap();

        assert_eq!(
            registry.resolve(key, Operation::Disconnect),
            Resolution::Delivered
        );
        assert_eq!(waiter.wait(WAIT).await, Ok(Operation::Disconnect));
        assert!(registry.is_empty());

        assert_eq!(
            registry.resolve(key, Operation::Disconnect),
            Resolution::Unsolicited(Operation::Disconnect)
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let registry = registry();
        let key = CorrelationKey::Message(7);
        let first = registry.register(key).unwrap();

        let err = registry.register(key).err().unwrap();
        assert!(matches!(err, ProbeError::DuplicateWaiter(CorrelationKey::Message(7))));
        assert!(registry.subscribe(key).is_err());

        registry.resolve(key, Operation::BlockEnd { total: 1 });
        assert_eq!(first.wait(WAIT).await, Ok(Operation::BlockEnd { total: 1 }));
    }

    #[tokio::test]
    async fn test_other_key_does_not_resolve() {
        let registry = registry();
        let waiter = registry.register(CorrelationKey::Stream(4)).unwrap();
        let stray = Operation::Proceed { target: 8 };
        assert_eq!(
            registry.resolve(CorrelationKey::Stream(8), stray.clone()),
            Resolution::Unsolicited(stray)
        );
        let result = waiter.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProtocolFailure::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_timeout_then_late_frame_is_unsolicited() {
        let registry = registry();
        let key = CorrelationKey::Stream(6);
        let waiter = registry.register(key).unwrap();

        let result = waiter.wait(Duration::from_millis(10)).await;
        assert_eq!(
            result,
            Err(ProtocolFailure::Timeout {
                key,
                after: Duration::from_millis(10)
            })
        );
        assert!(!registry.contains(key));
        assert!(matches!(
            registry.resolve(key, Operation::Disconnect),
            Resolution::Unsolicited(_)
        ));
    }

    #[tokio::test]
    async fn test_resolution_before_wait_is_kept() {
        let registry = registry();
        let key = CorrelationKey::Control;
        let waiter = registry.register(key).unwrap();
        registry.resolve(key, Operation::Disconnect);
        // Even a zero timeout sees an already-delivered value.
        assert_eq!(waiter.wait(Duration::ZERO).await, Ok(Operation::Disconnect));
    }

    #[tokio::test]
    async fn test_cancel_completes_waiter() {
        let registry = registry();
        let key = CorrelationKey::Stream(10);
        let waiter = registry.register(key).unwrap();
        assert!(registry.cancel(key));
        assert!(!registry.cancel(key));
        assert_eq!(waiter.wait(WAIT).await, Err(ProtocolFailure::Cancelled(key)));
    }

    #[tokio::test]
    async fn test_dropped_waiter_frees_key() {
        let registry = registry();
        let key = CorrelationKey::Stream(12);
        drop(registry.register(key).unwrap());
        assert!(!registry.contains(key));
        assert!(registry.register(key).is_ok());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let registry = registry();
        let a = registry.register(CorrelationKey::Stream(0)).unwrap();
        let mut b = registry.subscribe(CorrelationKey::Stream(4)).unwrap();
        registry.fail_all(ProtocolFailure::TransportLost("reset".into()));

        let lost = Err(ProtocolFailure::TransportLost("reset".into()));
        assert_eq!(a.wait(WAIT).await, lost);
        assert_eq!(b.next(WAIT).await, lost);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_preserves_order() {
        let registry = registry();
        let key = CorrelationKey::Stream(4);
        let mut sub = registry.subscribe(key).unwrap();

        for total in 0..5 {
            assert_eq!(
                registry.resolve(key, Operation::BlockEnd { total }),
                Resolution::Delivered
            );
        }
        for total in 0..5 {
            assert_eq!(sub.next(WAIT).await, Ok(Operation::BlockEnd { total }));
        }
        assert!(matches!(
            sub.next(Duration::from_millis(10)).await,
            Err(ProtocolFailure::Timeout { .. })
        ));
        assert!(registry.contains(key));

        drop(sub);
        assert!(!registry.contains(key));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_on_distinct_keys() {
        let registry = registry();
        let waiters: Vec<_> = (0..16)
            .map(|i| registry.register(CorrelationKey::Stream(i * 4)).unwrap())
            .collect();

        let resolver = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in (0..16).rev() {
                    registry.resolve(
                        CorrelationKey::Stream(i * 4),
                        Operation::BlockEnd { total: i },
                    );
                }
            })
        };

        for (i, waiter) in waiters.into_iter().enumerate() {
            assert_eq!(
                waiter.wait(WAIT).await,
                Ok(Operation::BlockEnd { total: i as i64 })
            );
        }
        resolver.await.unwrap();
    }
}
