use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Result;

/// Monotonically increasing version number the store assigns to every mutation.
pub type Revision = u64;

/// Opaque, store-issued identifier for a time-bounded ownership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// Guard clause of a compare-and-swap transaction. `ModRevision(_, 0)` holds
/// iff the key is absent, so a read of a missing key can still be validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnGuard {
    Absent(String),
    ModRevision(String, Revision),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// Change notification for a watched key. Lease-expiry deletions are
/// delivered as `Delete` events like any explicit delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    pub revision: Revision,
}

/// Lazy sequence of change events for one key, live until dropped.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for WatchStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Minimum surface this crate consumes from the replicated, versioned
/// key-value store. Assumed linearizable; the connection handle may be
/// shared across sessions.
#[async_trait]
pub trait VersionedStore: Send + Sync + fmt::Debug {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Idempotent: revoking an already-expired lease is not an error.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Renews the lease and returns its remaining ttl, or `LeaseLost` if the
    /// store no longer knows the lease.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<Revision>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically applies `ops` iff every guard holds; one revision bump per
    /// successful transaction.
    async fn txn(&self, guards: Vec<TxnGuard>, ops: Vec<TxnOp>) -> Result<TxnResponse>;

    async fn watch(&self, key: &str) -> Result<WatchStream>;
}
