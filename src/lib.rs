#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Client-side distributed-coordination primitives over a replicated,
//! versioned key-value store: lease-backed mutual-exclusion locks with
//! keepalive, and an STM engine with optimistic concurrency control and
//! automatic conflict retry. The store itself is an injected collaborator
//! behind [`VersionedStore`]; [`MemoryStore`] is a linearizable in-process
//! implementation for tests and demos.

pub mod error;
pub mod lease;
pub mod lock;
pub mod memory;
pub mod retry;
pub mod stm;
pub mod store;

pub mod test_utils;

pub use error::{Error, Result};
pub use lease::{KeepAlive, Lease, LeaseManager, MIN_KEEPALIVE_INTERVAL};
pub use lock::{Lock, LockManager, LockOwner};
pub use memory::MemoryStore;
pub use retry::Backoff;
pub use stm::{Stm, Txn};
pub use store::{
    Event, EventKind, KeyValue, LeaseId, Revision, TxnGuard, TxnOp, TxnResponse, VersionedStore,
    WatchStream,
};

use tokio::sync::watch;

/// Creates a linked cancel handle/token pair. The token side is cloneable
/// and is accepted by the waiting entry points (`lock_with_cancel`,
/// `run_with_cancel`).
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
