use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lease::{KeepAlive, Lease, LeaseManager};
use crate::retry::Backoff;
use crate::store::{EventKind, Revision, TxnGuard, TxnOp, VersionedStore};
use crate::CancelToken;

/// Holder record written as the lock key's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn new() -> Self {
        Self {
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        }
    }
}

/// A held mutual-exclusion lock. The key exists in the store bound to this
/// session's lease for as long as the lease stays alive; losing the lease
/// means losing the critical section, observable via [`Lock::is_lost`] and
/// [`Lock::lost`].
#[derive(Debug)]
pub struct Lock {
    key: String,
    owner: LockOwner,
    lease: Lease,
    keep_alive: Option<KeepAlive>,
    revision: Revision,
    released: bool,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Store revision at which the lock was acquired; usable as a fencing
    /// token, since a later holder of the same key always sees a higher one.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_lost(&self) -> bool {
        self.keep_alive.as_ref().map_or(true, KeepAlive::is_lost)
    }

    /// Resolves when the backing lease is lost while the lock is held.
    /// Holders must abort in-flight critical-section work when this fires.
    pub async fn lost(&mut self) {
        match self.keep_alive.as_mut() {
            Some(keep_alive) => keep_alive.lost().await,
            None => std::future::pending().await,
        }
    }
}

enum WaitOutcome {
    Freed,
    LeaseLost,
    Cancelled,
}

/// Acquires and releases named mutual-exclusion locks for one session.
/// Sessions share nothing client-side; exclusion rests entirely on the
/// store's CAS primitive plus lease fencing.
#[derive(Debug)]
pub struct LockManager {
    store: Arc<dyn VersionedStore>,
    leases: LeaseManager,
    backoff: Backoff,
}

impl LockManager {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self::with_backoff(store, Backoff::default())
    }

    pub fn with_backoff(store: Arc<dyn VersionedStore>, backoff: Backoff) -> Self {
        Self {
            leases: LeaseManager::new(Arc::clone(&store)),
            store,
            backoff,
        }
    }

    /// Blocks until the lock on `key` is acquired. Waiting is watch-driven:
    /// the attempt suspends on the next change event for `key` and re-runs
    /// the CAS after each relevant event, with backoff bounding the retry
    /// rate under thundering-herd contention.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.lock_inner(key, ttl, None).await
    }

    /// Like [`LockManager::lock`], giving up when `cancel` fires. A lease
    /// granted before cancellation is revoked on the way out, so no lease
    /// outlives the attempt without a held lock.
    pub async fn lock_with_cancel(
        &self,
        key: &str,
        ttl: Duration,
        cancel: CancelToken,
    ) -> Result<Lock> {
        self.lock_inner(key, ttl, Some(cancel)).await
    }

    async fn lock_inner(
        &self,
        key: &str,
        ttl: Duration,
        mut cancel: Option<CancelToken>,
    ) -> Result<Lock> {
        if is_cancelled(&cancel) {
            return Err(Error::Cancelled);
        }
        let owner = LockOwner::new();
        let value = Bytes::from(serde_json::to_vec(&owner)?);

        let lease = self.leases.grant(ttl).await?;
        if is_cancelled(&cancel) {
            let _ = self.leases.revoke(&lease).await;
            return Err(Error::Cancelled);
        }
        let mut keep_alive = self.leases.spawn_keep_alive(&lease);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let response = match self
                .store
                .txn(
                    vec![TxnGuard::Absent(key.to_string())],
                    vec![TxnOp::Put {
                        key: key.to_string(),
                        value: value.clone(),
                        lease: Some(lease.id()),
                    }],
                )
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.abandon(keep_alive, &lease).await;
                    return Err(err);
                }
            };

            if response.succeeded {
                info!(key, lease = ?lease.id(), revision = response.revision, "lock acquired");
                return Ok(Lock {
                    key: key.to_string(),
                    owner,
                    lease,
                    keep_alive: Some(keep_alive),
                    revision: response.revision,
                    released: false,
                });
            }

            debug!(key, attempt, "lock contended, waiting for release");
            let mut watch = match self.store.watch(key).await {
                Ok(watch) => watch,
                Err(err) => {
                    self.abandon(keep_alive, &lease).await;
                    return Err(err);
                }
            };
            // Watch is opened before re-reading, so a release landing
            // between the failed CAS and the watch is not missed.
            let current = match self.store.get(key).await {
                Ok(current) => current,
                Err(err) => {
                    self.abandon(keep_alive, &lease).await;
                    return Err(err);
                }
            };

            if current.is_some() {
                let outcome = loop {
                    tokio::select! {
                        event = watch.recv() => match event {
                            Some(event) if event.kind == EventKind::Delete => break WaitOutcome::Freed,
                            Some(_) => {}
                            None => break WaitOutcome::Freed,
                        },
                        () = keep_alive.lost() => break WaitOutcome::LeaseLost,
                        () = cancelled(&mut cancel) => break WaitOutcome::Cancelled,
                    }
                };
                match outcome {
                    WaitOutcome::Freed => {}
                    WaitOutcome::LeaseLost => {
                        let id = lease.id();
                        self.abandon(keep_alive, &lease).await;
                        return Err(Error::LeaseLost { id });
                    }
                    WaitOutcome::Cancelled => {
                        self.abandon(keep_alive, &lease).await;
                        return Err(Error::Cancelled);
                    }
                }
            }

            self.backoff.wait(attempt).await;
            if is_cancelled(&cancel) {
                self.abandon(keep_alive, &lease).await;
                return Err(Error::Cancelled);
            }
        }
    }

    /// Releases the lock by cancelling keepalive and revoking the lease; the
    /// store deletes the key as the lease side effect. There is deliberately
    /// no explicit key delete, which would race the lease-triggered one.
    /// Calling this twice yields `Ok` then `NotHeld`.
    pub async fn unlock(&self, lock: &mut Lock) -> Result<()> {
        if lock.released {
            return Err(Error::NotHeld);
        }
        lock.released = true;

        let lost = lock.is_lost();
        if let Some(keep_alive) = lock.keep_alive.take() {
            keep_alive.cancel().await;
        }
        if lost {
            let _ = self.leases.revoke(&lock.lease).await;
            return Err(Error::NotHeld);
        }
        self.leases.revoke(&lock.lease).await?;
        info!(key = lock.key.as_str(), "lock released");
        Ok(())
    }

    async fn abandon(&self, keep_alive: KeepAlive, lease: &Lease) {
        keep_alive.cancel().await;
        if let Err(err) = self.leases.revoke(lease).await {
            debug!(%err, "revoking abandoned lock lease failed");
        }
    }
}

fn is_cancelled(cancel: &Option<CancelToken>) -> bool {
    cancel.as_ref().is_some_and(CancelToken::is_cancelled)
}

async fn cancelled(cancel: &mut Option<CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
