use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{LeaseId, VersionedStore};

/// Floor for the keepalive cadence; ttl/3 is used above it.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

fn keep_alive_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_KEEPALIVE_INTERVAL)
}

/// Store-issued, time-bounded ownership token. Keys bound to it vanish when
/// it expires or is revoked; the store's clock is authoritative for expiry.
#[derive(Debug, Clone)]
pub struct Lease {
    id: LeaseId,
    ttl: Duration,
    granted_at: DateTime<Utc>,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    /// Advisory only: computed from the local grant time, while the store
    /// decides actual expiry.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .map_or(DateTime::<Utc>::MAX_UTC, |ttl| self.granted_at + ttl)
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<dyn VersionedStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self { store }
    }

    pub async fn grant(&self, ttl: Duration) -> Result<Lease> {
        if ttl.is_zero() {
            return Err(Error::InvalidTtl(ttl));
        }
        let id = self.store.grant(ttl).await?;
        debug!(?id, ?ttl, "lease granted");
        Ok(Lease {
            id,
            ttl,
            granted_at: Utc::now(),
        })
    }

    /// Idempotent: revoking an already-expired lease is not an error.
    pub async fn revoke(&self, lease: &Lease) -> Result<()> {
        self.store.revoke(lease.id).await?;
        debug!(id = ?lease.id, "lease revoked");
        Ok(())
    }

    /// Renews the lease every ~ttl/3 until cancelled or the store reports
    /// the lease unknown. Transient store failures are retried on the next
    /// tick; the lease then lives or dies by the store's own expiry.
    pub fn spawn_keep_alive(&self, lease: &Lease) -> KeepAlive {
        let store = Arc::clone(&self.store);
        let id = lease.id();
        let period = keep_alive_interval(lease.ttl());
        let (lost_tx, lost_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tick.tick() => match store.keep_alive(id).await {
                        Ok(_) => {}
                        Err(Error::LeaseLost { .. }) => {
                            warn!(?id, "lease lost, keepalive terminating");
                            let _ = lost_tx.send(true);
                            break;
                        }
                        Err(err) => {
                            debug!(?id, %err, "keepalive attempt failed, will retry");
                        }
                    },
                }
            }
        });

        KeepAlive {
            id,
            shutdown: Some(shutdown_tx),
            lost: lost_rx,
            task: Some(task),
        }
    }
}

/// Handle to the background keepalive task for one lease. Cancelled exactly
/// once via [`KeepAlive::cancel`]; dropping an uncancelled handle aborts the
/// task instead.
#[derive(Debug)]
pub struct KeepAlive {
    id: LeaseId,
    shutdown: Option<oneshot::Sender<()>>,
    lost: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn lease_id(&self) -> LeaseId {
        self.id
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves when the lease backing this task is reported lost. Never
    /// resolves for a lease that stays healthy until cancellation.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow() {
                return;
            }
            if self.lost.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub async fn cancel(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
