use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::Backoff;
use crate::store::{Revision, TxnGuard, TxnOp, VersionedStore};
use crate::CancelToken;

/// One optimistic transaction attempt: reads record the observed revision,
/// writes stay pending until commit. Both sets are rebuilt from scratch on
/// every retry, so nothing from a failed attempt leaks into the next.
#[derive(Debug)]
pub struct Txn {
    store: Arc<dyn VersionedStore>,
    reads: DashMap<String, ReadRecord>,
    writes: DashMap<String, Bytes>,
    attempt: u32,
}

#[derive(Debug, Clone)]
struct ReadRecord {
    value: Option<Bytes>,
    revision: Revision,
}

impl Txn {
    fn new(store: Arc<dyn VersionedStore>, attempt: u32) -> Self {
        Self {
            store,
            reads: DashMap::new(),
            writes: DashMap::new(),
            attempt,
        }
    }

    /// 1-based attempt number of this invocation of the transaction body.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reads a key, recording its revision for commit-time validation.
    /// Pending writes shadow the store; repeated reads hit the recorded
    /// snapshot. An absent key is recorded at revision 0 and its absence is
    /// validated like any other read.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(Some(pending.clone()));
        }
        if let Some(read) = self.reads.get(key) {
            return Ok(read.value.clone());
        }
        let record = match self.store.get(key).await? {
            Some(kv) => ReadRecord {
                value: Some(kv.value),
                revision: kv.mod_revision,
            },
            None => ReadRecord {
                value: None,
                revision: 0,
            },
        };
        let value = record.value.clone();
        self.reads.insert(key.to_string(), record);
        Ok(value)
    }

    /// Queues a write; the store is untouched until commit.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.writes.insert(key.into(), value.into());
    }

    fn commit_parts(&self) -> (Vec<TxnGuard>, Vec<TxnOp>) {
        let guards = self
            .reads
            .iter()
            .map(|entry| TxnGuard::ModRevision(entry.key().clone(), entry.value().revision))
            .collect();
        let ops = self
            .writes
            .iter()
            .map(|entry| TxnOp::Put {
                key: entry.key().clone(),
                value: entry.value().clone(),
                lease: None,
            })
            .collect();
        (guards, ops)
    }
}

/// Executes transaction bodies with optimistic concurrency control: read,
/// compute, then commit through one CAS transaction gated on every read
/// revision being unchanged. Conflicts retry with fresh state; application
/// errors abort immediately.
#[derive(Debug)]
pub struct Stm {
    store: Arc<dyn VersionedStore>,
    backoff: Backoff,
}

impl Stm {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self::with_backoff(store, Backoff::default())
    }

    pub fn with_backoff(store: Arc<dyn VersionedStore>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    /// Runs `body` until it commits. `max_attempts: None` retries conflicts
    /// forever; a bound surfaces `MaxRetriesExceeded` once exhausted. The
    /// body may run several times and must have no externally observable
    /// side effects beyond its `get`/`put` calls.
    pub async fn run<F, Fut, T>(&self, max_attempts: Option<u32>, body: F) -> Result<T>
    where
        F: Fn(Arc<Txn>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_inner(max_attempts, None, body).await
    }

    /// Like [`Stm::run`], with a cancellation token checked between
    /// attempts; an attempt in flight is never interrupted mid-commit.
    pub async fn run_with_cancel<F, Fut, T>(
        &self,
        max_attempts: Option<u32>,
        cancel: CancelToken,
        body: F,
    ) -> Result<T>
    where
        F: Fn(Arc<Txn>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_inner(max_attempts, Some(cancel), body).await
    }

    async fn run_inner<F, Fut, T>(
        &self,
        max_attempts: Option<u32>,
        cancel: Option<CancelToken>,
        body: F,
    ) -> Result<T>
    where
        F: Fn(Arc<Txn>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            let txn = Arc::new(Txn::new(Arc::clone(&self.store), attempt));
            let out = match body(Arc::clone(&txn)).await {
                Ok(out) => out,
                // Infrastructure errors propagated through the body keep
                // their class; everything else is an application abort.
                Err(err) => {
                    return Err(match err.downcast::<Error>() {
                        Ok(infra) => infra,
                        Err(app) => Error::Application(app),
                    })
                }
            };

            let (guards, ops) = txn.commit_parts();
            if guards.is_empty() && ops.is_empty() {
                return Ok(out);
            }

            let response = self.store.txn(guards, ops).await?;
            if response.succeeded {
                debug!(attempt, revision = response.revision, "transaction committed");
                return Ok(out);
            }

            debug!(attempt, "read set invalidated by a concurrent commit, retrying");
            if let Some(max) = max_attempts {
                if attempt >= max {
                    return Err(Error::MaxRetriesExceeded { attempts: attempt });
                }
            }
            self.backoff.wait(attempt).await;
            attempt += 1;
        }
    }
}
