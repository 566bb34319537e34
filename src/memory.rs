use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};
use crate::store::{
    Event, EventKind, KeyValue, LeaseId, Revision, TxnGuard, TxnOp, TxnResponse, VersionedStore,
    WatchStream,
};

const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Linearizable in-memory implementation of [`VersionedStore`]: all mutations
/// are serialized under one lock, so guard evaluation and apply are atomic.
/// Clones share the same state, like copies of a client connection handle.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    revision: Revision,
    keys: HashMap<String, Record>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: Vec<Watcher>,
}

#[derive(Debug, Clone)]
struct Record {
    value: Bytes,
    create_revision: Revision,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct Watcher {
    key: String,
    tx: mpsc::UnboundedSender<Event>,
}

impl MemoryStore {
    /// Must be created inside a tokio runtime: a background sweeper expires
    /// due leases so blocked watchers are woken without anyone polling.
    pub fn new() -> Self {
        let store = Self {
            inner: Arc::new(Inner::default()),
        };
        tokio::spawn(sweep_loop(Arc::downgrade(&store.inner)));
        store
    }

    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    pub fn current_revision(&self) -> Revision {
        self.inner.state.lock().revision
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_loop(inner: Weak<Inner>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        expire_due_leases(&mut inner.state.lock());
    }
}

fn expire_due_leases(state: &mut State) {
    let now = Instant::now();
    let due: Vec<LeaseId> = state
        .leases
        .iter()
        .filter(|(_, lease)| lease.deadline <= now)
        .map(|(id, _)| *id)
        .collect();
    for id in due {
        trace!(?id, "lease deadline passed");
        drop_lease(state, id);
    }
}

fn drop_lease(state: &mut State, id: LeaseId) {
    let Some(lease) = state.leases.remove(&id) else {
        return;
    };
    if lease.keys.is_empty() {
        return;
    }
    state.revision += 1;
    let revision = state.revision;
    for key in lease.keys {
        state.keys.remove(&key);
        notify(
            &mut state.watchers,
            Event {
                kind: EventKind::Delete,
                key,
                revision,
            },
        );
    }
}

fn notify(watchers: &mut Vec<Watcher>, event: Event) {
    watchers.retain(|watcher| {
        if watcher.key != event.key {
            return true;
        }
        watcher.tx.send(event.clone()).is_ok()
    });
}

fn holds(state: &State, guard: &TxnGuard) -> bool {
    match guard {
        TxnGuard::Absent(key) => !state.keys.contains_key(key),
        TxnGuard::ModRevision(key, revision) => {
            state.keys.get(key).map_or(0, |r| r.mod_revision) == *revision
        }
    }
}

fn apply_put(state: &mut State, revision: Revision, key: String, value: Bytes, lease: Option<LeaseId>) {
    let create_revision = state.keys.get(&key).map_or(revision, |r| r.create_revision);
    if let Some(old_lease) = state.keys.get(&key).and_then(|r| r.lease) {
        if Some(old_lease) != lease {
            if let Some(record) = state.leases.get_mut(&old_lease) {
                record.keys.remove(&key);
            }
        }
    }
    if let Some(id) = lease {
        if let Some(record) = state.leases.get_mut(&id) {
            record.keys.insert(key.clone());
        }
    }
    state.keys.insert(
        key.clone(),
        Record {
            value,
            create_revision,
            mod_revision: revision,
            lease,
        },
    );
    notify(
        &mut state.watchers,
        Event {
            kind: EventKind::Put,
            key,
            revision,
        },
    );
}

fn apply_delete(state: &mut State, revision: Revision, key: &str) -> bool {
    let Some(record) = state.keys.remove(key) else {
        return false;
    };
    if let Some(id) = record.lease {
        if let Some(lease) = state.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }
    notify(
        &mut state.watchers,
        Event {
            kind: EventKind::Delete,
            key: key.to_string(),
            revision,
        },
    );
    true
}

fn to_key_value(key: &str, record: &Record) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: record.value.clone(),
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        lease: record.lease,
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(Error::InvalidTtl(ttl));
        }
        let id = LeaseId::new();
        let mut state = self.inner.state.lock();
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        drop_lease(&mut self.inner.state.lock(), lease);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        let expired = match state.leases.get_mut(&lease) {
            Some(record) if record.deadline > now => {
                record.deadline = now + record.ttl;
                return Ok(record.ttl);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            drop_lease(&mut state, lease);
        }
        Err(Error::LeaseLost { id: lease })
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut state = self.inner.state.lock();
        expire_due_leases(&mut state);
        Ok(state.keys.get(key).map(|record| to_key_value(key, record)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut state = self.inner.state.lock();
        expire_due_leases(&mut state);
        let mut entries: Vec<KeyValue> = state
            .keys
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| to_key_value(key, record))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<Revision> {
        let response = self
            .txn(
                Vec::new(),
                vec![TxnOp::Put {
                    key: key.to_string(),
                    value,
                    lease,
                }],
            )
            .await?;
        Ok(response.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        expire_due_leases(&mut state);
        if !state.keys.contains_key(key) {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        Ok(apply_delete(&mut state, revision, key))
    }

    async fn txn(&self, guards: Vec<TxnGuard>, ops: Vec<TxnOp>) -> Result<TxnResponse> {
        let mut state = self.inner.state.lock();
        expire_due_leases(&mut state);
        if !guards.iter().all(|guard| holds(&state, guard)) {
            return Ok(TxnResponse {
                succeeded: false,
                revision: state.revision,
            });
        }
        for op in &ops {
            if let TxnOp::Put { lease: Some(id), .. } = op {
                if !state.leases.contains_key(id) {
                    return Err(Error::LeaseLost { id: *id });
                }
            }
        }
        if ops.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: state.revision,
            });
        }
        state.revision += 1;
        let revision = state.revision;
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => apply_put(&mut state, revision, key, value, lease),
                TxnOp::Delete { key } => {
                    apply_delete(&mut state, revision, &key);
                }
            }
        }
        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().watchers.push(Watcher {
            key: key.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[tokio::test]
    async fn transaction_bumps_revision_once() {
        let store = MemoryStore::new();
        let before = store.current_revision();
        let response = store
            .txn(
                Vec::new(),
                vec![
                    TxnOp::Put {
                        key: "a".into(),
                        value: value("1"),
                        lease: None,
                    },
                    TxnOp::Put {
                        key: "b".into(),
                        value: value("2"),
                        lease: None,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(response.succeeded);
        assert_eq!(response.revision, before + 1);
        let a = store.get("a").await.unwrap().unwrap();
        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(a.mod_revision, b.mod_revision);
    }

    #[tokio::test]
    async fn absent_guard_rejects_existing_key() {
        let store = MemoryStore::new();
        store.put("k", value("v"), None).await.unwrap();
        let response = store
            .txn(
                vec![TxnGuard::Absent("k".into())],
                vec![TxnOp::Put {
                    key: "k".into(),
                    value: value("other"),
                    lease: None,
                }],
            )
            .await
            .unwrap();
        assert!(!response.succeeded);
        assert_eq!(store.get("k").await.unwrap().unwrap().value, value("v"));
    }

    #[tokio::test]
    async fn mod_revision_zero_means_absent() {
        let store = MemoryStore::new();
        let response = store
            .txn(
                vec![TxnGuard::ModRevision("missing".into(), 0)],
                vec![TxnOp::Put {
                    key: "missing".into(),
                    value: value("now present"),
                    lease: None,
                }],
            )
            .await
            .unwrap();
        assert!(response.succeeded);

        let stale = store
            .txn(
                vec![TxnGuard::ModRevision("missing".into(), 0)],
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(!stale.succeeded);
    }

    #[tokio::test]
    async fn revoke_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("held", value("v"), Some(lease)).await.unwrap();
        let mut watch = store.watch("held").await.unwrap();

        store.revoke(lease).await.unwrap();
        assert!(store.get("held").await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);

        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "held");
    }

    #[tokio::test]
    async fn revoking_unknown_lease_is_not_an_error() {
        let store = MemoryStore::new();
        store.revoke(LeaseId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn lease_expires_without_keep_alive() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_millis(100)).await.unwrap();
        store.put("ephemeral", value("v"), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.get("ephemeral").await.unwrap().is_none());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(Error::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_millis(200)).await.unwrap();
        store.put("kept", value("v"), Some(lease)).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.keep_alive(lease).await.unwrap();
        }
        assert!(store.get("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn grant_rejects_zero_ttl() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.grant(Duration::ZERO).await,
            Err(Error::InvalidTtl(_))
        ));
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_in_order() {
        let store = MemoryStore::new();
        let mut watch = store.watch("w").await.unwrap();

        store.put("w", value("1"), None).await.unwrap();
        store.delete("w").await.unwrap();

        let first = watch.recv().await.unwrap();
        let second = watch.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Put);
        assert_eq!(second.kind, EventKind::Delete);
        assert!(second.revision > first.revision);
    }

    #[tokio::test]
    async fn get_prefix_returns_sorted_entries() {
        let store = MemoryStore::new();
        store.put("accounts/2", value("b"), None).await.unwrap();
        store.put("accounts/0", value("a"), None).await.unwrap();
        store.put("other", value("x"), None).await.unwrap();

        let entries = store.get_prefix("accounts/").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["accounts/0", "accounts/2"]);
    }
}
