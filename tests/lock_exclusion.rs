use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cordon::{cancel_pair, Backoff, Error, LockManager, MemoryStore, VersionedStore};
use tokio::sync::Barrier;

fn shared_store() -> (MemoryStore, Arc<dyn VersionedStore>) {
    let store = MemoryStore::new();
    let handle: Arc<dyn VersionedStore> = Arc::new(store.clone());
    (store, handle)
}

fn fast_manager(store: Arc<dyn VersionedStore>) -> LockManager {
    LockManager::with_backoff(
        store,
        Backoff::new(Duration::from_millis(5), Duration::from_millis(100)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lockers_never_lose_an_update() {
    let (_store, store) = shared_store();
    store.put("counter", Bytes::from("0"), None).await.unwrap();

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for _ in 0..workers {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let manager = fast_manager(Arc::clone(&store));
            barrier.wait().await;
            let mut lock = manager
                .lock("counter-lock", Duration::from_secs(2))
                .await
                .unwrap();

            // Unguarded read-modify-write, safe only because the lock
            // serializes the sessions.
            let current = store.get("counter").await.unwrap().unwrap();
            let count: u64 = std::str::from_utf8(&current.value)
                .unwrap()
                .parse()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store
                .put("counter", Bytes::from((count + 1).to_string()), None)
                .await
                .unwrap();

            manager.unlock(&mut lock).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let counter = store.get("counter").await.unwrap().unwrap();
    assert_eq!(std::str::from_utf8(&counter.value).unwrap(), "8");
}

#[tokio::test]
async fn lock_waits_for_holder_release() {
    let (_store, store) = shared_store();
    let holder = fast_manager(Arc::clone(&store));
    let mut held = holder.lock("handoff", Duration::from_secs(2)).await.unwrap();
    let held_revision = held.revision();

    let contender_store = Arc::clone(&store);
    let waiter = tokio::spawn(async move {
        let manager = fast_manager(contender_store);
        let mut lock = manager.lock("handoff", Duration::from_secs(2)).await.unwrap();
        let revision = lock.revision();
        manager.unlock(&mut lock).await.unwrap();
        revision
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    holder.unlock(&mut held).await.unwrap();
    let later_revision = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(later_revision > held_revision);
}

#[tokio::test]
async fn unlock_is_idempotent() {
    let (_store, store) = shared_store();
    let manager = fast_manager(store);
    let mut lock = manager.lock("once", Duration::from_secs(2)).await.unwrap();

    manager.unlock(&mut lock).await.unwrap();
    assert!(matches!(
        manager.unlock(&mut lock).await,
        Err(Error::NotHeld)
    ));
}

#[tokio::test]
async fn cancelled_wait_leaves_no_lease_behind() {
    let (mem, store) = shared_store();
    let holder = fast_manager(Arc::clone(&store));
    let mut held = holder.lock("busy", Duration::from_secs(2)).await.unwrap();

    let (handle, token) = cancel_pair();
    let contender_store = Arc::clone(&store);
    let waiter = tokio::spawn(async move {
        let manager = fast_manager(contender_store);
        manager
            .lock_with_cancel("busy", Duration::from_secs(2), token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!waiter.is_finished());
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(mem.lease_count(), 1);

    holder.unlock(&mut held).await.unwrap();
    assert_eq!(mem.lease_count(), 0);
}

#[tokio::test]
async fn pre_cancelled_token_short_circuits() {
    let (mem, store) = shared_store();
    let manager = fast_manager(store);

    let (handle, token) = cancel_pair();
    handle.cancel();

    let result = manager
        .lock_with_cancel("free", Duration::from_secs(2), token)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(mem.lease_count(), 0);
}
