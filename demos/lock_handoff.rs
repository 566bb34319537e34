// Two sessions contend for the same named lock; the second acquires it only
// after the first releases and the store drops the lease-bound key.

use std::sync::Arc;
use std::time::Duration;

use cordon::{test_utils, LockManager, MemoryStore, VersionedStore};

async fn print_key(store: &dyn VersionedStore, key: &str) -> anyhow::Result<()> {
    match store.get(key).await? {
        Some(kv) => println!(
            "got kv: key={} value={} revision={}",
            kv.key,
            String::from_utf8_lossy(&kv.value),
            kv.mod_revision
        ),
        None => println!("no kv for {key}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    test_utils::init_tracing();
    let store: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
    let key = "service/leader";

    print_key(store.as_ref(), key).await?;

    let manager = LockManager::new(Arc::clone(&store));
    let mut lock = manager.lock(key, Duration::from_secs(10)).await?;
    println!("first session acquired the lock at revision {}", lock.revision());
    print_key(store.as_ref(), key).await?;

    let contender_store = Arc::clone(&store);
    let contender = tokio::spawn(async move {
        let manager = LockManager::new(contender_store);
        let mut lock = manager.lock(key, Duration::from_secs(10)).await?;
        println!(
            "second session acquired the lock at revision {}",
            lock.revision()
        );
        manager.unlock(&mut lock).await?;
        println!("second session released the lock");
        anyhow::Ok(())
    });

    // Simulate a critical section while the second session waits.
    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.unlock(&mut lock).await?;
    println!("first session released the lock");

    contender.await??;
    print_key(store.as_ref(), key).await?;
    Ok(())
}
