// Concurrent balance transfers through the STM engine; the total is
// conserved no matter how the optimistic commits interleave.

use std::sync::Arc;

use anyhow::Context;
use cordon::test_utils::{account_key, init_tracing, parse_balance, seed_accounts, total_balance};
use cordon::{MemoryStore, Stm, VersionedStore};
use rand::Rng;

const ACCOUNTS: usize = 5;
const SEED_BALANCE: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let store: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
    seed_accounts(store.as_ref(), ACCOUNTS, SEED_BALANCE).await?;

    let mut workers = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        workers.push(tokio::spawn(async move {
            let stm = Stm::new(store);
            let (from, to) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(0..ACCOUNTS),
                    rng.random_range(0..ACCOUNTS),
                )
            };
            stm.run(None, move |txn| async move {
                if from == to {
                    return Ok(());
                }
                let from_key = account_key(from);
                let to_key = account_key(to);
                let from_balance =
                    parse_balance(&txn.get(&from_key).await?.context("missing account")?)?;
                let to_balance =
                    parse_balance(&txn.get(&to_key).await?.context("missing account")?)?;
                let transfer = from_balance / 2;
                txn.put(from_key, (from_balance - transfer).to_string());
                txn.put(to_key, (to_balance + transfer).to_string());
                Ok(())
            })
            .await
        }));
    }
    for worker in workers {
        worker.await??;
    }

    let sum = total_balance(store.as_ref(), "accounts/").await?;
    println!("account sum is: {sum}");
    anyhow::ensure!(
        sum == ACCOUNTS as i64 * SEED_BALANCE,
        "total value was not conserved"
    );
    Ok(())
}
