use anyhow::Context;
use bytes::Bytes;

use crate::store::VersionedStore;
use crate::Result;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn account_key(index: usize) -> String {
    format!("accounts/{index}")
}

pub async fn seed_accounts(
    store: &dyn VersionedStore,
    count: usize,
    balance: i64,
) -> Result<()> {
    for index in 0..count {
        store
            .put(&account_key(index), Bytes::from(balance.to_string()), None)
            .await?;
    }
    Ok(())
}

pub fn parse_balance(value: &Bytes) -> anyhow::Result<i64> {
    let text = std::str::from_utf8(value).context("balance is not utf-8")?;
    text.parse().with_context(|| format!("bad balance {text:?}"))
}

pub async fn total_balance(store: &dyn VersionedStore, prefix: &str) -> anyhow::Result<i64> {
    let mut sum = 0;
    for kv in store.get_prefix(prefix).await? {
        sum += parse_balance(&kv.value)?;
    }
    Ok(sum)
}
