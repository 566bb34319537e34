use std::time::Duration;

use thiserror::Error;

use crate::store::LeaseId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lease {id:?} expired or was revoked")]
    LeaseLost { id: LeaseId },

    #[error("invalid lease ttl {0:?}: must be greater than zero")]
    InvalidTtl(Duration),

    #[error("lock is not held")]
    NotHeld,

    #[error("retry budget exhausted after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("transaction aborted by application: {0}")]
    Application(#[from] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
