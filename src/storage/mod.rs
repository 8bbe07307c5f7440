pub mod checkpoint;
pub mod redis;

use thiserror::Error;

use crate::error::ErrorKind;

// Re-export common types
pub use checkpoint::{CheckpointStore, CheckpointStoreFactory, FileCheckpointStore, MemoryCheckpointStore};
pub use self::redis::RedisCheckpointStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Unsupported storage type: {0}")]
    Unsupported(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unsupported(_) | StoreError::Serialization(_) => ErrorKind::Permanent,
            StoreError::Io(_) | StoreError::Redis(_) => ErrorKind::Transient,
        }
    }
}
