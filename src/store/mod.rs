//! Keyed state store seam.
//!
//! The backing store only promises single-key atomic upserts; nothing here
//! assumes transactions or cross-key locks.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::Repository;

pub const DENSITY_NAMESPACE: &str = "density_info";
pub const QUEUE_NAMESPACE: &str = "line_lengths";
pub const FEEDBACK_NAMESPACE: &str = "feedback";
pub const SERVING_TIME_NAMESPACE: &str = "service_rates";
pub const AUDIT_NAMESPACE: &str = "queue_audit";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace one record. Atomic for this key only.
    async fn upsert(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// All records of a namespace, ordered by key.
    async fn query(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError>;
}
