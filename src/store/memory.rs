use crate::store::{KeyedStore, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Failure switches for exercising error paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreBehavior {
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Keys whose writes fail in any namespace.
    pub fail_writes_for: HashSet<String>,
    /// Sleep before answering any call.
    pub delay: Option<Duration>,
}

impl MemoryStoreBehavior {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn fail_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_writes_for(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fail_writes_for: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// In-process store; state lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
    behavior: RwLock<MemoryStoreBehavior>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MemoryStoreBehavior) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            behavior: RwLock::new(behavior),
        }
    }

    pub fn set_behavior(&self, behavior: MemoryStoreBehavior) {
        *self.behavior.write() = behavior;
    }

    /// Seed a record directly, bypassing failure switches.
    pub fn insert_raw(&self, namespace: &str, key: &str, value: Value) {
        self.records
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get_raw(&self, namespace: &str, key: &str) -> Option<Value> {
        self.records
            .read()
            .get(namespace)
            .and_then(|records| records.get(key))
            .cloned()
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.records
            .read()
            .get(namespace)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    async fn pause(&self) {
        let delay = self.behavior.read().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.behavior.read().fail_reads {
            Err(StoreError::Unavailable("mock read failed".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self, key: &str) -> Result<(), StoreError> {
        let behavior = self.behavior.read();
        if behavior.fail_writes || behavior.fail_writes_for.contains(key) {
            Err(StoreError::Unavailable(format!("mock write failed for {key}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.pause().await;
        self.check_read()?;
        Ok(self.get_raw(namespace, key))
    }

    async fn upsert(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.pause().await;
        self.check_write(key)?;
        self.insert_raw(namespace, key, value);
        Ok(())
    }

    async fn query(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.pause().await;
        self.check_read()?;
        Ok(self
            .records
            .read()
            .get(namespace)
            .map(|records| {
                records
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
