use crate::state::{
    DensityLevel, DensityState, FacilityId, FeedbackRecord, QueueAuditEntry, QueueState,
};
use crate::store::{
    AUDIT_NAMESPACE, DENSITY_NAMESPACE, FEEDBACK_NAMESPACE, KeyedStore, QUEUE_NAMESPACE,
    SERVING_TIME_NAMESPACE, StoreError,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Typed access to the records the estimators own or read.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KeyedStore>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

/// Density record as persisted, before invariants are checked.
#[derive(Debug, Deserialize)]
struct StoredDensity {
    populi: i64,
    density: i64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_run: Option<DateTime<Utc>>,
}

pub fn feedback_key(facility_id: &str, weekday: &str, hour: u32) -> String {
    format!("{facility_id}/{weekday}/{hour}")
}

pub fn serving_time_key(facility_id: &str, weekday: &str) -> String {
    format!("{facility_id}/{weekday}")
}

impl Repository {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    pub async fn density_state(&self, facility_id: &str) -> Result<Option<DensityState>, StoreError> {
        match self.store.get(DENSITY_NAMESPACE, facility_id).await? {
            Some(value) => decode_density(facility_id, value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put_density_state(
        &self,
        facility_id: &str,
        state: &DensityState,
    ) -> Result<(), StoreError> {
        let mut value = encode(facility_id, state)?;
        if let Value::Object(map) = &mut value {
            map.insert("id".to_string(), Value::String(facility_id.to_string()));
        }
        self.store.upsert(DENSITY_NAMESPACE, facility_id, value).await
    }

    /// Every readable density record, ordered by facility.
    ///
    /// Corrupt records are skipped with a warning.
    pub async fn density_levels(&self) -> Result<Vec<(FacilityId, DensityState)>, StoreError> {
        let records = self.store.query(DENSITY_NAMESPACE).await?;
        let mut levels = Vec::with_capacity(records.len());
        for (key, value) in records {
            match decode_density(&key, value) {
                Ok(state) => levels.push((key, state)),
                Err(err) => warn!(facility = %key, error = %err, "Skipping unreadable density record"),
            }
        }
        levels.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(levels)
    }

    pub async fn queue_state(&self, facility_id: &str) -> Result<Option<QueueState>, StoreError> {
        let Some(value) = self.store.get(QUEUE_NAMESPACE, facility_id).await? else {
            return Ok(None);
        };
        let state: QueueState = decode(facility_id, value)?;
        if !state.line_length.is_finite() || state.line_length < 0.0 {
            return Err(corrupt(
                facility_id,
                format!("line length {} out of range", state.line_length),
            ));
        }
        if !state.estimated_wait_seconds.is_finite() || state.estimated_wait_seconds < 0.0 {
            return Err(corrupt(
                facility_id,
                format!("wait {} out of range", state.estimated_wait_seconds),
            ));
        }
        Ok(Some(state))
    }

    pub async fn put_queue_state(
        &self,
        facility_id: &str,
        state: &QueueState,
    ) -> Result<(), StoreError> {
        let value = encode(facility_id, state)?;
        self.store.upsert(QUEUE_NAMESPACE, facility_id, value).await
    }

    pub async fn feedback(
        &self,
        facility_id: &str,
        weekday: &str,
        hour: u32,
    ) -> Result<Option<FeedbackRecord>, StoreError> {
        let key = feedback_key(facility_id, weekday, hour);
        let Some(value) = self.store.get(FEEDBACK_NAMESPACE, &key).await? else {
            return Ok(None);
        };
        let record: FeedbackRecord = decode(&key, value)?;
        if !record.observed_wait.is_finite() || record.observed_wait < 0.0 {
            return Err(corrupt(
                &key,
                format!("observed wait {} out of range", record.observed_wait),
            ));
        }
        Ok(Some(record))
    }

    pub async fn put_feedback(
        &self,
        facility_id: &str,
        weekday: &str,
        hour: u32,
        record: &FeedbackRecord,
    ) -> Result<(), StoreError> {
        let key = feedback_key(facility_id, weekday, hour);
        let value = encode(&key, record)?;
        self.store.upsert(FEEDBACK_NAMESPACE, &key, value).await
    }

    /// Seconds per person for one meal, if configured.
    pub async fn serving_time(
        &self,
        facility_id: &str,
        weekday: &str,
        meal: &str,
    ) -> Result<Option<f64>, StoreError> {
        let key = serving_time_key(facility_id, weekday);
        let Some(value) = self.store.get(SERVING_TIME_NAMESPACE, &key).await? else {
            return Ok(None);
        };
        let meals: BTreeMap<String, f64> = decode(&key, value)?;
        Ok(meals.get(meal).copied())
    }

    pub async fn put_serving_times(
        &self,
        facility_id: &str,
        weekday: &str,
        meals: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        let key = serving_time_key(facility_id, weekday);
        let value = encode(&key, meals)?;
        self.store.upsert(SERVING_TIME_NAMESPACE, &key, value).await
    }

    pub async fn append_audit(&self, entry: &QueueAuditEntry) -> Result<(), StoreError> {
        let key = format!(
            "{}/{}",
            entry.facility_id,
            entry.timestamp.timestamp_millis()
        );
        let value = encode(&key, entry)?;
        self.store.upsert(AUDIT_NAMESPACE, &key, value).await
    }

    pub async fn audit_entries(&self) -> Result<Vec<QueueAuditEntry>, StoreError> {
        self.store
            .query(AUDIT_NAMESPACE)
            .await?
            .into_iter()
            .map(|(key, value)| decode(&key, value))
            .collect()
    }
}

fn decode_density(key: &str, value: Value) -> Result<DensityState, StoreError> {
    let stored: StoredDensity = decode(key, value)?;
    let populi = u32::try_from(stored.populi)
        .map_err(|_| corrupt(key, format!("populi {} out of range", stored.populi)))?;
    let density = u8::try_from(stored.density)
        .ok()
        .and_then(|level| DensityLevel::try_from(level).ok())
        .ok_or_else(|| corrupt(key, format!("density {} out of range", stored.density)))?;
    Ok(DensityState {
        populi,
        density,
        last_run: stored.last_run,
    })
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| corrupt(key, err.to_string()))
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}

fn corrupt(key: &str, reason: String) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason,
    }
}
