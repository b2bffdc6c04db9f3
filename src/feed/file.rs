//! Feed backed by a JSON document on disk.
//!
//! The document is re-read on every call so an external process can keep
//! replacing it between ticks. Swipe readings are kept in the upstream payload
//! shape and converted through [`ingest`](crate::feed::ingest).

use crate::clock::LocalCalendar;
use crate::feed::ingest::{SwipePayload, snapshot_from_payload};
use crate::feed::{FeedError, SignalFeed, TimeWindow};
use crate::state::{CountSnapshot, Facility, FacilityId, OperatingEvent};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub facilities: Vec<Facility>,
    #[serde(default)]
    pub readings: Vec<SwipePayload>,
    #[serde(default)]
    pub hours: HashMap<FacilityId, Vec<DailyHours>>,
}

#[derive(Debug, Deserialize)]
pub struct DailyHours {
    pub date: NaiveDate,
    #[serde(default)]
    pub events: Vec<MealEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealEvent {
    pub descr: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end_timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FileFeed {
    path: PathBuf,
    calendar: LocalCalendar,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>, calendar: LocalCalendar) -> Self {
        Self {
            path: path.into(),
            calendar,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<FeedDocument, FeedError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[async_trait]
impl SignalFeed for FileFeed {
    async fn swipe_counts(&self, window: TimeWindow) -> Result<Vec<CountSnapshot>, FeedError> {
        let document = self.load().await?;
        let mut snapshots = BTreeMap::new();
        for payload in &document.readings {
            match snapshot_from_payload(payload, &self.calendar) {
                Ok(snapshot) if window.contains(snapshot.timestamp) => {
                    snapshots.insert(snapshot.timestamp, snapshot);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(timestamp = %payload.timestamp, error = %err, "Skipping unreadable swipe reading");
                }
            }
        }
        Ok(snapshots.into_values().collect())
    }

    async fn facility_metadata(&self) -> Result<Vec<Facility>, FeedError> {
        Ok(self.load().await?.facilities)
    }

    async fn operating_hours(
        &self,
        facility_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<OperatingEvent>, FeedError> {
        let document = self.load().await?;
        let events = document
            .hours
            .get(facility_id)
            .and_then(|days| days.iter().find(|day| day.date == date))
            .map(|day| {
                day.events
                    .iter()
                    .map(|event| OperatingEvent {
                        start: event.start_timestamp,
                        end: event.end_timestamp,
                        description: event.descr.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }
}
