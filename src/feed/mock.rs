use crate::feed::{FeedError, SignalFeed, TimeWindow};
use crate::state::{CountSnapshot, Facility, FacilityId, OperatingEvent};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct StaticFeedBehavior {
    pub metadata_ok: bool,
    pub counts_ok: bool,
    pub hours_ok: bool,
    /// Sleep before answering any call.
    pub delay: Option<Duration>,
}

impl StaticFeedBehavior {
    pub fn ok() -> Self {
        Self {
            metadata_ok: true,
            counts_ok: true,
            hours_ok: true,
            delay: None,
        }
    }

    pub fn fail_metadata() -> Self {
        Self {
            metadata_ok: false,
            ..Self::ok()
        }
    }

    pub fn fail_counts() -> Self {
        Self {
            counts_ok: false,
            ..Self::ok()
        }
    }

    pub fn fail_hours() -> Self {
        Self {
            hours_ok: false,
            ..Self::ok()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok()
        }
    }
}

impl Default for StaticFeedBehavior {
    fn default() -> Self {
        Self::ok()
    }
}

/// Scripted feed holding metadata, count history and hours in memory.
#[derive(Debug, Default)]
pub struct StaticFeed {
    facilities: RwLock<Vec<Facility>>,
    snapshots: RwLock<BTreeMap<DateTime<Utc>, CountSnapshot>>,
    hours: RwLock<HashMap<(FacilityId, NaiveDate), Vec<OperatingEvent>>>,
    behavior: RwLock<StaticFeedBehavior>,
    count_calls: AtomicUsize,
}

impl StaticFeed {
    pub fn new(facilities: Vec<Facility>) -> Self {
        Self {
            facilities: RwLock::new(facilities),
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, behavior: StaticFeedBehavior) {
        *self.behavior.write() = behavior;
    }

    /// Record `count` entrances for one facility in the window starting at `at`.
    pub fn set_count(&self, at: DateTime<Utc>, facility_id: &str, count: u32) {
        self.snapshots
            .write()
            .entry(at)
            .or_insert_with(|| CountSnapshot {
                timestamp: at,
                counts: BTreeMap::new(),
            })
            .counts
            .insert(facility_id.to_string(), count);
    }

    pub fn set_hours(&self, facility_id: &str, date: NaiveDate, events: Vec<OperatingEvent>) {
        self.hours
            .write()
            .insert((facility_id.to_string(), date), events);
    }

    /// How many times counts were requested.
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::Relaxed)
    }

    async fn pause(&self) {
        let delay = self.behavior.read().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SignalFeed for StaticFeed {
    async fn swipe_counts(&self, window: TimeWindow) -> Result<Vec<CountSnapshot>, FeedError> {
        self.count_calls.fetch_add(1, Ordering::Relaxed);
        self.pause().await;
        if !self.behavior.read().counts_ok {
            return Err(FeedError::Unavailable("mock counts failed".to_string()));
        }
        Ok(self
            .snapshots
            .read()
            .range(window.start..=window.end)
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }

    async fn facility_metadata(&self) -> Result<Vec<Facility>, FeedError> {
        self.pause().await;
        if !self.behavior.read().metadata_ok {
            return Err(FeedError::Unavailable("mock metadata failed".to_string()));
        }
        Ok(self.facilities.read().clone())
    }

    async fn operating_hours(
        &self,
        facility_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<OperatingEvent>, FeedError> {
        self.pause().await;
        if !self.behavior.read().hours_ok {
            return Err(FeedError::Unavailable("mock hours failed".to_string()));
        }
        Ok(self
            .hours
            .read()
            .get(&(facility_id.to_string(), date))
            .cloned()
            .unwrap_or_default())
    }
}
