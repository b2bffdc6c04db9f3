//! Raw signal feed seam: swipe counts, facility metadata and operating hours.

use crate::state::{CountSnapshot, Facility, OperatingEvent};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

pub mod file;
pub mod ingest;
pub mod mock;

pub use file::FileFeed;
pub use mock::{StaticFeed, StaticFeedBehavior};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read feed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse feed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid feed timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid facility metadata: {0}")]
    InvalidMetadata(String),
}

/// Closed interval of window start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

#[async_trait]
pub trait SignalFeed: Send + Sync {
    /// Count snapshots whose window start lies in `window`.
    async fn swipe_counts(&self, window: TimeWindow) -> Result<Vec<CountSnapshot>, FeedError>;

    async fn facility_metadata(&self) -> Result<Vec<Facility>, FeedError>;

    /// Published meal periods for `facility_id` on the local `date`.
    async fn operating_hours(
        &self,
        facility_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<OperatingEvent>, FeedError>;
}

/// Reject metadata the estimators cannot work with.
pub fn validate_facility(facility: &Facility) -> Result<(), FeedError> {
    if facility.capacity == 0 {
        return Err(FeedError::InvalidMetadata(format!(
            "{} has zero capacity",
            facility.id
        )));
    }
    let t = facility.thresholds;
    if !(t.low <= t.medium && t.medium <= t.high) {
        return Err(FeedError::InvalidMetadata(format!(
            "{} thresholds not ascending: {}/{}/{}",
            facility.id, t.low, t.medium, t.high
        )));
    }
    Ok(())
}
