//! Conversion of the upstream swipe payload into count snapshots.
//!
//! The payload stamps each reading with a local wall-clock string and no
//! offset, so the zone (and its DST rules) comes from the configured
//! [`LocalCalendar`].

use crate::clock::{LocalCalendar, align_to_window};
use crate::feed::FeedError;
use crate::state::{CountSnapshot, strip_unit_name};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const FEED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

#[derive(Debug, Clone, Deserialize)]
pub struct SwipePayload {
    #[serde(rename = "TIMESTAMP")]
    pub timestamp: String,
    #[serde(rename = "UNITS", default)]
    pub units: Vec<UnitCount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitCount {
    #[serde(rename = "UNIT_NAME")]
    pub unit_name: String,
    #[serde(rename = "CROWD_COUNT", default)]
    pub crowd_count: u32,
}

pub fn parse_feed_timestamp(
    raw: &str,
    calendar: &LocalCalendar,
) -> Result<DateTime<Utc>, FeedError> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), FEED_TIMESTAMP_FORMAT)
        .map_err(|err| FeedError::InvalidTimestamp(format!("{raw}: {err}")))?;
    calendar.resolve_local(naive).ok_or_else(|| {
        FeedError::InvalidTimestamp(format!(
            "{raw} does not exist in {}",
            calendar.timezone()
        ))
    })
}

/// Snapshot keyed by the aligned window start, one entry per stripped unit name.
pub fn snapshot_from_payload(
    payload: &SwipePayload,
    calendar: &LocalCalendar,
) -> Result<CountSnapshot, FeedError> {
    let timestamp = align_to_window(parse_feed_timestamp(&payload.timestamp, calendar)?);
    let counts: BTreeMap<_, _> = payload
        .units
        .iter()
        .map(|unit| (strip_unit_name(&unit.unit_name), unit.crowd_count))
        .collect();
    Ok(CountSnapshot { timestamp, counts })
}
