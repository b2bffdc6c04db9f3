use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type FacilityId = String;

pub const DEFAULT_CAPACITY: u32 = 100;
pub const DEFAULT_STICKINESS: f64 = 1.0;
pub const DEFAULT_LOW_DENSITY: f64 = 0.5;
pub const DEFAULT_MEDIUM_DENSITY: f64 = 0.75;
pub const DEFAULT_HIGH_DENSITY: f64 = 0.85;

/// Externally managed facility descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: FacilityId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_stickiness")]
    pub stickiness: f64,
    #[serde(default)]
    pub avg_stay_length_minutes: f64,
    #[serde(flatten)]
    pub thresholds: DensityThresholds,
    #[serde(default)]
    pub service_lines: Option<u32>,
}

fn default_capacity() -> u32 {
    DEFAULT_CAPACITY
}

fn default_stickiness() -> f64 {
    DEFAULT_STICKINESS
}

impl Facility {
    pub fn new(id: impl Into<FacilityId>, capacity: u32) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            capacity,
            stickiness: DEFAULT_STICKINESS,
            avg_stay_length_minutes: 0.0,
            thresholds: DensityThresholds::default(),
            service_lines: None,
        }
    }

    /// Stickiness clamped into `[0, 1]`; non-finite values fall back to 1.
    pub fn effective_stickiness(&self) -> f64 {
        if self.stickiness.is_finite() {
            self.stickiness.clamp(0.0, 1.0)
        } else {
            DEFAULT_STICKINESS
        }
    }

    pub fn effective_service_lines(&self) -> u32 {
        self.service_lines.filter(|lines| *lines > 0).unwrap_or(1)
    }
}

/// Occupancy-ratio cut-offs, as fractions of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityThresholds {
    #[serde(default = "default_low", rename = "low_density")]
    pub low: f64,
    #[serde(default = "default_medium", rename = "medium_density")]
    pub medium: f64,
    #[serde(default = "default_high", rename = "high_density")]
    pub high: f64,
}

fn default_low() -> f64 {
    DEFAULT_LOW_DENSITY
}

fn default_medium() -> f64 {
    DEFAULT_MEDIUM_DENSITY
}

fn default_high() -> f64 {
    DEFAULT_HIGH_DENSITY
}

impl Default for DensityThresholds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_DENSITY,
            medium: DEFAULT_MEDIUM_DENSITY,
            high: DEFAULT_HIGH_DENSITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DensityLevel {
    VeryEmpty = 0,
    PrettyEmpty = 1,
    PrettyCrowded = 2,
    VeryCrowded = 3,
}

impl From<DensityLevel> for u8 {
    fn from(level: DensityLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for DensityLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::VeryEmpty),
            1 => Ok(Self::PrettyEmpty),
            2 => Ok(Self::PrettyCrowded),
            3 => Ok(Self::VeryCrowded),
            other => Err(format!("density level out of range: {other}")),
        }
    }
}

/// Entrance counts for one 5-minute window, keyed by facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSnapshot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub counts: BTreeMap<FacilityId, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensityState {
    pub populi: u32,
    pub density: DensityLevel,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for DensityState {
    fn default() -> Self {
        Self {
            populi: 0,
            density: DensityLevel::VeryEmpty,
            last_run: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub line_length: f64,
    pub estimated_wait_seconds: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Running average of user-reported waits for one (facility, weekday, hour).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub observed_wait: f64,
    pub count: u32,
}

/// One published meal period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingEvent {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub end: DateTime<Utc>,
    pub description: String,
}

impl OperatingEvent {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Write-once record of one queue update, kept for offline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAuditEntry {
    pub facility_id: FacilityId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub meal: String,
    pub service_rate: f64,
    pub arrivals: u32,
    pub prior_line_length: f64,
    pub line_length: f64,
    pub raw_wait_seconds: f64,
    pub feedback_weight: f64,
    pub estimated_wait_seconds: f64,
}

/// Facility key derived from an upstream unit name: every non-word character dropped.
pub fn strip_unit_name(name: &str) -> FacilityId {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}
