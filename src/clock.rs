//! Wall-clock access and 5-minute window alignment.
//!
//! Every estimator reads time through [`Clock`] so runs can be replayed
//! deterministically, and answers civil-time questions (today's date, weekday,
//! hour) through [`LocalCalendar`], which resolves offsets and DST from the
//! time-zone database instead of a fixed UTC offset.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;

/// Length of one counting window.
pub const WINDOW_MINUTES: i64 = 5;
pub const WINDOW_SECONDS: i64 = WINDOW_MINUTES * 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.now.lock();
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Floor `now` to the start of its 5-minute window (seconds truncated).
pub fn align_to_window(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let floored = secs - secs.rem_euclid(WINDOW_SECONDS);
    DateTime::from_timestamp(floored, 0).unwrap_or(now)
}

/// Number of window boundaries between `last_run` and the aligned `current`.
///
/// Zero or negative means the window has already been processed.
pub fn elapsed_steps(current: DateTime<Utc>, last_run: DateTime<Utc>) -> i64 {
    let delta = current - align_to_window(last_run);
    (delta.num_seconds() as f64 / WINDOW_SECONDS as f64).round() as i64
}

/// `minutes` rounded to the nearest multiple of the window length.
pub fn round_to_window_minutes(minutes: f64) -> i64 {
    if !minutes.is_finite() || minutes <= 0.0 {
        return 0;
    }
    WINDOW_MINUTES * (minutes / WINDOW_MINUTES as f64).round() as i64
}

/// Civil-time view of UTC instants in one configured zone.
#[derive(Debug, Clone, Copy)]
pub struct LocalCalendar {
    tz: Tz,
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    pub fn weekday(&self, at: DateTime<Utc>) -> Weekday {
        at.with_timezone(&self.tz).weekday()
    }

    pub fn hour(&self, at: DateTime<Utc>) -> u32 {
        at.with_timezone(&self.tz).hour()
    }

    /// Lowercase weekday name, used in store keys.
    pub fn weekday_key(&self, at: DateTime<Utc>) -> &'static str {
        weekday_key(self.weekday(at))
    }

    /// Interpret a naive local time in this zone.
    ///
    /// Ambiguous times (DST fall-back) resolve to the earlier instant;
    /// times skipped by a spring-forward transition return `None`.
    pub fn resolve_local(&self, naive: chrono::NaiveDateTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }
}

pub fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}
