//! Queue length and wait-time estimate, blended with crowd-sourced feedback.
//!
//! The line grows by the window's arrivals and shrinks by the number of
//! people the counters can serve in one window. User reports pull the
//! published wait toward what people actually saw, but never by more than
//! [`MAX_FEEDBACK_WEIGHT`].

use crate::clock::{LocalCalendar, WINDOW_SECONDS, align_to_window};
use crate::error::EstimatorError;
use crate::estimation::signal::CountHistory;
use crate::estimation::{read_bounded, write_bounded};
use crate::feed::SignalFeed;
use crate::state::{Facility, FeedbackRecord, OperatingEvent, QueueAuditEntry, QueueState};
use crate::store::Repository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds to serve one person when no rate is configured for the meal.
pub const DEFAULT_SERVING_SECONDS: f64 = 75.0;
pub const MAX_FEEDBACK_WEIGHT: f64 = 0.3;
pub const FEEDBACK_WEIGHT_SLOPE: f64 = 0.15;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    Updated(QueueState),
    AlreadyUpdated,
    /// No meal period covers the current time.
    Closed,
}

#[derive(Clone)]
pub struct QueueContext {
    pub repository: Repository,
    pub feed: Arc<dyn SignalFeed>,
    pub history: Arc<CountHistory>,
    pub calendar: LocalCalendar,
    /// Wall-clock time of the run.
    pub now: DateTime<Utc>,
    pub io_timeout: Duration,
    pub default_serving_seconds: f64,
}

impl std::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("now", &self.now)
            .field("io_timeout", &self.io_timeout)
            .field("default_serving_seconds", &self.default_serving_seconds)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStep {
    pub line_length: f64,
    pub raw_wait_seconds: f64,
}

pub fn current_meal(events: &[OperatingEvent], now: DateTime<Utc>) -> Option<&OperatingEvent> {
    events.iter().find(|event| event.contains(now))
}

/// Per-person serving time after splitting across service lines.
///
/// Unset, non-positive or non-finite configured values use `fallback`.
pub fn effective_serving_seconds(configured: Option<f64>, fallback: f64, service_lines: u32) -> f64 {
    let seconds = configured
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .unwrap_or(fallback);
    seconds / f64::from(service_lines.max(1))
}

/// People served per window at `serving_seconds` each.
pub fn service_rate(serving_seconds: f64) -> f64 {
    WINDOW_SECONDS as f64 / serving_seconds
}

pub fn advance_queue(
    line_length: f64,
    arrivals: u32,
    service_rate: f64,
    serving_seconds: f64,
) -> QueueStep {
    let line_length = (line_length + f64::from(arrivals) - service_rate).max(0.0);
    QueueStep {
        line_length,
        raw_wait_seconds: serving_seconds * line_length,
    }
}

/// Confidence in feedback: `0.15 * ln(count)`, capped at 0.3.
pub fn feedback_weight(count: u32) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (FEEDBACK_WEIGHT_SLOPE * f64::from(count).ln()).clamp(0.0, MAX_FEEDBACK_WEIGHT)
}

/// Feedback weight and the blended wait, never below zero.
pub fn blend_wait(raw_wait_seconds: f64, feedback: &FeedbackRecord) -> (f64, f64) {
    let weight = feedback_weight(feedback.count);
    let blended = weight * feedback.observed_wait + (1.0 - weight) * raw_wait_seconds;
    (weight, blended.max(0.0))
}

/// Fold one report into a running average.
pub fn fold_feedback(record: &FeedbackRecord, observed_wait: f64) -> FeedbackRecord {
    let count = record.count.saturating_add(1);
    let total = record.observed_wait * f64::from(record.count) + observed_wait;
    FeedbackRecord {
        observed_wait: total / f64::from(count),
        count,
    }
}

pub async fn update_queue(
    ctx: QueueContext,
    facility: Facility,
) -> Result<QueueOutcome, EstimatorError> {
    let id = facility.id.as_str();
    let date = ctx.calendar.date(ctx.now);
    let events = read_bounded(
        ctx.io_timeout,
        "operating hours",
        ctx.feed.operating_hours(id, date),
    )
    .await?;
    let Some(meal) = current_meal(&events, ctx.now) else {
        debug!(facility = %id, %date, "Facility closed, skipping wait time");
        return Ok(QueueOutcome::Closed);
    };

    let current = align_to_window(ctx.now);
    let prior = match read_bounded(
        ctx.io_timeout,
        "queue state read",
        ctx.repository.queue_state(id),
    )
    .await
    {
        Ok(prior) => prior,
        Err(EstimatorError::StateCorrupt(reason)) => {
            warn!(facility = %id, reason = %reason, "Queue state corrupt, resetting line");
            None
        }
        Err(err) => return Err(err),
    };
    if let Some(prior) = prior.as_ref()
        && align_to_window(prior.timestamp) >= current
    {
        info!(facility = %id, "Wait time already updated for this window");
        return Ok(QueueOutcome::AlreadyUpdated);
    }
    let prior_line = prior.map(|state| state.line_length).unwrap_or(0.0);

    let weekday = ctx.calendar.weekday_key(ctx.now);
    let configured = match read_bounded(
        ctx.io_timeout,
        "serving time read",
        ctx.repository.serving_time(id, weekday, &meal.description),
    )
    .await
    {
        Ok(configured) => configured,
        Err(EstimatorError::StateCorrupt(reason)) => {
            warn!(facility = %id, reason = %reason, "Serving time unreadable, using default");
            None
        }
        Err(err) => return Err(err),
    };
    if configured.is_none() {
        debug!(facility = %id, meal = %meal.description, "No serving time configured, using default");
    }
    let serving_seconds = effective_serving_seconds(
        configured,
        ctx.default_serving_seconds,
        facility.effective_service_lines(),
    );
    let rate = service_rate(serving_seconds);
    let arrivals = ctx.history.entrants(id, current);
    let step = advance_queue(prior_line, arrivals, rate, serving_seconds);

    let hour = ctx.calendar.hour(ctx.now);
    let feedback = match read_bounded(
        ctx.io_timeout,
        "feedback read",
        ctx.repository.feedback(id, weekday, hour),
    )
    .await
    {
        Ok(feedback) => feedback.unwrap_or_default(),
        Err(EstimatorError::StateCorrupt(reason)) => {
            warn!(facility = %id, reason = %reason, "Feedback unreadable, ignoring");
            FeedbackRecord::default()
        }
        Err(err) => return Err(err),
    };
    let (weight, estimated_wait_seconds) = blend_wait(step.raw_wait_seconds, &feedback);

    let next = QueueState {
        line_length: step.line_length,
        estimated_wait_seconds,
        timestamp: ctx.now,
    };
    write_bounded(
        ctx.io_timeout,
        "queue state write",
        ctx.repository.put_queue_state(id, &next),
    )
    .await?;

    let audit = QueueAuditEntry {
        facility_id: id.to_string(),
        timestamp: ctx.now,
        meal: meal.description.clone(),
        service_rate: rate,
        arrivals,
        prior_line_length: prior_line,
        line_length: step.line_length,
        raw_wait_seconds: step.raw_wait_seconds,
        feedback_weight: weight,
        estimated_wait_seconds,
    };
    if let Err(err) = write_bounded(
        ctx.io_timeout,
        "audit append",
        ctx.repository.append_audit(&audit),
    )
    .await
    {
        warn!(facility = %id, error = %err, "Failed to append queue audit entry");
    }

    info!(
        facility = %id,
        meal = %meal.description,
        line_length = step.line_length,
        wait_seconds = estimated_wait_seconds,
        "Wait time updated"
    );
    Ok(QueueOutcome::Updated(next))
}

/// Fold one user report into the (facility, weekday, hour) average for `at`.
pub async fn record_feedback(
    repository: &Repository,
    calendar: &LocalCalendar,
    io_timeout: Duration,
    facility_id: &str,
    observed_wait_seconds: f64,
    at: DateTime<Utc>,
) -> Result<FeedbackRecord, EstimatorError> {
    if !observed_wait_seconds.is_finite() || observed_wait_seconds < 0.0 {
        return Err(EstimatorError::InvalidFeedback(format!(
            "observed wait {observed_wait_seconds} must be a non-negative number of seconds"
        )));
    }
    let weekday = calendar.weekday_key(at);
    let hour = calendar.hour(at);
    let existing = match read_bounded(
        io_timeout,
        "feedback read",
        repository.feedback(facility_id, weekday, hour),
    )
    .await
    {
        Ok(existing) => existing.unwrap_or_default(),
        Err(EstimatorError::StateCorrupt(reason)) => {
            warn!(facility = %facility_id, reason = %reason, "Feedback record corrupt, starting over");
            FeedbackRecord::default()
        }
        Err(err) => return Err(err),
    };
    let updated = fold_feedback(&existing, observed_wait_seconds);
    write_bounded(
        io_timeout,
        "feedback write",
        repository.put_feedback(facility_id, weekday, hour, &updated),
    )
    .await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{StaticFeed, StaticFeedBehavior};
    use crate::state::CountSnapshot;
    use crate::store::memory::MemoryStoreBehavior;
    use crate::store::repository::{feedback_key, serving_time_key};
    use crate::store::{
        AUDIT_NAMESPACE, FEEDBACK_NAMESPACE, MemoryStore, QUEUE_NAMESPACE, SERVING_TIME_NAMESPACE,
    };
    use serde_json::json;
    use chrono::{NaiveDate, TimeDelta, TimeZone};
    use std::collections::BTreeMap;

    const FACILITY: &str = "Risley";

    fn calendar() -> LocalCalendar {
        LocalCalendar::new(chrono_tz::America::New_York)
    }

    // 2026-10-19 is a Monday; 16:00 UTC is noon in New York.
    fn at(h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, mi, 0)
            .single()
            .expect("valid test timestamp")
    }

    fn lunch() -> OperatingEvent {
        OperatingEvent {
            start: at(15, 0),
            end: at(18, 0),
            description: "Lunch".to_string(),
        }
    }

    fn feed_with_lunch() -> Arc<StaticFeed> {
        let feed = Arc::new(StaticFeed::new(vec![Facility::new(FACILITY, 100)]));
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).expect("valid date");
        feed.set_hours(FACILITY, date, vec![lunch()]);
        feed
    }

    fn history(current: DateTime<Utc>, arrivals: u32) -> Arc<CountHistory> {
        Arc::new(CountHistory::new([CountSnapshot {
            timestamp: current,
            counts: BTreeMap::from([(FACILITY.to_string(), arrivals)]),
        }]))
    }

    fn context(
        store: &Arc<MemoryStore>,
        feed: Arc<StaticFeed>,
        history: Arc<CountHistory>,
        now: DateTime<Utc>,
    ) -> QueueContext {
        QueueContext {
            repository: Repository::new(store.clone()),
            feed,
            history,
            calendar: calendar(),
            now,
            io_timeout: Duration::from_secs(1),
            default_serving_seconds: DEFAULT_SERVING_SECONDS,
        }
    }

    #[test]
    fn queue_step_matches_worked_example() {
        let step = advance_queue(10.0, 5, 4.0, 1.25);
        assert_eq!(step.line_length, 11.0);
        assert_eq!(step.raw_wait_seconds, 13.75);

        let (weight, wait) = blend_wait(step.raw_wait_seconds, &FeedbackRecord::default());
        assert_eq!(weight, 0.0);
        assert_eq!(wait, 13.75);
    }

    #[test]
    fn queue_never_goes_negative() {
        for line in [0.0, 0.5, 3.0, 40.0] {
            for arrivals in [0u32, 1, 7, 100] {
                for rate in [0.0, 0.25, 4.0, 500.0] {
                    let step = advance_queue(line, arrivals, rate, 75.0);
                    assert!(step.line_length >= 0.0);
                    assert!(step.raw_wait_seconds >= 0.0);
                }
            }
        }
    }

    #[test]
    fn feedback_weight_is_bounded_and_non_decreasing() {
        let mut previous = 0.0;
        for count in 0..500u32 {
            let weight = feedback_weight(count);
            assert!((0.0..=MAX_FEEDBACK_WEIGHT).contains(&weight));
            assert!(weight >= previous, "weight dropped at {count}");
            previous = weight;
        }
        assert_eq!(feedback_weight(0), 0.0);
        assert_eq!(feedback_weight(1), 0.0);
        assert_eq!(feedback_weight(10_000), MAX_FEEDBACK_WEIGHT);
    }

    #[test]
    fn feedback_shifts_wait_toward_observation() {
        let feedback = FeedbackRecord {
            observed_wait: 600.0,
            count: 100,
        };

        let (weight, wait) = blend_wait(300.0, &feedback);

        assert_eq!(weight, MAX_FEEDBACK_WEIGHT);
        assert!((wait - 390.0).abs() < 1e-9);
    }

    #[test]
    fn blended_wait_never_goes_negative() {
        let feedback = FeedbackRecord {
            observed_wait: -100_000.0,
            count: 100,
        };

        let (_, wait) = blend_wait(2700.0, &feedback);

        assert_eq!(wait, 0.0);
    }

    #[test]
    fn serving_time_is_split_across_lines() {
        assert_eq!(effective_serving_seconds(Some(90.0), 75.0, 3), 30.0);
        assert_eq!(effective_serving_seconds(None, 75.0, 1), 75.0);
        assert_eq!(effective_serving_seconds(Some(-4.0), 75.0, 1), 75.0);
        assert_eq!(service_rate(75.0), 4.0);
    }

    #[test]
    fn fold_feedback_keeps_running_average() {
        let first = fold_feedback(&FeedbackRecord::default(), 120.0);
        let second = fold_feedback(&first, 60.0);

        assert_eq!(first, FeedbackRecord { observed_wait: 120.0, count: 1 });
        assert_eq!(second, FeedbackRecord { observed_wait: 90.0, count: 2 });
    }

    #[tokio::test]
    async fn update_uses_default_serving_time_and_persists() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        let now = at(16, 2);
        Repository::new(store.clone())
            .put_queue_state(
                FACILITY,
                &QueueState {
                    line_length: 10.0,
                    estimated_wait_seconds: 750.0,
                    timestamp: at(15, 57),
                },
            )
            .await?;

        let outcome = update_queue(
            context(&store, feed_with_lunch(), history(at(16, 0), 5), now),
            Facility::new(FACILITY, 100),
        )
        .await?;

        // 75 s per person serves 4 per window: 10 + 5 - 4 = 11 in line.
        let expected = QueueState {
            line_length: 11.0,
            estimated_wait_seconds: 825.0,
            timestamp: now,
        };
        assert_eq!(outcome, QueueOutcome::Updated(expected.clone()));
        assert_eq!(
            Repository::new(store.clone()).queue_state(FACILITY).await?,
            Some(expected)
        );
        let audit = Repository::new(store.clone()).audit_entries().await?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].service_rate, 4.0);
        assert_eq!(audit[0].arrivals, 5);
        assert_eq!(audit[0].prior_line_length, 10.0);
        Ok(())
    }

    #[tokio::test]
    async fn configured_serving_time_and_feedback_apply() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        let repository = Repository::new(store.clone());
        repository
            .put_serving_times(
                FACILITY,
                "monday",
                &BTreeMap::from([("Lunch".to_string(), 30.0)]),
            )
            .await?;
        repository
            .put_feedback(
                FACILITY,
                "monday",
                12,
                &FeedbackRecord {
                    observed_wait: 1000.0,
                    count: 100,
                },
            )
            .await?;

        let outcome = update_queue(
            context(&store, feed_with_lunch(), history(at(16, 0), 20), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        // 30 s per person serves 10 per window: 0 + 20 - 10 = 10 in line, 300 s raw.
        match outcome {
            QueueOutcome::Updated(state) => {
                assert_eq!(state.line_length, 10.0);
                assert!((state.estimated_wait_seconds - (0.3 * 1000.0 + 0.7 * 300.0)).abs() < 1e-9);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn closed_facility_is_skipped_without_writes() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(StaticFeed::new(vec![Facility::new(FACILITY, 100)]));

        let outcome = update_queue(
            context(&store, feed, history(at(16, 0), 5), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        assert_eq!(outcome, QueueOutcome::Closed);
        assert!(store.is_empty(QUEUE_NAMESPACE));
        assert!(store.is_empty(AUDIT_NAMESPACE));
        Ok(())
    }

    #[tokio::test]
    async fn meal_end_is_exclusive() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());

        let outcome = update_queue(
            context(&store, feed_with_lunch(), history(at(18, 0), 5), at(18, 0)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        assert_eq!(outcome, QueueOutcome::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn second_run_in_window_is_a_no_op() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        let feed = feed_with_lunch();
        let history = history(at(16, 0), 5);

        update_queue(
            context(&store, feed.clone(), history.clone(), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;
        let outcome = update_queue(
            context(&store, feed, history, at(16, 1) + TimeDelta::minutes(3)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        assert_eq!(outcome, QueueOutcome::AlreadyUpdated);
        assert_eq!(store.len(AUDIT_NAMESPACE), 1);
        Ok(())
    }

    #[tokio::test]
    async fn hours_failure_is_upstream_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let feed = feed_with_lunch();
        feed.set_behavior(StaticFeedBehavior::fail_hours());

        let result = update_queue(
            context(&store, feed, history(at(16, 0), 5), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await;

        assert!(matches!(result, Err(EstimatorError::UpstreamUnavailable(_))));
        assert!(store.is_empty(QUEUE_NAMESPACE));
    }

    #[tokio::test]
    async fn record_feedback_rejects_negative_waits() {
        let repository = Repository::new(Arc::new(MemoryStore::new()));

        let result = record_feedback(
            &repository,
            &calendar(),
            Duration::from_secs(1),
            FACILITY,
            -5.0,
            at(16, 0),
        )
        .await;

        assert!(matches!(result, Err(EstimatorError::InvalidFeedback(_))));
    }

    #[tokio::test]
    async fn record_feedback_accumulates_per_local_hour() -> Result<(), EstimatorError> {
        let repository = Repository::new(Arc::new(MemoryStore::new()));

        let limit = Duration::from_secs(1);
        record_feedback(&repository, &calendar(), limit, FACILITY, 100.0, at(16, 5)).await?;
        let record =
            record_feedback(&repository, &calendar(), limit, FACILITY, 200.0, at(16, 50)).await?;

        assert_eq!(record, FeedbackRecord { observed_wait: 150.0, count: 2 });
        assert_eq!(repository.feedback(FACILITY, "monday", 12).await?, Some(record));
        Ok(())
    }

    #[tokio::test]
    async fn record_feedback_times_out_on_slow_store() {
        let store = Arc::new(MemoryStore::with_behavior(MemoryStoreBehavior::delayed(
            Duration::from_millis(500),
        )));
        let repository = Repository::new(store.clone());

        let result = record_feedback(
            &repository,
            &calendar(),
            Duration::from_millis(20),
            FACILITY,
            60.0,
            at(16, 0),
        )
        .await;

        assert!(matches!(result, Err(EstimatorError::UpstreamUnavailable(_))));
        assert!(store.is_empty(FEEDBACK_NAMESPACE));
    }

    #[tokio::test]
    async fn corrupt_queue_state_resets_line() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(
            QUEUE_NAMESPACE,
            FACILITY,
            json!({"line_length": -7.0, "estimated_wait_seconds": 0.0, "timestamp": 0}),
        );

        let outcome = update_queue(
            context(&store, feed_with_lunch(), history(at(16, 0), 5), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        // Line restarts at zero: 0 + 5 - 4 = 1.
        match outcome {
            QueueOutcome::Updated(state) => {
                assert_eq!(state.line_length, 1.0);
                assert_eq!(state.estimated_wait_seconds, 75.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_serving_times_fall_back_to_default() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(
            SERVING_TIME_NAMESPACE,
            &serving_time_key(FACILITY, "monday"),
            json!("thirty seconds"),
        );

        let outcome = update_queue(
            context(&store, feed_with_lunch(), history(at(16, 0), 10), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        match outcome {
            QueueOutcome::Updated(state) => {
                assert_eq!(state.line_length, 6.0);
                assert_eq!(state.estimated_wait_seconds, 450.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let audit = Repository::new(store.clone()).audit_entries().await?;
        assert_eq!(audit[0].service_rate, 4.0);
        Ok(())
    }

    #[tokio::test]
    async fn negative_feedback_is_ignored_and_line_survives() -> Result<(), EstimatorError> {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(
            FEEDBACK_NAMESPACE,
            &feedback_key(FACILITY, "monday", 12),
            json!({"observed_wait": -100000.0, "count": 100}),
        );
        let feed = feed_with_lunch();

        let first = update_queue(
            context(&store, feed.clone(), history(at(16, 0), 40), at(16, 1)),
            Facility::new(FACILITY, 100),
        )
        .await?;
        let second = update_queue(
            context(&store, feed, Arc::new(CountHistory::default()), at(16, 6)),
            Facility::new(FACILITY, 100),
        )
        .await?;

        // 40 - 4 = 36 waiting, then four more served in the next window.
        match (first, second) {
            (QueueOutcome::Updated(first), QueueOutcome::Updated(second)) => {
                assert_eq!(first.line_length, 36.0);
                assert_eq!(first.estimated_wait_seconds, 2700.0);
                assert_eq!(second.line_length, 32.0);
                assert_eq!(second.estimated_wait_seconds, 2400.0);
            }
            other => panic!("unexpected outcomes {other:?}"),
        }
        Ok(())
    }
}
