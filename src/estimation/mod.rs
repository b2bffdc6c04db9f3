use crate::clock::{Clock, LocalCalendar, align_to_window};
use crate::error::EstimatorError;
use crate::feed::{SignalFeed, TimeWindow, validate_facility};
use crate::state::{DensityState, Facility, FacilityId, FeedbackRecord};
use crate::store::Repository;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub mod density;
pub mod queue;
pub mod signal;

use density::{DensityContext, DensityOutcome, update_density};
use queue::{DEFAULT_SERVING_SECONDS, QueueContext, QueueOutcome, update_queue};
use signal::CountHistory;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HISTORY_WINDOW_MINUTES: i64 = 120;

/// Await an upstream read, turning a timeout into `UpstreamUnavailable`.
pub async fn read_bounded<T, E, F>(
    limit: Duration,
    what: &str,
    fut: F,
) -> Result<T, EstimatorError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<EstimatorError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(EstimatorError::UpstreamUnavailable(format!(
            "{what} timed out after {limit:?}"
        ))),
    }
}

/// Await a write; any failure, including a timeout, is a `PersistFailure`.
pub async fn write_bounded<T, E, F>(
    limit: Duration,
    what: &str,
    fut: F,
) -> Result<T, EstimatorError>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(|err| EstimatorError::persist(format!("{what}: {err}"))),
        Err(_) => Err(EstimatorError::persist(format!(
            "{what} timed out after {limit:?}"
        ))),
    }
}

#[derive(Debug)]
pub struct FacilityOutcome<T> {
    pub facility_id: FacilityId,
    pub result: Result<T, EstimatorError>,
}

/// One outcome per facility, in configured order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub window: DateTime<Utc>,
    pub outcomes: Vec<FacilityOutcome<T>>,
    /// Failure that skipped the whole batch, such as missing metadata.
    ///
    /// Set even when `outcomes` is empty because the facility list itself
    /// could not be resolved.
    pub error: Option<EstimatorError>,
}

impl<T> BatchReport<T> {
    pub fn get(&self, facility_id: &str) -> Option<&Result<T, EstimatorError>> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.facility_id == facility_id)
            .map(|outcome| &outcome.result)
    }

    /// Failed facilities, counting an unresolved facility list as one.
    pub fn failures(&self) -> usize {
        let failed = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .count();
        if failed == 0 && self.error.is_some() { 1 } else { failed }
    }
}

/// Facilities a batch should update, plus the batch-wide failure if any.
struct Resolved {
    facilities: Vec<(FacilityId, Result<Facility, EstimatorError>)>,
    error: Option<EstimatorError>,
}

#[derive(Debug)]
pub struct TickReport {
    pub density: BatchReport<DensityOutcome>,
    pub queue: BatchReport<QueueOutcome>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Facilities to update; empty means every facility in the metadata.
    pub facility_ids: Vec<FacilityId>,
    pub io_timeout: Duration,
    pub history_window_minutes: i64,
    pub default_serving_seconds: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            facility_ids: Vec::new(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            history_window_minutes: DEFAULT_HISTORY_WINDOW_MINUTES,
            default_serving_seconds: DEFAULT_SERVING_SECONDS,
        }
    }
}

type Pending<T> = Vec<(FacilityId, Result<JoinHandle<Result<T, EstimatorError>>, EstimatorError>)>;

pub struct Engine {
    repository: Repository,
    feed: Arc<dyn SignalFeed>,
    clock: Arc<dyn Clock>,
    calendar: LocalCalendar,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        repository: Repository,
        feed: Arc<dyn SignalFeed>,
        clock: Arc<dyn Clock>,
        calendar: LocalCalendar,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repository,
            feed,
            clock,
            calendar,
            settings,
        }
    }

    pub async fn run_density_batch(&self) -> BatchReport<DensityOutcome> {
        let current = align_to_window(self.clock.now());
        let Resolved {
            facilities,
            mut error,
        } = self.resolve_facilities().await;
        let history = match self.fetch_history(current).await {
            Ok(history) => Ok(Arc::new(history)),
            Err(err) => {
                warn!(error = %err, "Swipe counts unavailable, skipping density updates");
                let reason = err.to_string();
                error.get_or_insert(err);
                Err(reason)
            }
        };

        let mut pending: Pending<DensityOutcome> = Vec::with_capacity(facilities.len());
        for (id, facility) in facilities {
            let task = match (facility, &history) {
                (Ok(facility), Ok(history)) => {
                    let ctx = DensityContext {
                        repository: self.repository.clone(),
                        history: history.clone(),
                        current,
                        io_timeout: self.settings.io_timeout,
                    };
                    Ok(tokio::spawn(update_density(ctx, facility)))
                }
                (Err(err), _) => Err(err),
                (_, Err(reason)) => Err(EstimatorError::UpstreamUnavailable(reason.clone())),
            };
            pending.push((id, task));
        }

        BatchReport {
            window: current,
            outcomes: collect(pending).await,
            error,
        }
    }

    pub async fn run_queue_batch(&self) -> BatchReport<QueueOutcome> {
        let now = self.clock.now();
        let current = align_to_window(now);
        let Resolved { facilities, error } = self.resolve_facilities().await;
        let history = match self.fetch_history(current).await {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %err, "Swipe counts unavailable, assuming no arrivals");
                CountHistory::default()
            }
        };
        let history = Arc::new(history);

        let mut pending: Pending<QueueOutcome> = Vec::with_capacity(facilities.len());
        for (id, facility) in facilities {
            let task = facility.map(|facility| {
                let ctx = QueueContext {
                    repository: self.repository.clone(),
                    feed: self.feed.clone(),
                    history: history.clone(),
                    calendar: self.calendar,
                    now,
                    io_timeout: self.settings.io_timeout,
                    default_serving_seconds: self.settings.default_serving_seconds,
                };
                tokio::spawn(update_queue(ctx, facility))
            });
            pending.push((id, task));
        }

        BatchReport {
            window: current,
            outcomes: collect(pending).await,
            error,
        }
    }

    /// Density batch then queue batch, each outcome logged.
    pub async fn run_tick(&self) -> TickReport {
        let density = self.run_density_batch().await;
        if let Some(err) = &density.error {
            error!(error = %err, "Density batch failed");
        }
        for outcome in &density.outcomes {
            if let Err(err) = &outcome.result {
                error!(facility = %outcome.facility_id, error = %err, "Density update failed");
            }
        }

        let queue = self.run_queue_batch().await;
        if let Some(err) = &queue.error {
            error!(error = %err, "Wait time batch failed");
        }
        for outcome in &queue.outcomes {
            if let Err(err) = &outcome.result {
                error!(facility = %outcome.facility_id, error = %err, "Wait time update failed");
            }
        }

        info!(
            window = %density.window,
            density_failures = density.failures(),
            queue_failures = queue.failures(),
            "Tick finished"
        );
        TickReport { density, queue }
    }

    pub async fn record_feedback(
        &self,
        facility_id: &str,
        observed_wait_seconds: f64,
    ) -> Result<FeedbackRecord, EstimatorError> {
        queue::record_feedback(
            &self.repository,
            &self.calendar,
            self.settings.io_timeout,
            facility_id,
            observed_wait_seconds,
            self.clock.now(),
        )
        .await
    }

    pub async fn density_levels(&self) -> Result<Vec<(FacilityId, DensityState)>, EstimatorError> {
        read_bounded(
            self.settings.io_timeout,
            "density levels",
            self.repository.density_levels(),
        )
        .await
    }

    /// Metadata for each facility to update, or why it must be skipped.
    async fn resolve_facilities(&self) -> Resolved {
        let metadata = read_bounded(
            self.settings.io_timeout,
            "facility metadata",
            self.feed.facility_metadata(),
        )
        .await;
        let mut known: HashMap<FacilityId, Facility> = match metadata {
            Ok(facilities) => facilities
                .into_iter()
                .map(|facility| (facility.id.clone(), facility))
                .collect(),
            Err(err) => {
                warn!(error = %err, "Facility metadata unavailable");
                let reason = err.to_string();
                let facilities = self
                    .settings
                    .facility_ids
                    .iter()
                    .map(|id| (id.clone(), Err(EstimatorError::UpstreamUnavailable(reason.clone()))))
                    .collect();
                return Resolved {
                    facilities,
                    error: Some(err),
                };
            }
        };

        let ids = if self.settings.facility_ids.is_empty() {
            let mut ids: Vec<FacilityId> = known.keys().cloned().collect();
            ids.sort();
            ids
        } else {
            self.settings.facility_ids.clone()
        };

        let facilities = ids
            .into_iter()
            .map(|id| {
                let facility = match known.remove(&id) {
                    Some(facility) => validate_facility(&facility)
                        .map(|()| facility)
                        .map_err(EstimatorError::from),
                    None => Err(EstimatorError::UpstreamUnavailable(format!(
                        "no metadata for facility {id}"
                    ))),
                };
                (id, facility)
            })
            .collect();
        Resolved {
            facilities,
            error: None,
        }
    }

    async fn fetch_history(&self, current: DateTime<Utc>) -> Result<CountHistory, EstimatorError> {
        let start = current - TimeDelta::minutes(self.settings.history_window_minutes.max(0));
        let snapshots = read_bounded(
            self.settings.io_timeout,
            "swipe counts",
            self.feed.swipe_counts(TimeWindow::new(start, current)),
        )
        .await?;
        let history = CountHistory::new(snapshots);
        debug!(%start, %current, snapshots = history.len(), "Fetched swipe history");
        Ok(history)
    }
}

async fn collect<T>(pending: Pending<T>) -> Vec<FacilityOutcome<T>> {
    let mut outcomes = Vec::with_capacity(pending.len());
    for (facility_id, task) in pending {
        let result = match task {
            Ok(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(EstimatorError::TaskFailed(err.to_string())),
            },
            Err(err) => Err(err),
        };
        outcomes.push(FacilityOutcome {
            facility_id,
            result,
        });
    }
    outcomes
}

/// Tick every `period` until `shutdown` resolves.
///
/// A tick that overruns the period delays the next one rather than
/// stacking ticks up. Ticks are counted from startup, not from 5-minute
/// boundaries; each estimator aligns to the window itself and treats a
/// second tick in the same window as already updated.
pub async fn run_scheduler(
    engine: Arc<Engine>,
    period: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping scheduler");
                break;
            }
            _ = ticker.tick() => {
                engine.run_tick().await;
            }
        }
    }
}
