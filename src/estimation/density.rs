//! Occupancy estimate and density classification.
//!
//! There is no exit sensor. Departures are inferred from arrivals one
//! average stay earlier: whoever came in `lag` minutes ago is assumed to be
//! leaving now. Stickiness scales both flows to discount pass-through traffic.

use crate::clock::{WINDOW_MINUTES, elapsed_steps, round_to_window_minutes};
use crate::error::EstimatorError;
use crate::estimation::signal::CountHistory;
use crate::estimation::{read_bounded, write_bounded};
use crate::state::{DensityLevel, DensityState, DensityThresholds, Facility};
use crate::store::Repository;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DensityOutcome {
    Updated(DensityState),
    AlreadyUpdated,
}

/// Everything one facility update needs besides the facility itself.
#[derive(Debug, Clone)]
pub struct DensityContext {
    pub repository: Repository,
    pub history: Arc<CountHistory>,
    /// Start of the window being processed.
    pub current: DateTime<Utc>,
    pub io_timeout: Duration,
}

pub fn classify(populi: u32, capacity: u32, thresholds: &DensityThresholds) -> DensityLevel {
    let ratio = f64::from(populi) / f64::from(capacity.max(1));
    if ratio > thresholds.high {
        DensityLevel::VeryCrowded
    } else if ratio > thresholds.medium {
        DensityLevel::PrettyCrowded
    } else if ratio > thresholds.low {
        DensityLevel::PrettyEmpty
    } else {
        DensityLevel::VeryEmpty
    }
}

/// Window whose arrivals are counted as departures now, and how many times.
///
/// `steps` is `None` on a facility's first run. With one step (or none) a
/// single lookback sits `lag_minutes` before `current`. On catch-up each of
/// the `steps` lookbacks is shifted by a further `5 * (steps - 1)` minutes,
/// so all of them land on the same window and it is counted `steps` times.
pub fn departure_window(
    current: DateTime<Utc>,
    lag_minutes: i64,
    steps: Option<i64>,
) -> (DateTime<Utc>, u64) {
    match steps {
        Some(steps) if steps > 1 => {
            let offset = lag_minutes + WINDOW_MINUTES * (steps - 1);
            (current - TimeDelta::minutes(offset), steps as u64)
        }
        _ => (current - TimeDelta::minutes(lag_minutes), 1),
    }
}

/// Apply one update: add sticky entrants, remove sticky departures, clamp, classify.
pub fn advance(
    prior: &DensityState,
    facility: &Facility,
    entrants: u32,
    previous_entrants: u64,
    current: DateTime<Utc>,
) -> DensityState {
    let stickiness = facility.effective_stickiness();
    let additions = (stickiness * f64::from(entrants)).ceil() as i64;
    let removals = (stickiness * previous_entrants as f64).ceil() as i64;
    let populi = (i64::from(prior.populi) + additions - removals)
        .clamp(0, i64::from(facility.capacity)) as u32;

    DensityState {
        populi,
        density: classify(populi, facility.capacity, &facility.thresholds),
        last_run: Some(current),
    }
}

pub async fn update_density(
    ctx: DensityContext,
    facility: Facility,
) -> Result<DensityOutcome, EstimatorError> {
    let id = facility.id.as_str();
    let prior = match read_bounded(
        ctx.io_timeout,
        "density state read",
        ctx.repository.density_state(id),
    )
    .await
    {
        Ok(prior) => prior,
        Err(EstimatorError::StateCorrupt(reason)) => {
            warn!(facility = %id, reason = %reason, "Density state corrupt, resetting to defaults");
            None
        }
        Err(err) => return Err(err),
    };

    let steps = match prior.as_ref().and_then(|state| state.last_run) {
        Some(last_run) => {
            let steps = elapsed_steps(ctx.current, last_run);
            if steps <= 0 {
                info!(facility = %id, "Density already updated for this window");
                return Ok(DensityOutcome::AlreadyUpdated);
            }
            Some(steps)
        }
        None => None,
    };
    let prior = prior.unwrap_or_default();

    let lag_minutes = round_to_window_minutes(facility.avg_stay_length_minutes);
    let (departure_at, repeats) = departure_window(ctx.current, lag_minutes, steps);
    let previous_entrants =
        u64::from(ctx.history.entrants(id, departure_at)).saturating_mul(repeats);
    let entrants = ctx.history.entrants(id, ctx.current);
    debug!(
        facility = %id,
        steps = steps.unwrap_or(1),
        lag_minutes,
        entrants,
        previous_entrants,
        "Density inputs resolved"
    );

    let next = advance(&prior, &facility, entrants, previous_entrants, ctx.current);

    write_bounded(
        ctx.io_timeout,
        "density state write",
        ctx.repository.put_density_state(id, &next),
    )
    .await?;

    info!(
        facility = %id,
        populi = next.populi,
        density = u8::from(next.density),
        "Density updated"
    );
    Ok(DensityOutcome::Updated(next))
}
