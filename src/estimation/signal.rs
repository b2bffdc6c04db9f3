use crate::state::CountSnapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Count snapshots fetched once per batch, keyed by window start.
#[derive(Debug, Clone, Default)]
pub struct CountHistory {
    snapshots: BTreeMap<DateTime<Utc>, CountSnapshot>,
}

impl CountHistory {
    pub fn new(snapshots: impl IntoIterator<Item = CountSnapshot>) -> Self {
        Self {
            snapshots: snapshots
                .into_iter()
                .map(|snapshot| (snapshot.timestamp, snapshot))
                .collect(),
        }
    }

    /// Entrances for `facility_id` in the window starting at `at`; zero when unknown.
    pub fn entrants(&self, facility_id: &str, at: DateTime<Utc>) -> u32 {
        self.snapshots
            .get(&at)
            .and_then(|snapshot| snapshot.counts.get(facility_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
