//! Quarantine records for endpoints that could not be dialed.

use dashmap::DashMap;
use tokio::time::Instant;

use crate::backoff::ExponentialBackoff;
use crate::endpoint::Endpoint;

#[derive(Clone, Copy, Debug)]
struct Quarantine {
    since: Instant,
    retries: u32,
}

/// Tracks which endpoints are currently unavailable and how often recovery
/// has been attempted. An endpoint is quarantined iff it has a record here;
/// `since` is fixed at quarantine time and only `retries` grows, so the
/// probe cadence is measured against the original failure.
pub(crate) struct HealthTracker {
    down: DashMap<Endpoint, Quarantine>,
}

impl HealthTracker {
    pub(crate) fn new() -> Self {
        Self {
            down: DashMap::new(),
        }
    }

    /// Quarantines `endpoint`, overwriting any previous record.
    pub(crate) fn mark_unavailable(&self, endpoint: &Endpoint) {
        self.down.insert(
            endpoint.clone(),
            Quarantine {
                since: Instant::now(),
                retries: 0,
            },
        );
    }

    pub(crate) fn clear(&self, endpoint: &Endpoint) {
        self.down.remove(endpoint);
    }

    pub(crate) fn is_unavailable(&self, endpoint: &Endpoint) -> bool {
        self.down.contains_key(endpoint)
    }

    pub(crate) fn len(&self) -> usize {
        self.down.len()
    }

    /// Endpoints whose backoff window has elapsed and that should be probed
    /// by the recovery sweep.
    pub(crate) fn due_for_probe(&self, backoff: &ExponentialBackoff) -> Vec<Endpoint> {
        let now = Instant::now();
        self.down
            .iter()
            .filter(|entry| {
                now.duration_since(entry.value().since) > backoff.next(entry.value().retries)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Records a failed recovery probe, pushing the next one further out.
    pub(crate) fn record_failed_probe(&self, endpoint: &Endpoint) {
        if let Some(mut record) = self.down.get_mut(endpoint) {
            record.retries += 1;
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Endpoint> {
        self.down.iter().map(|entry| entry.key().clone()).collect()
    }
}
