//! Per-endpoint accounting of connections the pool has created.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::endpoint::Endpoint;

/// Counts the connections created to each endpoint and not yet declared
/// closed. Because evicted connections are closed after a delay, counts may
/// transiently exceed the number of live connections; the rebalancer damps
/// against that (see [`crate::pool`]).
pub(crate) struct Inventory {
    counts: DashMap<Endpoint, usize>,
}

impl Inventory {
    pub(crate) fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    pub(crate) fn inc(&self, endpoint: &Endpoint) {
        self.counts
            .entry(endpoint.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    /// Decrements the count for `endpoint`. A decrement on a missing entry
    /// is a no-op; the entry is removed when the count reaches zero so that
    /// iteration never sees idle zeros.
    pub(crate) fn dec(&self, endpoint: &Endpoint) {
        if let Entry::Occupied(mut occupied) = self.counts.entry(endpoint.clone()) {
            if *occupied.get() > 1 {
                *occupied.get_mut() -= 1;
            } else {
                occupied.remove();
            }
        }
    }

    pub(crate) fn count(&self, endpoint: &Endpoint) -> usize {
        self.counts.get(endpoint).map(|count| *count).unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Endpoint, usize)> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
