//! The authoritative set of endpoints the pool is allowed to dial.

use arc_swap::ArcSwap;
use dashmap::DashSet;
use std::sync::Arc;

use crate::endpoint::Endpoint;

/// Holds the endpoint set two ways: an ordered snapshot that round-robin
/// selection reads without locking, and a membership set for O(1) `contains`.
///
/// The snapshot is replaced atomically as a whole; concurrent readers see
/// either the old or the new sequence, never a partial one. Snapshot and
/// membership may briefly disagree during [`Registry::apply`], which is
/// harmless: stale connections are caught at put time.
pub(crate) struct Registry {
    snapshot: ArcSwap<Vec<Endpoint>>,
    members: DashSet<Endpoint>,
}

impl Registry {
    pub(crate) fn new(initial: Vec<Endpoint>) -> Self {
        let members = DashSet::new();
        for endpoint in &initial {
            members.insert(endpoint.clone());
        }
        Self {
            snapshot: ArcSwap::from_pointee(initial),
            members,
        }
    }

    /// The ordered snapshot used for round-robin selection.
    pub(crate) fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.snapshot.load_full()
    }

    pub(crate) fn contains(&self, endpoint: &Endpoint) -> bool {
        self.members.contains(endpoint.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Replaces the snapshot with `all` and applies the `add`/`del` hints to
    /// the membership set. `all` is authoritative for the snapshot.
    pub(crate) fn apply(&self, all: Vec<Endpoint>, add: &[Endpoint], del: &[Endpoint]) {
        self.snapshot.store(Arc::new(all));
        for endpoint in add {
            self.members.insert(endpoint.clone());
        }
        for endpoint in del {
            self.members.remove(endpoint.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(addrs: &[&str]) -> Vec<Endpoint> {
        addrs.iter().map(|a| Endpoint::from(*a)).collect()
    }

    #[test]
    fn tracks_membership_through_updates() {
        let registry = Registry::new(endpoints(&["a:1", "b:1"]));
        assert!(registry.contains(&Endpoint::from("a:1")));
        assert!(registry.contains(&Endpoint::from("b:1")));
        assert_eq!(registry.len(), 2);

        registry.apply(
            endpoints(&["a:1", "c:1"]),
            &endpoints(&["c:1"]),
            &endpoints(&["b:1"]),
        );
        assert!(registry.contains(&Endpoint::from("a:1")));
        assert!(registry.contains(&Endpoint::from("c:1")));
        assert!(!registry.contains(&Endpoint::from("b:1")));
    }

    #[test]
    fn snapshot_is_replaced_wholesale() {
        let registry = Registry::new(endpoints(&["a:1", "b:1"]));
        let before = registry.snapshot();

        registry.apply(endpoints(&["c:1"]), &endpoints(&["c:1"]), &endpoints(&["a:1", "b:1"]));

        // A reader holding the old snapshot still sees it intact.
        assert_eq!(before.as_slice(), endpoints(&["a:1", "b:1"]).as_slice());
        assert_eq!(registry.snapshot().as_slice(), endpoints(&["c:1"]).as_slice());
    }
}
