//! Which metagpu units the kubelet has handed out.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

pub mod pod_resources;

pub use pod_resources::PodResourcesWatcher;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSummary {
    pub total: u32,
    pub allocated: u32,
}

impl AllocationSummary {
    /// Share of unassigned units, 0 when there are no units at all.
    pub fn free_percent(&self) -> u32 {
        api_types::free_percent(self.total, self.allocated)
    }
}

pub type Assignments = BTreeMap<String, Option<PodRef>>;

#[derive(Debug, Default)]
struct TrackerState {
    units: Vec<String>,
    observed: HashMap<String, PodRef>,
    assignments: Arc<Assignments>,
}

impl TrackerState {
    fn rebuild(&mut self) {
        let assignments = self
            .units
            .iter()
            .map(|unit| (unit.clone(), self.observed.get(unit).cloned()))
            .collect();
        self.assignments = Arc::new(assignments);
    }
}

/// Unit id → assigned pod, keyed by the current topology.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    state: RwLock<TrackerState>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-keys the tracker to a new unit set, assignments of vanished units are dropped.
    pub fn set_units(&self, units: impl IntoIterator<Item = String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.units = units.into_iter().collect();
        state.rebuild();
    }

    /// Records what the kubelet currently reports as allocated.
    pub fn set_observed(&self, observed: HashMap<String, PodRef>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.observed == observed {
            return;
        }
        state.observed = observed;
        state.rebuild();
    }

    pub fn assignments(&self) -> Arc<Assignments> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assignments
            .clone()
    }

    pub fn summary(&self) -> AllocationSummary {
        let assignments = self.assignments();
        AllocationSummary {
            total: assignments.len() as u32,
            allocated: assignments.values().filter(|pod| pod.is_some()).count() as u32,
        }
    }
}
