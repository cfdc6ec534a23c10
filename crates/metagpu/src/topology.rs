use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::telemetry::PhysicalDevice;

/// Fractional allocation slice of one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaGpuUnit {
    pub id: String,
    pub parent_device_id: String,
}

/// Carves every healthy device into `fraction` units.
///
/// Devices are ordered by id and units by ascending index, so identical
/// inputs always produce the identical sequence.
pub fn derive(devices: &[PhysicalDevice], fraction: u32) -> Vec<MetaGpuUnit> {
    let mut healthy: Vec<&PhysicalDevice> = devices.iter().filter(|d| d.healthy).collect();
    healthy.sort_by(|a, b| a.id.cmp(&b.id));
    healthy.dedup_by(|a, b| a.id == b.id);

    healthy
        .into_iter()
        .flat_map(|device| {
            (0..fraction).map(move |index| MetaGpuUnit {
                id: format!("{}-{index}", device.id),
                parent_device_id: device.id.clone(),
            })
        })
        .collect()
}

/// One generation of the metagpu topology.
#[derive(Debug, Default)]
pub struct Topology {
    generation: u64,
    fraction: u32,
    units: Vec<MetaGpuUnit>,
    by_id: HashMap<String, usize>,
}

impl Topology {
    fn new(generation: u64, fraction: u32, units: Vec<MetaGpuUnit>) -> Self {
        let by_id = units
            .iter()
            .enumerate()
            .map(|(index, unit)| (unit.id.clone(), index))
            .collect();
        Self {
            generation,
            fraction,
            units,
            by_id,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    pub fn units(&self) -> &[MetaGpuUnit] {
        &self.units
    }

    pub fn unit_ids(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, id: &str) -> Option<&MetaGpuUnit> {
        self.by_id.get(id).map(|index| &self.units[*index])
    }
}

/// Single owner of the current topology; replacements swap the whole generation.
#[derive(Debug, Default)]
pub struct TopologyStore {
    current: RwLock<Arc<Topology>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Arc<Topology> {
        self.current.read().await.clone()
    }

    /// Installs a new generation unless `units` equals the current set.
    pub async fn replace(&self, fraction: u32, units: Vec<MetaGpuUnit>) -> Option<Arc<Topology>> {
        let mut current = self.current.write().await;
        if current.generation > 0 && current.units == units {
            return None;
        }
        let next = Arc::new(Topology::new(current.generation + 1, fraction, units));
        *current = next.clone();
        Some(next)
    }
}
