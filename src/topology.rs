//! Discovery of performance and efficiency cores on heterogeneous hosts.
//!
//! Sources, in order:
//! - hybrid x86 (`/sys/devices/cpu_core/cpus`, `/sys/devices/cpu_atom/cpus`)
//! - per-CPU capacity on big.LITTLE (`/sys/devices/system/cpu/cpuN/cpu_capacity`)
//!
//! When neither tells the classes apart the host is treated as homogeneous.
use crate::params::CoreClass;
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default sysfs device root
pub const SYSFS_DEVICES: &str = "/sys/devices";

/// Parse a kernel cpulist such as `0-3,8,10-11`
pub fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let list = list.trim();
    if list.is_empty() {
        return Some(Vec::new());
    }

    let mut cpus = Vec::new();
    for part in list.split(',') {
        match part.trim().split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

/// Core ids split by class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTopology {
    performance: Vec<usize>,
    efficiency: Vec<usize>,
}

impl CoreTopology {
    /// Detect the topology of the running host, `None` if it is homogeneous or unknown
    pub fn detect() -> Option<Self> {
        Self::detect_in(Path::new(SYSFS_DEVICES))
    }

    /// Detect the topology from a sysfs device tree rooted at `devices`
    pub fn detect_in(devices: &Path) -> Option<Self> {
        let topology = Self::from_hybrid_pmu(devices).or_else(|| Self::from_capacity(devices));
        match &topology {
            Some(t) => debug!(
                "Detected heterogeneous cores: performance {:?}, efficiency {:?}",
                t.performance, t.efficiency
            ),
            None => debug!("No core classes found under {}", devices.display()),
        }
        topology
    }

    fn from_hybrid_pmu(devices: &Path) -> Option<Self> {
        let read = |pmu: &str| {
            fs::read_to_string(devices.join(pmu).join("cpus"))
                .ok()
                .and_then(|s| parse_cpu_list(&s))
        };
        let performance = read("cpu_core")?;
        let efficiency = read("cpu_atom")?;
        if performance.is_empty() || efficiency.is_empty() {
            return None;
        }
        Some(CoreTopology {
            performance,
            efficiency,
        })
    }

    fn from_capacity(devices: &Path) -> Option<Self> {
        let cpu_root = devices.join("system").join("cpu");
        let mut capacities = BTreeMap::new();
        for entry in fs::read_dir(&cpu_root).ok()?.flatten() {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if let Some(capacity) = fs::read_to_string(entry.path().join("cpu_capacity"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
            {
                capacities.insert(id, capacity);
            }
        }
        Self::from_capacities(&capacities)
    }

    /// Split cores by capacity: the highest capacity is the performance class, everything
    /// below it the efficiency class. Equal capacities mean a homogeneous host.
    pub fn from_capacities(capacities: &BTreeMap<usize, u64>) -> Option<Self> {
        let max = *capacities.values().max()?;
        let (performance, efficiency): (Vec<_>, Vec<_>) =
            capacities.iter().partition(|(_, cap)| **cap == max);
        if efficiency.is_empty() {
            return None;
        }
        Some(CoreTopology {
            performance: performance.into_iter().map(|(id, _)| *id).collect(),
            efficiency: efficiency.into_iter().map(|(id, _)| *id).collect(),
        })
    }

    pub fn cores(&self, class: CoreClass) -> &[usize] {
        match class {
            CoreClass::Performance => &self.performance,
            CoreClass::Efficiency => &self.efficiency,
        }
    }
}
