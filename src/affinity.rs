//! # Core affinity
//!
//! Binds the calling thread to a core of the requested [`CoreClass`] before any timing starts.
//! Binding is best-effort: when the host cannot pin the thread (macOS, restricted cpusets) the
//! thread priority is still raised or lowered to bias scheduling toward the class, and the
//! outcome is reported as [`AffinityOutcome::Degraded`] so consumers can treat the run's
//! measurements as lower confidence.
use crate::params::CoreClass;
use crate::topology::CoreTopology;
use log::{info, warn};
use std::fmt;
use thread_priority::{ThreadPriority, set_current_thread_priority};

/// Result of binding a run to a core class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityOutcome {
    /// Pinned to a core known to belong to the requested class
    Pinned { core: usize },
    /// The host has a single core class; pinned to one of its cores
    Homogeneous { core: usize },
    /// Could not pin to the requested class; measurements may be mis-labeled
    Degraded { reason: String },
}

impl AffinityOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, AffinityOutcome::Degraded { .. })
    }

    /// Core the thread is pinned to, if any
    pub fn core(&self) -> Option<usize> {
        match self {
            AffinityOutcome::Pinned { core } | AffinityOutcome::Homogeneous { core } => {
                Some(*core)
            }
            AffinityOutcome::Degraded { .. } => None,
        }
    }
}

impl fmt::Display for AffinityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityOutcome::Pinned { core } => write!(f, "pinned to core {core}"),
            AffinityOutcome::Homogeneous { core } => {
                write!(f, "pinned to core {core} (single core class)")
            }
            AffinityOutcome::Degraded { reason } => write!(f, "degraded: {reason}"),
        }
    }
}

/// Binds the current thread to a core class
#[derive(Debug, Clone)]
pub struct AffinityController {
    topology: Option<CoreTopology>,
}

impl AffinityController {
    /// Controller for the running host
    pub fn new() -> Self {
        AffinityController {
            topology: CoreTopology::detect(),
        }
    }

    /// Controller using a known topology, `None` for a homogeneous host
    pub fn with_topology(topology: Option<CoreTopology>) -> Self {
        AffinityController { topology }
    }

    /// Pin the calling thread to the first usable core of `class`, then bias its priority.
    /// Never fails: an unusable binding is returned as [`AffinityOutcome::Degraded`].
    pub fn bind_current(&self, class: CoreClass) -> AffinityOutcome {
        let outcome = self.pin(class);
        bias_priority(class);

        match &outcome {
            AffinityOutcome::Degraded { reason } => warn!(
                "Couldn't bind to {class}, measurements are lower confidence: {reason} (NOTE: this is expected on macOS)"
            ),
            other => info!("{class}: {other}"),
        }
        outcome
    }

    fn pin(&self, class: CoreClass) -> AffinityOutcome {
        let Some(available) = core_affinity::get_core_ids() else {
            return AffinityOutcome::Degraded {
                reason: "core ids are not available on this platform".to_string(),
            };
        };
        let available = available.into_iter().map(|c| c.id).collect();
        self.pin_with(class, available, |id| {
            core_affinity::set_for_current(core_affinity::CoreId { id })
        })
    }

    /// Try `set_core` on the candidates of `class` among `available`. Without a topology every
    /// core is equivalent, so one refusal means pinning is unsupported and nothing else is tried.
    fn pin_with(
        &self,
        class: CoreClass,
        available: Vec<usize>,
        mut set_core: impl FnMut(usize) -> bool,
    ) -> AffinityOutcome {
        let Some(topology) = &self.topology else {
            return match available.first() {
                Some(&id) if set_core(id) => AffinityOutcome::Homogeneous { core: id },
                Some(_) => AffinityOutcome::Degraded {
                    reason: "thread pinning is not supported on this platform".to_string(),
                },
                None => AffinityOutcome::Degraded {
                    reason: "no cores reported".to_string(),
                },
            };
        };

        let candidates = topology
            .cores(class)
            .iter()
            .copied()
            .filter(|id| available.contains(id));
        for id in candidates {
            if set_core(id) {
                return AffinityOutcome::Pinned { core: id };
            }
            warn!("Couldn't pin to CPU core {id}, trying next");
        }

        AffinityOutcome::Degraded {
            reason: format!("no {class} could be pinned"),
        }
    }
}

impl Default for AffinityController {
    fn default() -> Self {
        Self::new()
    }
}

fn bias_priority(class: CoreClass) {
    let priority = match class {
        CoreClass::Performance => ThreadPriority::Max,
        CoreClass::Efficiency => ThreadPriority::Min,
    };
    if set_current_thread_priority(priority).is_err() {
        warn!("Couldn't set {priority:?} thread priority for {class}");
    }
}
