//! CPU topology detection and loop-thread placement.
//!
//! # Placement Strategy
//!
//! Loop threads spend most of their time ticking sessions and sleeping until
//! the next cadence deadline, so pinning mainly buys cache locality for the
//! sessions a loop owns.
//!
//! - One loop per **physical** core when the group fits: no two loops share
//!   L1/L2 through SMT siblings.
//! - One loop per **logical** core when only SMT siblings make it fit.
//! - Otherwise leave placement to the OS.
//!
//! # Detection
//!
//! Uses `num_cpus` for physical/logical counts and `core_affinity` for core
//! ids and pinning. On most systems core ids `0..N` map to separate physical
//! cores before SMT siblings are enumerated.

use core_affinity::CoreId;

use crate::config::CpuConfig;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            available_cores,
        }
    }

    #[must_use]
    pub fn has_smt(&self) -> bool {
        self.logical_cores > self.physical_cores
    }

    /// Chooses cores for `loops` loop threads.
    #[must_use]
    pub fn select_placement(&self, loops: usize) -> LoopPlacement {
        let usable = self.available_cores.len();

        let strategy = if loops <= self.physical_cores.min(usable) {
            PlacementStrategy::OnePerPhysical
        } else if loops <= self.logical_cores.min(usable) {
            PlacementStrategy::OnePerLogical
        } else {
            PlacementStrategy::NoPin
        };

        let cores = match strategy {
            PlacementStrategy::OnePerPhysical | PlacementStrategy::OnePerLogical => self
                .available_cores
                .iter()
                .take(loops)
                .copied()
                .map(Some)
                .collect(),
            PlacementStrategy::NoPin | PlacementStrategy::Manual => vec![None; loops],
        };

        LoopPlacement { cores, strategy }
    }
}

/// Core assignment per loop index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPlacement {
    /// `cores[i]` is the core for loop `i` (`None` = unpinned).
    pub cores: Vec<Option<usize>>,
    pub strategy: PlacementStrategy,
}

impl LoopPlacement {
    #[must_use]
    pub fn unpinned(loops: usize) -> Self {
        Self {
            cores: vec![None; loops],
            strategy: PlacementStrategy::NoPin,
        }
    }

    /// Loop `i` goes to `cores[i % cores.len()]`.
    #[must_use]
    pub fn manual(cores: &[usize], loops: usize) -> Self {
        let cores = if cores.is_empty() {
            vec![None; loops]
        } else {
            (0..loops).map(|i| Some(cores[i % cores.len()])).collect()
        };
        Self {
            cores,
            strategy: PlacementStrategy::Manual,
        }
    }

    /// Core for loop `index`, if pinned.
    #[must_use]
    pub fn core_for(&self, index: usize) -> Option<usize> {
        self.cores.get(index).copied().flatten()
    }
}

/// Strategy used for loop placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Every loop on its own physical core.
    OnePerPhysical,
    /// Every loop on its own logical core; some share a physical core.
    OnePerLogical,
    /// More loops than cores; no pinning.
    NoPin,
    /// Assignment given by configuration.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnePerPhysical => write!(f, "one-per-physical"),
            Self::OnePerLogical => write!(f, "one-per-logical"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Resolves a [`CpuConfig`] to a placement for `loops` threads.
#[must_use]
pub fn resolve(config: &CpuConfig, loops: usize) -> LoopPlacement {
    match config {
        CpuConfig::Auto => CpuTopology::detect().select_placement(loops),
        CpuConfig::Unpinned => LoopPlacement::unpinned(loops),
        CpuConfig::Manual(cores) => LoopPlacement::manual(cores, loops),
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}
