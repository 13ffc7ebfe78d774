//! # Sweep parameters
//!
//! A sweep is an ordered list of `(size_kb, passes)` entries. Order is the order sizes are
//! measured and reported in, and every size may appear only once. Validation happens when a
//! [`TestParameters`] is constructed, so the orchestrator only ever sees well-formed work lists.
use crate::chase::{SLOT_STRIDE, slot_count};
use crate::error::{Result, SweepError};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Working-set sizes (KiB) of the built-in sweep, from 1 KiB up to 256 MiB
pub const DEFAULT_SIZES_KB: [u64; 36] = [
    1, 2, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 600, 768, 1024, 2048,
    3072, 4096, 6144, 8192, 10240, 12288, 16384, 20480, 24576, 32768, 49152, 65536, 98304,
    131072, 262144,
];

/// Dependent loads performed per size by the built-in sweep
pub const DEFAULT_TARGET_ACCESSES: u64 = 200_000_000;

/// Class of core a run should be executed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoreClass {
    #[default]
    Performance,
    Efficiency,
}

impl fmt::Display for CoreClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreClass::Performance => write!(f, "Performance Core"),
            CoreClass::Efficiency => write!(f, "Efficiency Core"),
        }
    }
}

/// One size of the sweep and the number of full passes over its chase buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SweepEntry {
    pub size_kb: u64,
    pub iterations: u64,
}

impl SweepEntry {
    pub fn new(size_kb: u64, iterations: u64) -> Self {
        SweepEntry {
            size_kb,
            iterations,
        }
    }
}

impl From<(u64, u64)> for SweepEntry {
    fn from((size_kb, iterations): (u64, u64)) -> Self {
        SweepEntry::new(size_kb, iterations)
    }
}

/// Parses `SIZE_KB:PASSES`, e.g. `64:100000`
impl FromStr for SweepEntry {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        let (size, iterations) = s.split_once(':').ok_or_else(|| {
            SweepError::InvalidParameters(format!("expected SIZE_KB:PASSES, got '{s}'"))
        })?;
        let parse = |field: &str, what: &str| {
            field.trim().parse::<u64>().map_err(|e| {
                SweepError::InvalidParameters(format!("bad {what} '{}' in '{s}': {e}", field.trim()))
            })
        };
        Ok(SweepEntry::new(
            parse(size, "size")?,
            parse(iterations, "pass count")?,
        ))
    }
}

/// Validated, ordered work list of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestParameters {
    entries: Vec<SweepEntry>,
}

impl TestParameters {
    /// Validate and wrap `entries`. Rejects an empty list, zero sizes or pass counts, repeated
    /// sizes, and sizes or pass counts whose total access count cannot be represented.
    pub fn new(entries: Vec<SweepEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(SweepError::InvalidParameters(
                "parameter list is empty".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.size_kb == 0 {
                return Err(SweepError::InvalidParameters(
                    "buffer size must be positive".to_string(),
                ));
            }
            if entry.iterations == 0 {
                return Err(SweepError::InvalidParameters(format!(
                    "iteration count for {} KiB must be positive",
                    entry.size_kb
                )));
            }
            let slots = slot_count(entry.size_kb)?;
            if entry.iterations.checked_mul(slots as u64).is_none() {
                return Err(SweepError::InvalidParameters(format!(
                    "{} passes over {} KiB overflow the access counter",
                    entry.iterations, entry.size_kb
                )));
            }
            if !seen.insert(entry.size_kb) {
                return Err(SweepError::InvalidParameters(format!(
                    "duplicate size {} KiB",
                    entry.size_kb
                )));
            }
        }

        Ok(TestParameters { entries })
    }

    /// Built-in ladder of sizes, with pass counts chosen so each size performs about
    /// `target_accesses` dependent loads. Small buffers get many passes, large ones few.
    pub fn default_sweep(target_accesses: u64) -> Self {
        let entries = DEFAULT_SIZES_KB
            .iter()
            .map(|&size_kb| {
                let slots = (size_kb * 1024 / SLOT_STRIDE as u64).max(1);
                SweepEntry::new(size_kb, (target_accesses / slots).max(1))
            })
            .collect();
        TestParameters { entries }
    }

    pub fn entries(&self) -> &[SweepEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SweepEntry> {
        self.entries.iter()
    }
}

impl TryFrom<Vec<(u64, u64)>> for TestParameters {
    type Error = SweepError;

    fn try_from(pairs: Vec<(u64, u64)>) -> Result<Self> {
        TestParameters::new(pairs.into_iter().map(SweepEntry::from).collect())
    }
}

impl Default for TestParameters {
    fn default() -> Self {
        Self::default_sweep(DEFAULT_TARGET_ACCESSES)
    }
}
