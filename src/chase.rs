//! Cache and memory latency access pattern
//!
//! A [`ChaseBuffer`] holds, in every slot, the index of the next slot to visit. The links form a
//! single random cycle through all slots (Sattolo's shuffle), so a traversal starting anywhere
//! touches every slot exactly once per pass and each load depends on the previous one. This
//! defeats spatial and stride prefetchers, and a pass is too long to be predicted.
use crate::error::{Result, SweepError};
use crate::format_size;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bytes occupied by one slot (one successor index)
pub const SLOT_STRIDE: usize = std::mem::size_of::<usize>();

/// Shortest cycle that still has no fixed point
const MIN_SLOTS: usize = 2;

/// Number of slots a buffer of `size_kb` KiB holds
pub fn slot_count(size_kb: u64) -> Result<usize> {
    if size_kb == 0 {
        return Err(SweepError::InvalidParameters(
            "buffer size must be positive".to_string(),
        ));
    }
    let bytes = size_kb.checked_mul(1024).ok_or_else(|| {
        SweepError::InvalidParameters(format!("{size_kb} KiB does not fit in memory"))
    })?;
    let slots = usize::try_from(bytes / SLOT_STRIDE as u64).map_err(|_| {
        SweepError::InvalidParameters(format!("{size_kb} KiB exceeds the address space"))
    })?;
    if slots < MIN_SLOTS {
        return Err(SweepError::InvalidParameters(format!(
            "{size_kb} KiB holds fewer than {MIN_SLOTS} slots"
        )));
    }
    Ok(slots)
}

/// Randomized single-cycle successor table
pub struct ChaseBuffer {
    slots: Box<[usize]>,
    size_kb: u64,
}

impl ChaseBuffer {
    /// Build a buffer for `size_kb` KiB seeded from OS entropy
    pub fn build(size_kb: u64) -> Result<Self> {
        Self::build_with_rng(size_kb, &mut StdRng::from_entropy())
    }

    /// Build a buffer for `size_kb` KiB using `rng` for the permutation
    pub fn build_with_rng<R: Rng + ?Sized>(size_kb: u64, rng: &mut R) -> Result<Self> {
        let n = slot_count(size_kb)?;

        let mut slots: Vec<usize> = Vec::new();
        slots
            .try_reserve_exact(n)
            .map_err(|_| SweepError::AllocationFailure { size_kb })?;
        slots.extend(0..n);

        // Sattolo: swap each position with a strictly earlier one, never itself. The identity
        // table becomes a permutation with exactly one cycle of length n, read as i -> slots[i].
        for i in (1..n).rev() {
            let j = rng.gen_range(0..i);
            slots.swap(i, j);
        }

        debug!(
            "Built chase buffer of {} ({} slots)",
            format_size((n * SLOT_STRIDE) as f32),
            n
        );

        Ok(ChaseBuffer {
            slots: slots.into_boxed_slice(),
            size_kb,
        })
    }

    /// Number of slots, i.e. the cycle length
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn size_kb(&self) -> u64 {
        self.size_kb
    }

    pub fn successor(&self, slot: usize) -> usize {
        self.slots[slot]
    }

    /// Raw successor table. Every value is a valid index into the table.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Follow links from slot 0 and check the walk returns to 0 after exactly `len()` steps
    /// without revisiting any slot.
    pub fn is_single_cycle(&self) -> bool {
        let n = self.slots.len();
        let mut visited = vec![false; n];
        let mut idx = 0;
        for _ in 0..n {
            if visited[idx] {
                return false;
            }
            visited[idx] = true;
            idx = self.slots[idx];
        }
        idx == 0
    }
}
