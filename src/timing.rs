//! Latency measurement via pointer chasing
//!
//! Each load's address is the value returned by the previous load, so the CPU cannot overlap or
//! prefetch them and the elapsed time divided by the number of loads approximates the latency of
//! the level of the memory hierarchy the buffer fits in.
use crate::chase::ChaseBuffer;
use crate::error::{Result, SweepError};
use log::debug;
use std::hint::black_box;
use std::time::{Duration, Instant};

/// Steps timed by the overhead calibration loop
const CALIBRATION_STEPS: u64 = 1 << 22;

/// Calibration repeats; the fastest one is kept
const CALIBRATION_ROUNDS: usize = 5;

/// Follow `steps` links starting at `start`, returning the slot reached.
#[inline(never)]
fn chase(slots: &[usize], start: usize, steps: u64) -> usize {
    let mut idx = start;
    let mut remaining = steps;

    // SAFETY: every slot of a ChaseBuffer holds an index < slots.len(), and `start` is 0 or a
    // value read from the table.
    unsafe {
        // Unroll 8x to reduce loop overhead relative to memory latency
        while remaining >= 8 {
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            idx = *slots.get_unchecked(idx);
            remaining -= 8;
        }
        while remaining > 0 {
            idx = *slots.get_unchecked(idx);
            remaining -= 1;
        }
    }

    idx
}

/// Same loop shape as [`chase`] with the load replaced by an opaque register move
#[inline(never)]
fn idle_chase(start: usize, steps: u64) -> usize {
    let mut idx = start;
    let mut remaining = steps;
    while remaining >= 8 {
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        idx = black_box(idx);
        remaining -= 8;
    }
    while remaining > 0 {
        idx = black_box(idx);
        remaining -= 1;
    }
    idx
}

fn elapsed_between(start: Instant, end: Instant, size_kb: u64) -> Result<Duration> {
    end.checked_duration_since(start)
        .ok_or(SweepError::TimerFailure { size_kb })
}

/// Result of timing one chase buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Average latency of one dependent load, overhead removed
    pub latency_ns: f64,
    /// Raw wall time of the timed traversal
    pub elapsed: Duration,
    /// Number of dependent loads timed
    pub accesses: u64,
}

/// Times traversals of chase buffers. Loop and clock overhead is calibrated once and cached until
/// [`TimingEngine::recalibrate`].
#[derive(Debug, Default)]
pub struct TimingEngine {
    overhead_per_access_ns: Option<f64>,
    clock_read_ns: f64,
}

impl TimingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calibrated per-access overhead, if [`TimingEngine::calibrate`] already ran
    pub fn overhead_per_access_ns(&self) -> Option<f64> {
        self.overhead_per_access_ns
    }

    /// Engine whose calibration is already cached, skipping the measurement
    #[cfg(test)]
    pub(crate) fn precalibrated(overhead_per_access_ns: f64) -> Self {
        TimingEngine {
            overhead_per_access_ns: Some(overhead_per_access_ns),
            clock_read_ns: 0.0,
        }
    }

    /// Drop the cached calibration and measure again on the current core
    pub fn recalibrate(&mut self) -> f64 {
        self.overhead_per_access_ns = None;
        self.calibrate()
    }

    /// Measure the cost of the clock reads and of the traversal loop without loads. Runs only
    /// once, later calls return the cached value.
    pub fn calibrate(&mut self) -> f64 {
        if let Some(overhead) = self.overhead_per_access_ns {
            return overhead;
        }

        let mut clock_best = f64::MAX;
        let mut loop_best = f64::MAX;
        for _ in 0..CALIBRATION_ROUNDS {
            let start = Instant::now();
            let end = Instant::now();
            let clock_ns = end.saturating_duration_since(start).as_nanos() as f64;
            clock_best = clock_best.min(clock_ns);

            let start = Instant::now();
            black_box(idle_chase(black_box(0), CALIBRATION_STEPS));
            let loop_ns = start.elapsed().as_nanos() as f64;
            loop_best = loop_best.min(loop_ns);
        }

        let overhead = ((loop_best - clock_best).max(0.0)) / CALIBRATION_STEPS as f64;
        debug!(
            "Calibrated timing overhead: clock read {:.1} ns, loop {:.4} ns/access",
            clock_best, overhead
        );
        self.clock_read_ns = clock_best;
        self.overhead_per_access_ns = Some(overhead);
        overhead
    }

    /// Run one untimed warm-up pass, then `passes` full passes over `buffer` starting from
    /// slot 0, and derive the per-access latency.
    pub fn measure(&mut self, buffer: &ChaseBuffer, passes: u64) -> Result<Timing> {
        let size_kb = buffer.size_kb();
        if passes == 0 {
            return Err(SweepError::InvalidParameters(format!(
                "iteration count for {size_kb} KiB must be positive"
            )));
        }
        let accesses = passes
            .checked_mul(buffer.len() as u64)
            .ok_or_else(|| {
                SweepError::InvalidParameters(format!(
                    "{passes} passes over {size_kb} KiB overflow the access counter"
                ))
            })?;

        let overhead_per_access = self.calibrate();
        let slots = buffer.slots();

        // Warmup: traverse once to populate the TLB and fault pages in
        let warm = chase(slots, 0, slots.len() as u64);
        debug_assert_eq!(warm, 0);

        let start = Instant::now();
        let end_idx = chase(slots, black_box(warm), accesses);
        let end = Instant::now();

        // Prevent dead code elimination
        black_box(end_idx);
        debug_assert_eq!(end_idx, 0);

        let elapsed = elapsed_between(start, end, size_kb)?;
        let overhead_ns = self.clock_read_ns + overhead_per_access * accesses as f64;
        let latency_ns = ((elapsed.as_nanos() as f64 - overhead_ns) / accesses as f64).max(0.0);

        Ok(Timing {
            latency_ns,
            elapsed,
            accesses,
        })
    }
}
