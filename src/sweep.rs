//! # Sweep
//!
//! The orchestrator walks a [`TestParameters`] list on a dedicated worker thread. Per run the
//! worker binds itself to the requested [`CoreClass`] once, then for every entry checks the
//! [`CancellationToken`], builds a fresh chase buffer, times it and reports one
//! [`LatencyMeasurement`]. The buffer is dropped before the next size is built, so peak memory
//! follows the largest single size rather than the sum of the sweep.
//!
//! Threading contract: `on_progress` and `on_completion` run on the worker thread. Progress is
//! reported in input order, completion fires exactly once after the last progress call, and a
//! new run can only start once the previous run's completion callback has returned.
use crate::affinity::{AffinityController, AffinityOutcome};
use crate::chase::ChaseBuffer;
use crate::error::{Result, SweepError};
use crate::params::{CoreClass, SweepEntry, TestParameters};
use crate::timing::TimingEngine;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Cooperative stop flag shared between the caller and a running sweep.
///
/// Never reset by the sweep itself; reuse across runs requires [`CancellationToken::reset`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifecycle of a run. `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }
}

/// Average latency measured for one working-set size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyMeasurement {
    pub size_kb: u64,
    pub latency_ns: f64,
}

/// Summary handed to the completion callback
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Number of progress notifications delivered
    pub reported: usize,
    /// Binding outcome, `None` when the run stopped before the first size
    pub affinity: Option<AffinityOutcome>,
    /// Failure that ended the run, set only when `status` is `Failed`
    pub error: Option<SweepError>,
}

impl RunReport {
    /// Measurements of this run should be trusted less
    pub fn is_degraded(&self) -> bool {
        self.affinity.as_ref().is_some_and(AffinityOutcome::is_degraded)
    }
}

/// Notification stream form of the callbacks, see [`LatencySweep::spawn_events`]
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    Measurement(LatencyMeasurement),
    Finished(RunReport),
}

/// Backend that binds the worker and measures single entries
pub trait LatencyProbe: Send + 'static {
    /// Called once per run on the worker thread, before the first entry is measured
    fn prepare(&mut self, core_class: CoreClass) -> AffinityOutcome;

    /// Measure one entry and return the average latency in nanoseconds. Must either produce a
    /// complete result or fail; partial results are not allowed.
    fn measure(&mut self, entry: SweepEntry) -> Result<f64>;
}

/// Pointer-chasing probe: affinity controller, access-pattern builder and timing engine
pub struct ChaseProbe {
    affinity: AffinityController,
    engine: TimingEngine,
    rng: StdRng,
}

impl ChaseProbe {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Probe with a reproducible permutation sequence
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        ChaseProbe {
            affinity: AffinityController::new(),
            engine: TimingEngine::new(),
            rng,
        }
    }
}

impl Default for ChaseProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyProbe for ChaseProbe {
    fn prepare(&mut self, core_class: CoreClass) -> AffinityOutcome {
        let outcome = self.affinity.bind_current(core_class);
        // Calibrate on the bound core; the value is reused for every size of this run
        self.engine.recalibrate();
        outcome
    }

    fn measure(&mut self, entry: SweepEntry) -> Result<f64> {
        let buffer = ChaseBuffer::build_with_rng(entry.size_kb, &mut self.rng)?;
        let timing = self.engine.measure(&buffer, entry.iterations)?;
        debug!(
            "{} KiB: {} accesses in {:?}",
            entry.size_kb, timing.accesses, timing.elapsed
        );
        Ok(timing.latency_ns)
    }
}

#[derive(Debug, Default)]
struct SharedState {
    active: bool,
    status: RunStatus,
    token: Option<CancellationToken>,
    last_error: Option<SweepError>,
    affinity: Option<AffinityOutcome>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the run slot even if the completion callback panics on the worker
struct ActiveRun(Arc<Mutex<SharedState>>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut state = lock(&self.0);
        if state.status == RunStatus::Running {
            state.status = RunStatus::Failed;
        }
        state.active = false;
    }
}

/// Handle to a spawned run
pub struct SweepHandle {
    thread: thread::JoinHandle<RunReport>,
}

impl SweepHandle {
    /// Block until the run is over and its completion callback has returned
    pub fn join(self) -> Result<RunReport> {
        self.thread
            .join()
            .map_err(|payload| SweepError::Panicked(panic_message(&*payload)))
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Test orchestrator. Runs one sweep at a time; clones share the same run slot.
pub struct LatencySweep<P: LatencyProbe = ChaseProbe> {
    probe: Arc<Mutex<P>>,
    shared: Arc<Mutex<SharedState>>,
}

impl<P: LatencyProbe> Clone for LatencySweep<P> {
    fn clone(&self) -> Self {
        LatencySweep {
            probe: Arc::clone(&self.probe),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl LatencySweep<ChaseProbe> {
    pub fn new() -> Self {
        Self::with_probe(ChaseProbe::new())
    }
}

impl Default for LatencySweep<ChaseProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LatencyProbe> LatencySweep<P> {
    pub fn with_probe(probe: P) -> Self {
        LatencySweep {
            probe: Arc::new(Mutex::new(probe)),
            shared: Arc::new(Mutex::new(SharedState::default())),
        }
    }

    /// Start a sweep with a fresh cancellation token.
    ///
    /// Fails synchronously, without any notification, when the parameters are empty, contain a
    /// zero size or pass count or repeat a size (`InvalidParameters`), or when a run is already
    /// active (`StateConflict`).
    pub fn run<E, F, C>(
        &self,
        entries: impl IntoIterator<Item = E>,
        core_class: CoreClass,
        on_progress: F,
        on_completion: C,
    ) -> Result<SweepHandle>
    where
        E: Into<SweepEntry>,
        F: FnMut(LatencyMeasurement) + Send + 'static,
        C: FnOnce(RunReport) + Send + 'static,
    {
        self.run_with_token(
            entries,
            core_class,
            CancellationToken::new(),
            on_progress,
            on_completion,
        )
    }

    /// Start a sweep observing a caller-owned cancellation token
    pub fn run_with_token<E, F, C>(
        &self,
        entries: impl IntoIterator<Item = E>,
        core_class: CoreClass,
        token: CancellationToken,
        mut on_progress: F,
        on_completion: C,
    ) -> Result<SweepHandle>
    where
        E: Into<SweepEntry>,
        F: FnMut(LatencyMeasurement) + Send + 'static,
        C: FnOnce(RunReport) + Send + 'static,
    {
        let entries: Vec<SweepEntry> = entries.into_iter().map(Into::into).collect();

        let mut state = lock(&self.shared);
        if state.active {
            return Err(SweepError::StateConflict);
        }
        let params = match TestParameters::new(entries) {
            Ok(params) => params,
            Err(e) => {
                error!("Rejected sweep: {e}");
                state.status = RunStatus::Failed;
                state.last_error = Some(e.clone());
                return Err(e);
            }
        };
        state.active = true;
        state.status = RunStatus::Running;
        state.token = Some(token.clone());
        state.last_error = None;
        state.affinity = None;
        drop(state);

        let shared = Arc::clone(&self.shared);
        let probe = Arc::clone(&self.probe);
        let spawned = thread::Builder::new()
            .name("latency-sweep".to_string())
            .spawn(move || {
                let _active = ActiveRun(Arc::clone(&shared));
                let mut report = RunReport {
                    status: RunStatus::Running,
                    reported: 0,
                    affinity: None,
                    error: None,
                };
                let outcome = {
                    let mut probe = lock(&probe);
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        execute(
                            &mut *probe,
                            &params,
                            core_class,
                            &token,
                            &shared,
                            &mut on_progress,
                            &mut report,
                        )
                    }))
                };
                if let Err(payload) = outcome {
                    let msg = panic_message(&*payload);
                    error!("Sweep worker panicked: {msg}");
                    report.status = RunStatus::Failed;
                    report.error = Some(SweepError::Panicked(msg));
                }

                {
                    let mut state = lock(&shared);
                    state.status = report.status;
                    state.last_error = report.error.clone();
                }
                info!(
                    "Sweep on {core_class} finished: {:?} after {} of {} sizes",
                    report.status,
                    report.reported,
                    params.len()
                );
                on_completion(report.clone());
                report
            });

        match spawned {
            Ok(thread) => Ok(SweepHandle { thread }),
            Err(e) => {
                let err = SweepError::Spawn(e.to_string());
                let mut state = lock(&self.shared);
                state.active = false;
                state.status = RunStatus::Failed;
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Start a sweep and deliver its notifications over a channel. The channel closes after
    /// [`SweepEvent::Finished`].
    pub fn spawn_events<E>(
        &self,
        entries: impl IntoIterator<Item = E>,
        core_class: CoreClass,
    ) -> Result<(SweepHandle, Receiver<SweepEvent>)>
    where
        E: Into<SweepEntry>,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let progress_tx = tx.clone();
        let handle = self.run(
            entries,
            core_class,
            move |m| {
                // Receiver gone: the caller stopped listening, keep measuring
                let _ = progress_tx.send(SweepEvent::Measurement(m));
            },
            move |report| {
                let _ = tx.send(SweepEvent::Finished(report));
            },
        )?;
        Ok((handle, rx))
    }

    /// Ask the active run to stop before its next size. Idempotent; no-op without an active run.
    pub fn request_stop(&self) {
        let state = lock(&self.shared);
        if !state.active {
            return;
        }
        if let Some(token) = &state.token {
            if !token.is_cancelled() {
                info!("Stop requested");
            }
            token.cancel();
        }
    }

    /// Whether cancellation was requested for the current (or last) run
    pub fn is_cancel_requested(&self) -> bool {
        lock(&self.shared)
            .token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.shared).status
    }

    /// Whether a run holds the slot, including while its completion callback runs
    pub fn is_active(&self) -> bool {
        lock(&self.shared).active
    }

    /// Error that ended the last run, or rejected the last start attempt
    pub fn last_error(&self) -> Option<SweepError> {
        lock(&self.shared).last_error.clone()
    }

    /// Affinity outcome of the current (or last) run
    pub fn affinity(&self) -> Option<AffinityOutcome> {
        lock(&self.shared).affinity.clone()
    }
}

fn measure_entry<P: LatencyProbe>(probe: &mut P, entry: SweepEntry) -> Result<f64> {
    match probe.measure(entry) {
        Err(e) if e.is_transient() => {
            warn!("Retrying {} KiB after transient failure: {e}", entry.size_kb);
            probe.measure(entry)
        }
        other => other,
    }
}

fn execute<P, F>(
    probe: &mut P,
    params: &TestParameters,
    core_class: CoreClass,
    token: &CancellationToken,
    shared: &Mutex<SharedState>,
    on_progress: &mut F,
    report: &mut RunReport,
) where
    P: LatencyProbe,
    F: FnMut(LatencyMeasurement),
{
    info!("Sweep of {} sizes starting on {core_class}", params.len());

    for entry in params.iter() {
        if token.is_cancelled() {
            info!("Sweep cancelled before {} KiB", entry.size_kb);
            report.status = RunStatus::Cancelled;
            return;
        }

        if report.affinity.is_none() {
            let outcome = probe.prepare(core_class);
            lock(shared).affinity = Some(outcome.clone());
            report.affinity = Some(outcome);
        }

        match measure_entry(probe, *entry) {
            Ok(latency_ns) => {
                info!(
                    "Testing ({core_class}): {}KB, Latency: {:.2} ns",
                    entry.size_kb, latency_ns
                );
                on_progress(LatencyMeasurement {
                    size_kb: entry.size_kb,
                    latency_ns,
                });
                report.reported += 1;
            }
            Err(e) => {
                error!("Sweep failed at {} KiB: {e}", entry.size_kb);
                report.status = RunStatus::Failed;
                report.error = Some(e);
                return;
            }
        }
    }

    report.status = RunStatus::Completed;
}
