//! Orchestration behavior of `LatencySweep`, driven by a scripted probe so ordering,
//! cancellation and failure paths are deterministic.

use mem_latency_rs::{
    AffinityOutcome, CancellationToken, CoreClass, LatencyMeasurement, LatencyProbe,
    LatencySweep, RunReport, RunStatus, SweepEntry, SweepError, SweepEvent,
};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Records every call and answers `measure` from a script (default: size as latency)
#[derive(Default)]
struct ScriptedProbe {
    calls: Arc<Mutex<Vec<String>>>,
    script: VecDeque<Result<f64, SweepError>>,
    outcome: Option<AffinityOutcome>,
}

impl ScriptedProbe {
    fn with_script(script: Vec<Result<f64, SweepError>>) -> Self {
        ScriptedProbe {
            script: script.into(),
            ..Default::default()
        }
    }
}

impl LatencyProbe for ScriptedProbe {
    fn prepare(&mut self, core_class: CoreClass) -> AffinityOutcome {
        self.calls.lock().unwrap().push(format!("prepare {core_class}"));
        self.outcome
            .clone()
            .unwrap_or(AffinityOutcome::Pinned { core: 0 })
    }

    fn measure(&mut self, entry: SweepEntry) -> Result<f64, SweepError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("measure {}", entry.size_kb));
        self.script
            .pop_front()
            .unwrap_or(Ok(entry.size_kb as f64 / 100.0))
    }
}

#[derive(Debug, PartialEq)]
enum Note {
    Progress(LatencyMeasurement),
    Done(RunReport),
}

/// Run to completion and collect the notifications in delivery order
fn run_collect<P: LatencyProbe>(
    sweep: &LatencySweep<P>,
    entries: Vec<(u64, u64)>,
    token: CancellationToken,
    stop_after_first: bool,
) -> (Vec<Note>, RunReport) {
    let (tx, rx) = mpsc::channel();
    let progress_tx = tx.clone();
    let progress_token = token.clone();
    let handle = sweep
        .run_with_token(
            entries,
            CoreClass::Performance,
            token,
            move |m| {
                progress_tx.send(Note::Progress(m)).unwrap();
                if stop_after_first {
                    progress_token.cancel();
                }
            },
            move |report| tx.send(Note::Done(report)).unwrap(),
        )
        .unwrap();
    let report = handle.join().unwrap();
    (rx.iter().collect(), report)
}

fn progress_sizes(notes: &[Note]) -> Vec<u64> {
    notes
        .iter()
        .filter_map(|n| match n {
            Note::Progress(m) => Some(m.size_kb),
            Note::Done(_) => None,
        })
        .collect()
}

#[test]
fn completed_sweep_reports_sizes_in_input_order() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (notes, report) = run_collect(
        &sweep,
        vec![(64, 100_000), (256, 50_000), (4096, 10_000)],
        CancellationToken::new(),
        false,
    );

    assert_eq!(progress_sizes(&notes), vec![64, 256, 4096]);
    assert_eq!(notes.len(), 4);
    for note in &notes[..3] {
        let Note::Progress(m) = note else {
            panic!("completion before progress");
        };
        assert!(m.latency_ns >= 0.0);
    }
    assert_eq!(notes.last(), Some(&Note::Done(report.clone())));
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.reported, 3);
    assert_eq!(report.error, None);
    assert_eq!(sweep.status(), RunStatus::Completed);
    assert_eq!(sweep.last_error(), None);
}

#[test]
fn affinity_is_bound_once_before_the_first_size() {
    let probe = ScriptedProbe::default();
    let calls = Arc::clone(&probe.calls);
    let sweep = LatencySweep::with_probe(probe);
    run_collect(
        &sweep,
        vec![(4, 1), (8, 1), (16, 1)],
        CancellationToken::new(),
        false,
    );

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "prepare Performance Core",
            "measure 4",
            "measure 8",
            "measure 16"
        ]
    );
    assert_eq!(sweep.affinity(), Some(AffinityOutcome::Pinned { core: 0 }));
}

#[test]
fn empty_parameters_fail_synchronously_without_notifications() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (tx, rx) = mpsc::channel::<&str>();
    let progress_tx = tx.clone();
    let result = sweep.run(
        Vec::<(u64, u64)>::new(),
        CoreClass::Performance,
        move |_| progress_tx.send("progress").unwrap(),
        move |_| tx.send("done").unwrap(),
    );

    assert!(matches!(result, Err(SweepError::InvalidParameters(_))));
    assert!(rx.recv().is_err());
    assert_eq!(sweep.status(), RunStatus::Failed);
    assert!(matches!(
        sweep.last_error(),
        Some(SweepError::InvalidParameters(_))
    ));
}

#[test]
fn malformed_entries_are_rejected() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    for entries in [
        vec![(64u64, 1000u64), (64, 2000)],
        vec![(0, 10)],
        vec![(64, 0)],
        vec![(4, 1), (64, u64::MAX)],
    ] {
        let result = sweep.run(entries, CoreClass::Efficiency, |_| {}, |_| {});
        assert!(matches!(result, Err(SweepError::InvalidParameters(_))));
    }
    assert!(!sweep.is_active());
}

#[test]
fn cancelled_before_start_reports_nothing() {
    let probe = ScriptedProbe::default();
    let calls = Arc::clone(&probe.calls);
    let sweep = LatencySweep::with_probe(probe);
    let token = CancellationToken::new();
    token.cancel();

    let (notes, report) = run_collect(&sweep, vec![(64, 1), (128, 1)], token, false);

    assert_eq!(notes, vec![Note::Done(report.clone())]);
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.reported, 0);
    assert_eq!(report.affinity, None);
    assert!(calls.lock().unwrap().is_empty());
    assert!(sweep.is_cancel_requested());
    assert_eq!(sweep.status(), RunStatus::Cancelled);
}

#[test]
fn cancel_between_sizes_stops_after_first() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (notes, report) = run_collect(
        &sweep,
        vec![(64, 1), (128, 1), (256, 1)],
        CancellationToken::new(),
        true,
    );

    assert_eq!(progress_sizes(&notes), vec![64]);
    assert_eq!(notes.len(), 2);
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.reported, 1);
}

#[test]
fn measurement_failure_fails_the_run() {
    let probe = ScriptedProbe::with_script(vec![
        Ok(1.0),
        Err(SweepError::AllocationFailure { size_kb: 128 }),
    ]);
    let calls = Arc::clone(&probe.calls);
    let sweep = LatencySweep::with_probe(probe);
    let (notes, report) = run_collect(
        &sweep,
        vec![(64, 1), (128, 1), (256, 1)],
        CancellationToken::new(),
        false,
    );

    assert_eq!(progress_sizes(&notes), vec![64]);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.error,
        Some(SweepError::AllocationFailure { size_kb: 128 })
    );
    assert_eq!(
        sweep.last_error(),
        Some(SweepError::AllocationFailure { size_kb: 128 })
    );
    // Allocation failures are not retried
    assert_eq!(calls.lock().unwrap().len(), 3);
}

#[test]
fn transient_failure_is_retried_once() {
    let probe = ScriptedProbe::with_script(vec![
        Err(SweepError::TimerFailure { size_kb: 64 }),
        Ok(3.5),
        Err(SweepError::TimerFailure { size_kb: 128 }),
        Err(SweepError::TimerFailure { size_kb: 128 }),
    ]);
    let sweep = LatencySweep::with_probe(probe);
    let (notes, report) = run_collect(
        &sweep,
        vec![(64, 1), (128, 1)],
        CancellationToken::new(),
        false,
    );

    assert_eq!(
        notes[0],
        Note::Progress(LatencyMeasurement {
            size_kb: 64,
            latency_ns: 3.5
        })
    );
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error, Some(SweepError::TimerFailure { size_kb: 128 }));
}

#[test]
fn degraded_affinity_is_visible_in_report() {
    let probe = ScriptedProbe {
        outcome: Some(AffinityOutcome::Degraded {
            reason: "no efficiency cores".into(),
        }),
        ..Default::default()
    };
    let sweep = LatencySweep::with_probe(probe);
    let (_, report) = run_collect(&sweep, vec![(4, 1)], CancellationToken::new(), false);

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_degraded());
    assert!(sweep.affinity().is_some_and(|a| a.is_degraded()));
}

#[test]
fn second_run_while_active_is_a_conflict() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    let handle = sweep
        .run(
            vec![(4u64, 1u64)],
            CoreClass::Performance,
            move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            },
            |_| {},
        )
        .unwrap();

    started_rx.recv().unwrap();
    assert!(sweep.is_active());
    assert_eq!(sweep.status(), RunStatus::Running);
    assert!(matches!(
        sweep.run(vec![(8u64, 1u64)], CoreClass::Performance, |_| {}, |_| {}),
        Err(SweepError::StateConflict)
    ));

    release_tx.send(()).unwrap();
    assert_eq!(handle.join().unwrap().status, RunStatus::Completed);

    // The slot is free again once the first run is over
    let again = sweep
        .run(vec![(8u64, 1u64)], CoreClass::Performance, |_| {}, |_| {})
        .unwrap();
    assert_eq!(again.join().unwrap().status, RunStatus::Completed);
}

#[test]
fn request_stop_is_idempotent_and_ignored_when_idle() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    sweep.request_stop();
    assert!(!sweep.is_cancel_requested());

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let handle = sweep
        .run(
            vec![(4u64, 1u64), (8, 1), (16, 1)],
            CoreClass::Efficiency,
            move |_| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            },
            |_| {},
        )
        .unwrap();

    started_rx.recv().unwrap();
    sweep.request_stop();
    sweep.request_stop();
    sweep.request_stop();
    assert!(sweep.is_cancel_requested());
    release_tx.send(()).unwrap();

    let report = handle.join().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.reported, 1);
}

#[test]
fn event_stream_ends_with_finished() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (handle, events) = sweep
        .spawn_events(
            [SweepEntry::new(32, 1), SweepEntry::new(16, 1)],
            CoreClass::Performance,
        )
        .unwrap();

    let events: Vec<SweepEvent> = events.iter().collect();
    let report = handle.join().unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SweepEvent::Measurement(m) if m.size_kb == 32));
    assert!(matches!(events[1], SweepEvent::Measurement(m) if m.size_kb == 16));
    assert_eq!(events[2], SweepEvent::Finished(report));
}

#[test]
fn panicking_progress_callback_still_completes_once() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let (tx, rx) = mpsc::channel();
    let handle = sweep
        .run(
            vec![(4u64, 1u64), (8, 1), (16, 1)],
            CoreClass::Performance,
            |m| {
                if m.size_kb == 8 {
                    panic!("display went away");
                }
            },
            move |report| tx.send(report).unwrap(),
        )
        .unwrap();

    let report = handle.join().unwrap();
    assert_eq!(rx.recv().unwrap(), report);
    assert!(rx.try_recv().is_err());
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.reported, 1);
    assert!(
        matches!(&report.error, Some(SweepError::Panicked(msg)) if msg.contains("display went away"))
    );
    assert_eq!(sweep.status(), RunStatus::Failed);
    assert!(!sweep.is_active());

    // The probe lock survives the panic
    let again = sweep
        .run(vec![(4u64, 1u64)], CoreClass::Performance, |_| {}, |_| {})
        .unwrap();
    assert_eq!(again.join().unwrap().status, RunStatus::Completed);
}

#[test]
fn stop_from_another_thread_through_a_clone() {
    let sweep = LatencySweep::with_probe(ScriptedProbe::default());
    let stopper = sweep.clone();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let handle = sweep
        .run(
            vec![(4u64, 1u64), (8, 1)],
            CoreClass::Performance,
            move |_| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            },
            |_| {},
        )
        .unwrap();

    started_rx.recv().unwrap();
    std::thread::spawn(move || stopper.request_stop())
        .join()
        .unwrap();
    release_tx.send(()).unwrap();

    let report = handle.join().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.reported, 1);
}
