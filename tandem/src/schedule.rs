//! Per-simulator step queue and wake signals.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_types::TieredTime;
use tokio::sync::Notify;

/// The queue of pending step times for one simulator, together with
/// the signals other tasks use to wake it.
///
/// Steps are deduplicated; times that have fallen behind the
/// simulator's progress collapse onto it when taken. The three signals
/// are: *step queued* (wakes an idle task), *earlier step* (makes a
/// task re-evaluate which step it is waiting to run), and *release*
/// (deadlock resolution: proceed even though dependencies look
/// unsatisfied).
#[derive(Debug, Default)]
pub struct StepSchedule {
    times: Mutex<BTreeSet<TieredTime>>,
    step_queued: Notify,
    earlier_step: Notify,
    release: Notify,
    released: AtomicBool,
}

impl StepSchedule {
    /// An empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step and wake the owner if it is idle.
    pub fn push(&self, time: TieredTime) {
        self.times.lock().expect("schedule poisoned").insert(time);
        self.step_queued.notify_one();
    }

    /// The next step candidate at or after `progress`, without
    /// consuming it. Stale entries collapse onto `progress`.
    pub fn next_after(&self, progress: &TieredTime) -> Option<TieredTime> {
        let times = self.times.lock().expect("schedule poisoned");
        times
            .iter()
            .next()
            .map(|first| first.clone().max(progress.clone()))
    }

    /// Drop every queued entry at or before `time` — called once the
    /// step at `time` ran and subsumed them.
    pub fn consume_through(&self, time: &TieredTime) {
        let mut times = self.times.lock().expect("schedule poisoned");
        while let Some(first) = times.first() {
            if first <= time {
                times.pop_first();
            } else {
                break;
            }
        }
    }

    /// True when no step is queued.
    pub fn is_empty(&self) -> bool {
        self.times.lock().expect("schedule poisoned").is_empty()
    }

    /// Wait until a step is queued (or the signal is fired for any
    /// other reason; callers re-check their state after waking).
    pub async fn step_queued(&self) {
        self.step_queued.notified().await;
    }

    /// Wake the owner so it re-checks its schedule and termination
    /// condition.
    pub fn wake(&self) {
        self.step_queued.notify_one();
    }

    /// Signal that an earlier step than the one being waited on
    /// arrived.
    pub async fn earlier_step(&self) {
        self.earlier_step.notified().await;
    }

    /// Fire the earlier-step signal.
    pub fn interrupt(&self) {
        self.earlier_step.notify_one();
    }

    /// Arm the release signal: the owner proceeds with its current
    /// step despite unsatisfied dependencies.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_one();
    }

    /// Disarm a stale release before waiting on dependencies.
    pub fn clear_release(&self) {
        self.released.store(false, Ordering::SeqCst);
    }

    /// Wait for a release; returns only when one was armed after the
    /// last [`clear_release`](Self::clear_release).
    pub async fn released(&self) {
        loop {
            if self.released.swap(false, Ordering::SeqCst) {
                return;
            }
            self.release.notified().await;
        }
    }
}
