//! Per-simulator runtime state.

use crate::buffers::{PersistentInputBuffer, TimedInputBuffer};
use crate::cache::OutputCache;
use crate::progress::Progress;
use crate::schedule::StepSchedule;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tandem_proxy::Proxy;
use tandem_types::{EntityId, InputData, OutputRequest, SimId, SimulatorKind, TieredTime};

/// Where a simulator's task currently is, as seen by the deadlock
/// detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskPhase {
    /// Not yet started.
    Starting,
    /// Idle, waiting for a step to be queued.
    WaitStep,
    /// Waiting for dependencies before running the step at this time.
    WaitDeps(TieredTime),
    /// Gathering, stepping or publishing.
    Active,
    /// Finished cleanly.
    Done,
    /// Aborted by an error.
    Failed,
}

/// One simulator inside a running world: its proxy plus every piece of
/// state the scheduler mutates.
///
/// All mutation happens either inside the owning task or through a
/// short-lived lock from a publishing neighbor; locks are never held
/// across an await.
pub(crate) struct SimNode {
    /// The simulator's ID.
    pub sid: SimId,
    /// Index into the world's node list.
    pub index: usize,
    /// The initialized proxy.
    pub proxy: Proxy,
    /// How the simulator advances.
    pub kind: SimulatorKind,
    /// Tier count of this simulator's clock (1 + enclosing groups).
    pub depth: usize,
    /// Topological rank in the strict subgraph.
    pub rank: usize,
    /// Guaranteed-published-up-to-here time.
    pub progress: Progress,
    /// Pending steps and wake signals.
    pub schedule: StepSchedule,
    /// Output caches, one per `(entity, attribute)`.
    pub outputs: Mutex<BTreeMap<(EntityId, String), OutputCache>>,
    /// Queued deliveries for transient trigger attributes.
    pub timed_input: Mutex<TimedInputBuffer>,
    /// Queued deliveries and memory for persistent trigger attributes.
    pub persistent_input: Mutex<PersistentInputBuffer>,
    /// Data pushed asynchronously via `set_data`, merged into the next
    /// step's inputs.
    pub async_input: Mutex<InputData>,
    /// Scheduler phase, for deadlock detection.
    pub phase: Mutex<TaskPhase>,
    /// Time of the last executed step.
    pub last_step: Mutex<Option<TieredTime>>,
    /// The next self-step the simulator asked for, if any.
    pub next_self_step: Mutex<Option<u64>>,
    /// Union of all attributes any successor reads; what `get_data`
    /// asks for after every step.
    pub output_request: OutputRequest,
    /// Consecutive same-instant steps, bounded by the loop limit.
    pub loop_count: Mutex<u32>,
    /// Last handed-out write time per `(edge, src entity, src attr,
    /// dst entity, dst attr)` for once-only (non-persistent,
    /// non-trigger) reads.
    pub read_marks: Mutex<BTreeMap<(usize, EntityId, String, EntityId, String), TieredTime>>,
}

impl SimNode {
    /// The current phase.
    pub fn phase(&self) -> TaskPhase {
        self.phase.lock().expect("phase poisoned").clone()
    }

    /// Move to `phase`.
    pub fn set_phase(&self, phase: TaskPhase) {
        *self.phase.lock().expect("phase poisoned") = phase;
    }

    /// Whether the task has terminated, cleanly or not.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase(), TaskPhase::Done | TaskPhase::Failed)
    }

    /// The full address of one of this simulator's entities.
    pub fn full_id(&self, eid: &EntityId) -> String {
        self.sid.entity(eid.clone()).to_string()
    }
}
