//! Error types for scenario configuration and simulation runtime.

use crate::id::{EntityId, SimId};
use std::fmt;
use thiserror::Error;

/// Errors detected while a scenario is being set up — before any
/// simulator has stepped. These surface synchronously to the caller
/// that is building the world.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A simulator ID that is not part of the world.
    #[error("unknown simulator: {sid}")]
    UnknownSimulator {
        /// The offending ID.
        sid: SimId,
    },

    /// A simulator reported metadata that does not follow the protocol.
    #[error("invalid metadata from {sid}: {reason}")]
    InvalidMeta {
        /// The simulator whose metadata was rejected.
        sid: SimId,
        /// What was wrong with it.
        reason: String,
    },

    /// The simulator's protocol version cannot be handled.
    #[error("unsupported API version {version} from {sid}: {reason}")]
    UnsupportedVersion {
        /// The simulator that reported the version.
        sid: SimId,
        /// The version string as reported.
        version: String,
        /// Why it is not acceptable.
        reason: String,
    },

    /// The version declared for a simulator does not match what it
    /// reports at `init`.
    #[error("{sid} declares API version {declared} but reports {reported}")]
    VersionMismatch {
        /// The simulator in question.
        sid: SimId,
        /// Version from the scenario configuration.
        declared: String,
        /// Version from the simulator's `init` reply.
        reported: String,
    },

    /// Model names overlapping the reserved API method names.
    #[error("{sid} uses illegal model names: {}", names.join(", "))]
    IllegalModelNames {
        /// The simulator in question.
        sid: SimId,
        /// The colliding names.
        names: Vec<String>,
    },

    /// Extra method names overlapping models or reserved methods.
    #[error("{sid} uses illegal extra method names: {}", names.join(", "))]
    IllegalExtraMethods {
        /// The simulator in question.
        sid: SimId,
        /// The colliding names.
        names: Vec<String>,
    },

    /// A model's trigger/persistent attribute partition is inconsistent.
    #[error("bad attribute partition in model {model} of {sid}: {reason}")]
    AttrPartition {
        /// The simulator in question.
        sid: SimId,
        /// The model whose partition is broken.
        model: String,
        /// What was wrong.
        reason: String,
    },

    /// A connection names an attribute the model does not declare.
    #[error("{sid} has no attribute {attr} on entity {eid}")]
    UnknownAttr {
        /// The simulator on the failing side of the connection.
        sid: SimId,
        /// The entity.
        eid: EntityId,
        /// The missing attribute.
        attr: String,
    },

    /// A connection names an entity the simulator never created.
    #[error("{sid} has no entity {eid}")]
    UnknownEntity {
        /// The simulator.
        sid: SimId,
        /// The missing entity.
        eid: EntityId,
    },

    /// The strict dependency subgraph contains a cycle.
    #[error("cyclic dependencies: {}; break the cycle with a weak or time-shifted connection",
            cycle.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" -> "))]
    StrictCycle {
        /// One witnessing cycle, in edge order.
        cycle: Vec<SimId>,
    },

    /// A connection combines features that exclude each other.
    #[error("invalid connection {src} -> {dst}: {reason}")]
    InvalidConnection {
        /// Source simulator.
        src: SimId,
        /// Destination simulator.
        dst: SimId,
        /// Why the combination is rejected.
        reason: String,
    },

    /// A weak edge whose endpoints share no group.
    #[error("weak connection {src} -> {dst} requires both simulators in a common group")]
    WeakEdgeOutsideGroup {
        /// Source simulator.
        src: SimId,
        /// Destination simulator.
        dst: SimId,
    },

    /// Groups must nest or be disjoint.
    #[error("groups overlap without nesting (simulator {sid} is in both)")]
    OverlappingGroups {
        /// A simulator in the non-nested intersection.
        sid: SimId,
    },

    /// `create` returned descriptors that contradict the request.
    #[error("bad create reply from {sid}: {reason}")]
    BadCreate {
        /// The simulator.
        sid: SimId,
        /// What was wrong.
        reason: String,
    },

    /// The simulator's `init` call failed.
    #[error("error during the initialization of {sid}: {reason}")]
    InitFailed {
        /// The simulator.
        sid: SimId,
        /// The failure reported by the simulator or its transport.
        reason: String,
    },

    /// A simulator failed a request during scenario setup.
    #[error("setup request to {sid} failed: {reason}")]
    SetupFailed {
        /// The simulator.
        sid: SimId,
        /// The failure reported by the simulator or its transport.
        reason: String,
    },

    /// A model that the simulator's metadata does not declare.
    #[error("{sid} has no model {model}")]
    UnknownModel {
        /// The simulator.
        sid: SimId,
        /// The requested model name.
        model: String,
    },

    /// A model that scenario code may not instantiate.
    #[error("model {model} of {sid} is not public")]
    PrivateModel {
        /// The simulator.
        sid: SimId,
        /// The model name.
        model: String,
    },

    /// A real-time factor outside its valid range.
    #[error("rt_factor is {value} but must be > 0")]
    InvalidRtFactor {
        /// The rejected factor.
        value: f64,
    },

    /// Scenario changes after the run has started.
    #[error("the world is already running or has finished its run")]
    AlreadyRunning,
}

/// Errors that abort a running simulation. They always name the
/// simulator they originate from.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The connection to a simulator broke down.
    #[error("simulator {sid} closed its connection: {reason}")]
    ConnectionLost {
        /// The simulator.
        sid: SimId,
        /// Transport-level cause.
        reason: String,
    },

    /// A simulator reported a failure for a request.
    #[error("request {method} to {sid} failed: {message}")]
    Request {
        /// The simulator.
        sid: SimId,
        /// The API method that failed.
        method: String,
        /// The failure message from the simulator.
        message: String,
    },

    /// A reply that does not match the API contract.
    #[error("malformed reply from {sid} to {method}: {reason}")]
    MalformedReply {
        /// The simulator.
        sid: SimId,
        /// The API method.
        method: String,
        /// What was malformed.
        reason: String,
    },

    /// Inputs for a simulator could not be serialized.
    #[error("{0}")]
    NonSerializableInputs(#[from] NonSerializableInputs),

    /// A same-time loop ran longer than the configured bound.
    #[error("same-time loop involving {sid} did not converge within {iterations} iterations")]
    LoopBound {
        /// The simulator that exceeded the bound.
        sid: SimId,
        /// The configured maximum.
        iterations: u32,
    },

    /// The run fell behind wallclock under strict real-time pacing.
    #[error("simulation too slow for real-time factor {rt_factor}: {behind:.3}s behind at {sid}")]
    RealTimeOverrun {
        /// The simulator that detected the overrun.
        sid: SimId,
        /// The configured factor.
        rt_factor: f64,
        /// How far behind the run is, in seconds.
        behind: f64,
    },

    /// A `step` return value violating the contract.
    #[error("invalid next step from {sid}: {reason}")]
    InvalidNextStep {
        /// The simulator.
        sid: SimId,
        /// The violation.
        reason: String,
    },

    /// An asynchronous request along a connection that does not allow it.
    #[error("no async-enabled connection for {src} to reach {dst}")]
    NoAsyncEdge {
        /// The requesting simulator.
        src: SimId,
        /// The simulator it tried to reach.
        dst: SimId,
    },

    /// An externally injected event in the past.
    #[error("{sid} set an event at {time} which is before its progress {progress}")]
    EventInPast {
        /// The simulator.
        sid: SimId,
        /// The requested event time.
        time: u64,
        /// Its progress at the time of the request.
        progress: String,
    },

    /// The run was torn down before this simulator finished.
    #[error("simulator {sid} was aborted: {reason}")]
    Aborted {
        /// The simulator.
        sid: SimId,
        /// Why.
        reason: String,
    },
}

/// Aggregated serialization failures for one destination simulator.
///
/// Collected while encoding a `step` request so that the user sees
/// every offending source at once instead of one per run.
#[derive(Debug, Error)]
pub struct NonSerializableInputs {
    /// The simulator whose inputs could not be encoded.
    pub dest: SimId,
    /// One entry per offending value: destination entity, destination
    /// attribute, full source ID.
    pub errors: Vec<(EntityId, String, String)>,
}

impl fmt::Display for NonSerializableInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "errors while trying to JSON-serialize inputs for {}:",
            self.dest
        )?;
        for (eid, attr, src) in &self.errors {
            writeln!(f, "- serializing output from {src} for {eid}.{attr}")?;
        }
        write!(f, "this is likely a problem in the source simulator(s)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_path() {
        let err = ConfigError::StrictCycle {
            cycle: vec![SimId::new("A-0"), SimId::new("B-0"), SimId::new("A-0")],
        };
        let msg = err.to_string();
        assert!(msg.contains("A-0 -> B-0 -> A-0"), "{msg}");
    }

    #[test]
    fn non_serializable_inputs_lists_every_source() {
        let err = NonSerializableInputs {
            dest: SimId::new("Sink-0"),
            errors: vec![
                (EntityId::new("e0"), "val_in".into(), "A-0.a0".into()),
                (EntityId::new("e1"), "val_in".into(), "B-0.b0".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Sink-0"));
        assert!(msg.contains("A-0.a0 for e0.val_in"));
        assert!(msg.contains("B-0.b0 for e1.val_in"));
    }
}
