//! The nested data shapes exchanged with simulators.

use crate::id::EntityId;
use crate::value::SimValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inputs for one step of a simulator:
/// `dst_eid → dst_attr → src_full_id → value`.
///
/// The innermost map is keyed by the *full* source address because one
/// attribute may be fed by several sources at once (different consumers
/// providing loads for one grid node, say) and only the simulator knows
/// how to aggregate them.
pub type InputData = BTreeMap<EntityId, BTreeMap<String, BTreeMap<String, SimValue>>>;

/// Outputs of a `get_data` call: `eid → attr → value`.
pub type OutputData = BTreeMap<EntityId, BTreeMap<String, SimValue>>;

/// The attributes requested from a simulator: `eid → [attr]`.
pub type OutputRequest = BTreeMap<EntityId, Vec<String>>;

/// Reply of a `get_data` call.
///
/// Event-based simulators may timestamp their output: when `time` is
/// set, the data counts as produced at that (future) instant of the
/// simulator's own clock rather than at the step that yielded it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputReply {
    /// Output time in the simulator's own time scale, if any.
    pub time: Option<u64>,
    /// The attribute values.
    pub data: OutputData,
}

/// Merge `update` into `base`, innermost maps merging per key.
pub fn merge_inputs(base: &mut InputData, update: InputData) {
    for (eid, attrs) in update {
        let dst_attrs = base.entry(eid).or_default();
        for (attr, sources) in attrs {
            dst_attrs.entry(attr).or_default().extend(sources);
        }
    }
}

/// Descriptor of an entity created by a simulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDesc {
    /// Entity ID, unique within the creating simulator.
    pub eid: EntityId,
    /// The model this entity instantiates.
    #[serde(rename = "type")]
    pub model: String,
    /// Full IDs of related entities (both directions are recorded).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rel: Vec<String>,
    /// Child entities, forming a forest within the simulator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<EntityDesc>,
}
