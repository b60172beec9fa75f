//! The request-level representation of simulator API calls.
//!
//! Version adapters rewrite calls at this level — after the orchestrator
//! has decided what to ask, before the transport encodes it. In-process
//! connections dispatch it directly, which is what lets opaque
//! (non-JSON) values flow between local simulators.

use serde_json::{Map, Value};
use tandem_types::{EntityDesc, InputData, OutputReply, OutputRequest, RawMeta, SimId};

/// One call into a simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    /// `init(sid, time_resolution=..., **params)` — must be the first call.
    Init {
        /// The ID assigned to the simulator.
        sid: SimId,
        /// Seconds of real time per unit of tier-0 simulation time.
        /// `None` when the simulator's protocol version predates the
        /// parameter.
        time_resolution: Option<f64>,
        /// Free-form simulator parameters.
        params: Map<String, Value>,
    },
    /// `create(num, model, **params)`.
    Create {
        /// Number of entities to create.
        num: usize,
        /// The model to instantiate.
        model: String,
        /// Free-form creation parameters.
        params: Map<String, Value>,
    },
    /// `setup_done()` — after the last `create`, before the first `step`.
    SetupDone,
    /// `step(time, inputs, max_advance)`.
    Step {
        /// The step time, tier 0, in the simulator's own scale.
        time: u64,
        /// The composed inputs for this step.
        inputs: InputData,
        /// How far the simulator may advance on its own. `None` when
        /// the simulator's protocol version predates the parameter.
        max_advance: Option<u64>,
    },
    /// `get_data(outputs)`.
    GetData {
        /// The requested attributes per entity.
        outputs: OutputRequest,
    },
    /// A declared extra method.
    Extra {
        /// The method name.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: Map<String, Value>,
    },
}

impl ApiCall {
    /// The wire-level method name.
    pub fn method(&self) -> &str {
        match self {
            ApiCall::Init { .. } => "init",
            ApiCall::Create { .. } => "create",
            ApiCall::SetupDone => "setup_done",
            ApiCall::Step { .. } => "step",
            ApiCall::GetData { .. } => "get_data",
            ApiCall::Extra { method, .. } => method,
        }
    }
}

/// The reply to an [`ApiCall`], one variant per call shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    /// Reply to `init`: the raw metadata.
    Meta(RawMeta),
    /// Reply to `create`: the created entities.
    Entities(Vec<EntityDesc>),
    /// Reply to `setup_done`.
    Done,
    /// Reply to `step`: the simulator's next self-step, if any.
    NextStep(Option<u64>),
    /// Reply to `get_data`.
    Data(OutputReply),
    /// Reply to an extra method.
    Value(Value),
}

impl ApiReply {
    /// A short label for error messages.
    pub fn label(&self) -> &'static str {
        match self {
            ApiReply::Meta(_) => "meta",
            ApiReply::Entities(_) => "entities",
            ApiReply::Done => "done",
            ApiReply::NextStep(_) => "next step",
            ApiReply::Data(_) => "data",
            ApiReply::Value(_) => "value",
        }
    }
}
