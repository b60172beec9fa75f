//! # tandem-types — core types for the tandem co-simulation orchestrator
//!
//! The leaf crate of the tandem workspace: everything here is plain
//! data, shared by the transport layer (`tandem-proxy`) and the
//! scheduler (`tandem`).
//!
//! | Module | What it holds |
//! |--------|---------------|
//! | [`id`] | Typed simulator/entity identifiers |
//! | [`time`] | The tiered-time algebra ([`TieredTime`], [`TieredInterval`]) |
//! | [`value`] | Attribute values, JSON or opaque in-process objects |
//! | [`data`] | Nested input/output data shapes |
//! | [`meta`] | Simulator metadata, validated and expanded |
//! | [`message`] | The `[kind, id, payload]` wire frame |
//! | [`error`] | Configuration and simulation error kinds |

#![deny(missing_docs)]

pub mod data;
pub mod error;
pub mod id;
pub mod message;
pub mod meta;
pub mod time;
pub mod value;

pub use data::{EntityDesc, InputData, OutputData, OutputReply, OutputRequest, merge_inputs};
pub use error::{ConfigError, NonSerializableInputs, SimulationError};
pub use id::{EntityId, FullId, SimId};
pub use message::Frame;
pub use meta::{ApiVersion, ModelMeta, RawMeta, RawModelMeta, SimMeta, SimulatorKind};
pub use time::{TieredInterval, TieredTime};
pub use value::SimValue;
