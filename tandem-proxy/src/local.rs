//! In-process simulators.
//!
//! An [`ApiSimulator`] implements the simulator protocol as plain typed
//! async methods; [`LocalConnection`] adapts it to the uniform
//! [`Connection`] surface so the scheduler cannot tell it from a
//! remote simulator. Callbacks into the orchestrator go through the
//! [`LinkHandle`] passed at `init` — the local twin of the request
//! frames a remote simulator would send.

use crate::call::{ApiCall, ApiReply};
use crate::link::LinkHandle;
use crate::proxy::Connection;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tandem_types::{
    EntityDesc, InputData, OutputReply, OutputRequest, RawMeta, SimId, SimulationError,
};
use tokio::sync::Mutex;

/// Errors an in-process simulator may return. Simulators are user
/// code, so any error type goes; the orchestrator only needs the
/// message.
pub type SimError = Box<dyn std::error::Error + Send + Sync>;

/// The simulator protocol, as implemented by in-process simulators.
///
/// Mirrors the wire protocol exactly: one method per API call, with
/// the same semantics a TCP simulator would provide. Default
/// implementations cover the optional parts.
#[async_trait]
pub trait ApiSimulator: Send {
    /// First call. `link` is the handle for callbacks into the
    /// orchestrator; simulators that never call back may drop it.
    /// Returns the simulator's raw metadata.
    async fn init(
        &mut self,
        link: LinkHandle,
        sid: SimId,
        time_resolution: f64,
        params: Map<String, Value>,
    ) -> Result<RawMeta, SimError>;

    /// Create `num` entities of `model`.
    async fn create(
        &mut self,
        num: usize,
        model: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError>;

    /// Called once after the last `create`, before the first `step`.
    async fn setup_done(&mut self) -> Result<(), SimError> {
        Ok(())
    }

    /// Advance to `time` with the composed `inputs`. Returns the next
    /// self-step, if the simulator wants one.
    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        max_advance: u64,
    ) -> Result<Option<u64>, SimError>;

    /// Produce the requested output attributes.
    async fn get_data(&mut self, outputs: OutputRequest) -> Result<OutputReply, SimError>;

    /// A declared extra method. The default rejects everything.
    async fn extra_method(
        &mut self,
        method: &str,
        _args: Vec<Value>,
        _kwargs: Map<String, Value>,
    ) -> Result<Value, SimError> {
        Err(format!("unknown extra method {method}").into())
    }

    /// Final call; release resources. Errors cannot be meaningfully
    /// handled during shutdown, hence none can be returned.
    async fn stop(&mut self) {}
}

/// [`Connection`] for an [`ApiSimulator`] living in this process.
pub struct LocalConnection {
    sim: Mutex<Box<dyn ApiSimulator>>,
    link: LinkHandle,
    sid: OnceLock<SimId>,
}

impl LocalConnection {
    /// Wrap a simulator. `link` is handed to the simulator at `init`.
    pub fn new(sim: Box<dyn ApiSimulator>, link: LinkHandle) -> Self {
        Self {
            sim: Mutex::new(sim),
            link,
            sid: OnceLock::new(),
        }
    }

    fn sid(&self) -> SimId {
        self.sid
            .get()
            .cloned()
            .unwrap_or_else(|| SimId::new("<uninitialized>"))
    }

    fn fail(&self, method: &str, err: SimError) -> SimulationError {
        SimulationError::Request {
            sid: self.sid(),
            method: method.to_owned(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn request(&self, call: ApiCall) -> Result<ApiReply, SimulationError> {
        let mut sim = self.sim.lock().await;
        match call {
            ApiCall::Init {
                sid,
                time_resolution,
                params,
            } => {
                self.sid.get_or_init(|| sid.clone());
                sim.init(
                    self.link.clone(),
                    sid,
                    time_resolution.unwrap_or(1.0),
                    params,
                )
                .await
                .map(ApiReply::Meta)
                .map_err(|e| self.fail("init", e))
            }
            ApiCall::Create { num, model, params } => sim
                .create(num, &model, params)
                .await
                .map(ApiReply::Entities)
                .map_err(|e| self.fail("create", e)),
            ApiCall::SetupDone => sim
                .setup_done()
                .await
                .map(|()| ApiReply::Done)
                .map_err(|e| self.fail("setup_done", e)),
            ApiCall::Step {
                time,
                inputs,
                max_advance,
            } => sim
                .step(time, inputs, max_advance.unwrap_or(u64::MAX))
                .await
                .map(ApiReply::NextStep)
                .map_err(|e| self.fail("step", e)),
            ApiCall::GetData { outputs } => sim
                .get_data(outputs)
                .await
                .map(ApiReply::Data)
                .map_err(|e| self.fail("get_data", e)),
            ApiCall::Extra {
                method,
                args,
                kwargs,
            } => sim
                .extra_method(&method, args, kwargs)
                .await
                .map(ApiReply::Value)
                .map_err(|e| self.fail(&method, e)),
        }
    }

    async fn stop(&self) {
        self.sim.lock().await.stop().await;
    }
}
