//! Version adapters: shims between the current protocol and older ones.
//!
//! Adapters compose as a decorator chain around a [`Connection`] and
//! work on the request level — after the orchestrator has decided what
//! to ask, before the transport encodes it. On the way down they strip
//! what an older simulator would not understand; defaults for fields an
//! old simulator cannot supply are injected during metadata validation.
//! Up-to-date simulators get no extra indirection at all.

use crate::call::{ApiCall, ApiReply};
use crate::proxy::Connection;
use async_trait::async_trait;
use tandem_types::SimulationError;

/// Shim for simulators predating protocol 2.2, which introduced
/// `setup_done`: the call is answered locally and never forwarded.
pub struct SetupDoneShim {
    inner: Box<dyn Connection>,
}

impl SetupDoneShim {
    /// Wrap a connection to a pre-2.2 simulator.
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Connection for SetupDoneShim {
    async fn request(&self, call: ApiCall) -> Result<ApiReply, SimulationError> {
        match call {
            ApiCall::SetupDone => Ok(ApiReply::Done),
            other => self.inner.request(other).await,
        }
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}

/// Shim for simulators predating protocol 3.0, which added
/// `max_advance` to `step` and `time_resolution` to `init`: both are
/// dropped on the way down.
pub struct StepShim {
    inner: Box<dyn Connection>,
}

impl StepShim {
    /// Wrap a connection to a pre-3.0 simulator.
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Connection for StepShim {
    async fn request(&self, call: ApiCall) -> Result<ApiReply, SimulationError> {
        let call = match call {
            ApiCall::Step {
                time,
                inputs,
                max_advance: _,
            } => ApiCall::Step {
                time,
                inputs,
                max_advance: None,
            },
            ApiCall::Init {
                sid,
                time_resolution: _,
                params,
            } => ApiCall::Init {
                sid,
                time_resolution: None,
                params,
            },
            other => other,
        };
        self.inner.request(call).await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}
