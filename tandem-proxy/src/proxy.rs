//! The typed proxy every simulator is driven through.
//!
//! A [`Connection`] is the uniform request surface — in-process, TCP,
//! or an adapter wrapping either. [`Proxy::initialize`] performs the
//! `init` handshake, validates the reported metadata, wraps the
//! connection in whatever version adapters the simulator needs, and
//! returns the typed facade used by the scheduler.

use crate::adapters::{SetupDoneShim, StepShim};
use crate::call::{ApiCall, ApiReply};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tandem_types::{
    ApiVersion, ConfigError, EntityDesc, InputData, OutputReply, OutputRequest, SimId, SimMeta,
    SimulationError,
};

/// Uniform async request/response surface to one simulator.
///
/// Implementations: [`LocalConnection`](crate::local::LocalConnection)
/// for in-process simulators, [`RemoteConnection`](crate::remote::RemoteConnection)
/// for simulators behind a framed channel, and the version adapters in
/// [`adapters`](crate::adapters) which wrap any of the former.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Perform one call and wait for its reply.
    async fn request(&self, call: ApiCall) -> Result<ApiReply, SimulationError>;

    /// Tell the simulator to shut down and release the transport.
    /// Idempotent; transport errors are swallowed.
    async fn stop(&self);
}

/// A simulator, initialized and ready to be driven.
pub struct Proxy {
    sid: SimId,
    meta: SimMeta,
    conn: Box<dyn Connection>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("sid", &self.sid)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Run the `init` handshake on `conn` and build the proxy.
    ///
    /// `declared_version`, when given, is the API version the scenario
    /// configuration claims for this simulator; the reported version
    /// must match it exactly, and pre-3.0 declarations suppress the
    /// `time_resolution` init argument the old protocol does not know.
    ///
    /// # Errors
    ///
    /// Any metadata validation failure of
    /// [`SimMeta::validate`], [`ConfigError::VersionMismatch`] when the
    /// declaration disagrees with the report, and
    /// [`ConfigError::InitFailed`] when the call itself fails.
    pub async fn initialize(
        conn: Box<dyn Connection>,
        sid: SimId,
        time_resolution: f64,
        params: Map<String, Value>,
        declared_version: Option<&str>,
    ) -> Result<Proxy, ConfigError> {
        let declared = declared_version
            .map(|v| {
                ApiVersion::parse(v).map_err(|reason| ConfigError::UnsupportedVersion {
                    sid: sid.clone(),
                    version: v.to_owned(),
                    reason,
                })
            })
            .transpose()?;

        let init = ApiCall::Init {
            sid: sid.clone(),
            time_resolution: match declared {
                Some(v) if v.is_before(3, 0) => None,
                _ => Some(time_resolution),
            },
            params,
        };
        let reply = conn
            .request(init)
            .await
            .map_err(|e| ConfigError::InitFailed {
                sid: sid.clone(),
                reason: e.to_string(),
            })?;
        let raw = match reply {
            ApiReply::Meta(raw) => raw,
            other => {
                return Err(ConfigError::InitFailed {
                    sid: sid.clone(),
                    reason: format!("init replied with {}", other.label()),
                });
            }
        };

        let meta = SimMeta::validate(raw, &sid)?;
        if let Some(declared) = declared {
            if (declared.major, declared.minor)
                != (meta.api_version.major, meta.api_version.minor)
            {
                return Err(ConfigError::VersionMismatch {
                    sid,
                    declared: declared.to_string(),
                    reported: meta.api_version.to_string(),
                });
            }
        } else if meta.api_version.is_before(3, 0) {
            tracing::warn!(
                sid = %sid,
                version = %meta.api_version,
                "simulator uses an outdated API version; declare it explicitly to silence this"
            );
        }
        if meta.kind_defaulted {
            tracing::warn!(
                sid = %sid,
                "DEPRECATION: metadata carries no simulator type, defaulting to time-based"
            );
        }

        // Adapter nesting order matters: the newest shim is applied
        // last so older shims see already-downgraded calls.
        let mut conn = conn;
        if meta.api_version.is_before(2, 2) {
            conn = Box::new(SetupDoneShim::new(conn));
        }
        if meta.api_version.is_before(3, 0) {
            conn = Box::new(StepShim::new(conn));
        }

        Ok(Proxy { sid, meta, conn })
    }

    /// The simulator's ID.
    pub fn sid(&self) -> &SimId {
        &self.sid
    }

    /// The validated metadata from `init`.
    pub fn meta(&self) -> &SimMeta {
        &self.meta
    }

    /// Create `num` entities of `model`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownModel`] / [`ConfigError::PrivateModel`]
    /// before the call; [`ConfigError::BadCreate`] when the reply's
    /// outer count or model differs from the request, or a child uses
    /// an undeclared model; [`ConfigError::SetupFailed`] on transport
    /// or simulator failure.
    pub async fn create(
        &self,
        num: usize,
        model: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, ConfigError> {
        let model_meta = self
            .meta
            .model(model)
            .ok_or_else(|| ConfigError::UnknownModel {
                sid: self.sid.clone(),
                model: model.to_owned(),
            })?;
        if !model_meta.public {
            return Err(ConfigError::PrivateModel {
                sid: self.sid.clone(),
                model: model.to_owned(),
            });
        }

        let reply = self
            .conn
            .request(ApiCall::Create {
                num,
                model: model.to_owned(),
                params,
            })
            .await
            .map_err(|e| ConfigError::SetupFailed {
                sid: self.sid.clone(),
                reason: e.to_string(),
            })?;
        let entities = match reply {
            ApiReply::Entities(entities) => entities,
            other => {
                return Err(ConfigError::BadCreate {
                    sid: self.sid.clone(),
                    reason: format!("create replied with {}", other.label()),
                });
            }
        };

        if entities.len() != num {
            return Err(ConfigError::BadCreate {
                sid: self.sid.clone(),
                reason: format!("requested {num} entities, got {}", entities.len()),
            });
        }
        for entity in &entities {
            if entity.model != model {
                return Err(ConfigError::BadCreate {
                    sid: self.sid.clone(),
                    reason: format!(
                        "requested model {model}, entity {} is a {}",
                        entity.eid, entity.model
                    ),
                });
            }
            self.check_children(entity)?;
        }
        Ok(entities)
    }

    fn check_children(&self, entity: &EntityDesc) -> Result<(), ConfigError> {
        for child in &entity.children {
            if self.meta.model(&child.model).is_none() {
                return Err(ConfigError::BadCreate {
                    sid: self.sid.clone(),
                    reason: format!("child {} uses undeclared model {}", child.eid, child.model),
                });
            }
            self.check_children(child)?;
        }
        Ok(())
    }

    /// Signal that scenario setup is complete.
    pub async fn setup_done(&self) -> Result<(), SimulationError> {
        self.conn.request(ApiCall::SetupDone).await.map(|_| ())
    }

    /// Step the simulator at `time` with `inputs`. Returns the
    /// simulator's requested next self-step, validated to be strictly
    /// in the future.
    pub async fn step(
        &self,
        time: u64,
        inputs: InputData,
        max_advance: u64,
    ) -> Result<Option<u64>, SimulationError> {
        let reply = self
            .conn
            .request(ApiCall::Step {
                time,
                inputs,
                max_advance: Some(max_advance),
            })
            .await?;
        let next = match reply {
            ApiReply::NextStep(next) => next,
            other => {
                return Err(SimulationError::MalformedReply {
                    sid: self.sid.clone(),
                    method: "step".into(),
                    reason: format!("step replied with {}", other.label()),
                });
            }
        };
        if let Some(next) = next {
            if next <= time {
                return Err(SimulationError::InvalidNextStep {
                    sid: self.sid.clone(),
                    reason: format!("next step {next} is not after the current step {time}"),
                });
            }
        }
        Ok(next)
    }

    /// Fetch the requested output attributes.
    pub async fn get_data(&self, outputs: &OutputRequest) -> Result<OutputReply, SimulationError> {
        let reply = self
            .conn
            .request(ApiCall::GetData {
                outputs: outputs.clone(),
            })
            .await?;
        match reply {
            ApiReply::Data(data) => Ok(data),
            other => Err(SimulationError::MalformedReply {
                sid: self.sid.clone(),
                method: "get_data".into(),
                reason: format!("get_data replied with {}", other.label()),
            }),
        }
    }

    /// Invoke a declared extra method.
    pub async fn call_extra(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, SimulationError> {
        if !self.meta.extra_methods.iter().any(|m| m == method) {
            return Err(SimulationError::Request {
                sid: self.sid.clone(),
                method: method.to_owned(),
                message: "not a declared extra method".into(),
            });
        }
        let reply = self
            .conn
            .request(ApiCall::Extra {
                method: method.to_owned(),
                args,
                kwargs,
            })
            .await?;
        match reply {
            ApiReply::Value(v) => Ok(v),
            other => Err(SimulationError::MalformedReply {
                sid: self.sid.clone(),
                method: method.to_owned(),
                reason: format!("extra method replied with {}", other.label()),
            }),
        }
    }

    /// Shut the simulator down. Idempotent and infallible.
    pub async fn stop(&self) {
        self.conn.stop().await;
    }
}
