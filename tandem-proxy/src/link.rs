//! The callback surface simulators use to reach back into the
//! orchestrator.
//!
//! In-process simulators hold a [`LinkHandle`] and call it directly;
//! remote simulators send request frames over their channel, which the
//! connection's reader loop dispatches through [`dispatch_request`].
//! Either way the same trait answers, so a simulator behaves
//! identically in and out of process.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_types::{FullId, SimValue, SimulationError};

/// Shared handle to the orchestrator-side callback implementation.
pub type LinkHandle = Arc<dyn SimulatorLink>;

/// Which entities a `get_related_entities` call asks about.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitySelector {
    /// The whole entity relation graph.
    All,
    /// One entity.
    One(FullId),
    /// Several entities.
    Many(Vec<FullId>),
}

/// Requests a simulator may make back into the orchestrator while it is
/// serving a call.
#[async_trait]
pub trait SimulatorLink: Send + Sync {
    /// Overall progress of the run, in percent.
    async fn get_progress(&self) -> Result<f64, SimulationError>;

    /// The relation subgraph for the selected entities. For a single
    /// entity the reply maps related full IDs to entity descriptions;
    /// for several (or all) it is a graph of nodes and edges.
    async fn get_related_entities(
        &self,
        selector: EntitySelector,
    ) -> Result<Value, SimulationError>;

    /// Read cached outputs of other simulators. Requires an
    /// async-enabled connection from each data owner to the caller.
    async fn get_data(
        &self,
        request: BTreeMap<FullId, Vec<String>>,
    ) -> Result<BTreeMap<FullId, BTreeMap<String, SimValue>>, SimulationError>;

    /// Push data into destination entities' input buffers for their
    /// next step. Requires an async-enabled connection from the caller
    /// to each destination.
    async fn set_data(
        &self,
        data: BTreeMap<FullId, BTreeMap<String, SimValue>>,
    ) -> Result<(), SimulationError>;

    /// Insert an external event: schedule a step of the calling
    /// simulator at the given tier-0 time.
    async fn set_event(&self, time: u64) -> Result<(), SimulationError>;
}

/// Dispatch one inbound request frame to the link. Returns the JSON
/// reply payload, or a human-readable failure message.
pub async fn dispatch_request(
    link: &dyn SimulatorLink,
    method: &str,
    args: Vec<Value>,
    _kwargs: Map<String, Value>,
) -> Result<Value, String> {
    match method {
        "get_progress" => {
            let progress = link.get_progress().await.map_err(|e| e.to_string())?;
            Ok(json!(progress))
        }
        "get_related_entities" => {
            let selector = match args.into_iter().next() {
                None | Some(Value::Null) => EntitySelector::All,
                Some(Value::String(s)) => EntitySelector::One(parse_full_id(&s)?),
                Some(Value::Array(items)) => {
                    let mut ids = Vec::with_capacity(items.len());
                    for item in items {
                        let Value::String(s) = item else {
                            return Err("entity list must contain full IDs".into());
                        };
                        ids.push(parse_full_id(&s)?);
                    }
                    EntitySelector::Many(ids)
                }
                Some(other) => {
                    return Err(format!("cannot select related entities by {other}"));
                }
            };
            link.get_related_entities(selector)
                .await
                .map_err(|e| e.to_string())
        }
        "get_data" => {
            let Some(Value::Object(raw)) = args.into_iter().next() else {
                return Err("get_data expects a {full_id: [attr]} object".into());
            };
            let mut request = BTreeMap::new();
            for (full_id, attrs) in raw {
                let attrs: Vec<String> =
                    serde_json::from_value(attrs).map_err(|e| e.to_string())?;
                request.insert(parse_full_id(&full_id)?, attrs);
            }
            let data = link.get_data(request).await.map_err(|e| e.to_string())?;
            let mut reply = Map::new();
            for (full_id, attrs) in data {
                let mut entry = Map::new();
                for (attr, value) in attrs {
                    let value = serde_json::to_value(&value)
                        .map_err(|_| format!("value of {full_id}.{attr} is not serializable"))?;
                    entry.insert(attr, value);
                }
                reply.insert(full_id.to_string(), Value::Object(entry));
            }
            Ok(Value::Object(reply))
        }
        "set_data" => {
            let Some(Value::Object(raw)) = args.into_iter().next() else {
                return Err("set_data expects a {full_id: {attr: value}} object".into());
            };
            let mut data = BTreeMap::new();
            for (full_id, attrs) in raw {
                let Value::Object(attrs) = attrs else {
                    return Err(format!("attributes of {full_id} must be an object"));
                };
                let attrs: BTreeMap<String, SimValue> = attrs
                    .into_iter()
                    .map(|(attr, value)| (attr, SimValue::Json(value)))
                    .collect();
                data.insert(parse_full_id(&full_id)?, attrs);
            }
            link.set_data(data).await.map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "set_event" => {
            let time = args
                .first()
                .and_then(Value::as_u64)
                .ok_or("set_event expects a non-negative integer time")?;
            link.set_event(time).await.map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        other => Err(format!("unknown request {other}")),
    }
}

fn parse_full_id(s: &str) -> Result<FullId, String> {
    FullId::parse(s).ok_or_else(|| format!("expected a full `sid.eid` ID, got `{s}`"))
}
