//! The orchestrator side of simulator callbacks.

use crate::node::SimNode;
use crate::scheduler::world_percent;
use crate::world::{RunState, WorldInner};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_proxy::{EntitySelector, SimulatorLink};
use tandem_types::{FullId, SimId, SimValue, SimulationError, TieredTime};

/// Answers one simulator's callbacks against the shared world state.
pub(crate) struct WorldLink {
    inner: Arc<WorldInner>,
    sid: SimId,
}

impl WorldLink {
    pub(crate) fn new(inner: Arc<WorldInner>, sid: SimId) -> Self {
        Self { inner, sid }
    }

    fn run_state(&self) -> Result<Arc<RunState>, SimulationError> {
        self.inner
            .running
            .get()
            .cloned()
            .ok_or_else(|| SimulationError::Aborted {
                sid: self.sid.clone(),
                reason: "the simulation is not running".into(),
            })
    }

    fn own_node<'a>(&self, run: &'a RunState) -> Result<&'a Arc<SimNode>, SimulationError> {
        run.node_by_sid(&self.sid)
            .ok_or_else(|| SimulationError::Aborted {
                sid: self.sid.clone(),
                reason: "unknown calling simulator".into(),
            })
    }

    fn entity_info(&self, full: &FullId) -> Value {
        let models = self.inner.entity_models.lock().expect("entity models poisoned");
        match models.get(full) {
            Some(model) => json!({"type": model}),
            None => json!({}),
        }
    }

    fn related_of(&self, full: &FullId) -> Map<String, Value> {
        let relations = self.inner.relations.lock().expect("relations poisoned");
        let mut reply = Map::new();
        if let Some(related) = relations.get(full) {
            for other in related {
                reply.insert(other.to_string(), self.entity_info(other));
            }
        }
        reply
    }
}

#[async_trait]
impl SimulatorLink for WorldLink {
    async fn get_progress(&self) -> Result<f64, SimulationError> {
        let run = self.run_state()?;
        Ok(world_percent(&run))
    }

    /// One entity: a map of its related full IDs to entity info. A
    /// list: one such map per queried ID. No selector: the whole
    /// relation graph as `{"nodes": {...}, "edges": [[a, b], ...]}`.
    async fn get_related_entities(
        &self,
        selector: EntitySelector,
    ) -> Result<Value, SimulationError> {
        match selector {
            EntitySelector::One(full) => Ok(Value::Object(self.related_of(&full))),
            EntitySelector::Many(ids) => {
                let mut reply = Map::new();
                for full in ids {
                    reply.insert(full.to_string(), Value::Object(self.related_of(&full)));
                }
                Ok(Value::Object(reply))
            }
            EntitySelector::All => {
                let relations = self.inner.relations.lock().expect("relations poisoned");
                let mut nodes = Map::new();
                let mut edges = Vec::new();
                for (full, related) in relations.iter() {
                    nodes.insert(full.to_string(), self.entity_info(full));
                    for other in related {
                        if (full, other) <= (other, full) {
                            edges.push(json!([full.to_string(), other.to_string()]));
                        }
                    }
                }
                Ok(json!({"nodes": nodes, "edges": edges}))
            }
        }
    }

    async fn get_data(
        &self,
        request: BTreeMap<FullId, Vec<String>>,
    ) -> Result<BTreeMap<FullId, BTreeMap<String, SimValue>>, SimulationError> {
        let run = self.run_state()?;
        let caller = self.own_node(&run)?;
        let query_base = caller
            .last_step
            .lock()
            .expect("last step poisoned")
            .clone()
            .unwrap_or_else(|| caller.progress.value());

        let mut reply = BTreeMap::new();
        for (full, attrs) in request {
            let owner = run
                .node_by_sid(&full.sid)
                .ok_or_else(|| SimulationError::Aborted {
                    sid: self.sid.clone(),
                    reason: format!("unknown simulator {}", full.sid),
                })?;
            // data may only be pulled along an async-enabled connection
            // from its owner to the caller
            let edge = run.graph.preds[caller.index]
                .iter()
                .map(|&ei| &run.graph.edges[ei])
                .find(|e| e.src == owner.index && e.async_requests)
                .ok_or_else(|| SimulationError::NoAsyncEdge {
                    src: self.sid.clone(),
                    dst: full.sid.clone(),
                })?;
            let query = match query_base.rewind(edge.shift) {
                Some(q) => q.project(owner.depth),
                None => continue,
            };

            let mut outputs = owner.outputs.lock().expect("outputs poisoned");
            let mut values = BTreeMap::new();
            for attr in attrs {
                if let Some(cache) = outputs.get_mut(&(full.eid.clone(), attr.clone())) {
                    if let Some(value) = cache.get(&query) {
                        values.insert(attr, value.clone());
                    }
                }
            }
            reply.insert(full, values);
        }
        Ok(reply)
    }

    async fn set_data(
        &self,
        data: BTreeMap<FullId, BTreeMap<String, SimValue>>,
    ) -> Result<(), SimulationError> {
        let run = self.run_state()?;
        let caller = self.own_node(&run)?;

        for (full, attrs) in data {
            let dest = run
                .node_by_sid(&full.sid)
                .ok_or_else(|| SimulationError::Aborted {
                    sid: self.sid.clone(),
                    reason: format!("unknown simulator {}", full.sid),
                })?;
            // pushes ride an async-enabled connection from the caller
            let allowed = run.graph.succs[caller.index]
                .iter()
                .map(|&ei| &run.graph.edges[ei])
                .any(|e| e.dst == dest.index && e.async_requests);
            if !allowed {
                return Err(SimulationError::NoAsyncEdge {
                    src: self.sid.clone(),
                    dst: full.sid.clone(),
                });
            }

            let mut pushed = dest.async_input.lock().expect("async input poisoned");
            let entity = pushed.entry(full.eid.clone()).or_default();
            for (attr, value) in attrs {
                entity
                    .entry(attr)
                    .or_default()
                    .insert(self.sid.to_string(), value);
            }
        }
        Ok(())
    }

    async fn set_event(&self, time: u64) -> Result<(), SimulationError> {
        let run = self.run_state()?;
        let caller = self.own_node(&run)?;
        let t = TieredTime::from_base(time, caller.depth);
        let progress = caller.progress.value();
        if t < progress {
            return Err(SimulationError::EventInPast {
                sid: self.sid.clone(),
                time,
                progress: progress.to_string(),
            });
        }
        tracing::debug!(sid = %self.sid, time, "external event");
        caller.schedule.push(t);
        Ok(())
    }
}
