//! The world: scenario state, graph freezing and the run entry point.

use crate::config::RunConfig;
use crate::graph::{AttrPair, DependencyGraph, Edge, Flow};
use crate::link::WorldLink;
use crate::node::{SimNode, TaskPhase};
use crate::progress::Progress;
use crate::schedule::StepSchedule;
use crate::scheduler;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tandem_proxy::{ApiSimulator, Connection, LinkHandle, LocalConnection, Proxy, RemoteConnection};
use tandem_types::{
    ConfigError, EntityDesc, EntityId, FullId, OutputRequest, SimId, SimMeta, SimValue,
    SimulationError, SimulatorKind, TieredInterval, TieredTime,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Anything that can end a run early: a scenario defect found while
/// freezing the graph, or a failure during the simulation itself.
#[derive(Debug, Error)]
pub enum RunError {
    /// The scenario is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The simulation aborted.
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

/// Options of one connection between two entities.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Order a same-time loop without blocking on the source.
    pub weak: bool,
    /// Deliver with this lag on the real clock (0: immediate).
    pub time_shifted: u64,
    /// Allow asynchronous requests between the two simulators.
    pub async_requests: bool,
    /// Values per source attribute for reads that reach before the
    /// start of the simulation (required in practice for time-shifted
    /// feedback).
    pub initial_data: BTreeMap<String, SimValue>,
}

impl ConnectOptions {
    /// Plain immediate connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the connection weak.
    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }

    /// Shift delivery by `shift` time units.
    pub fn time_shifted(mut self, shift: u64) -> Self {
        self.time_shifted = shift;
        self
    }

    /// Allow asynchronous requests along this connection.
    pub fn async_requests(mut self) -> Self {
        self.async_requests = true;
        self
    }

    /// Provide a value for `src_attr` before the source's first output.
    pub fn initial(mut self, src_attr: &str, value: SimValue) -> Self {
        self.initial_data.insert(src_attr.to_owned(), value);
        self
    }
}

/// One registered simulator, before the run starts.
struct SimEntry {
    sid: SimId,
    meta: SimMeta,
    proxy: Option<Proxy>,
    entities: BTreeMap<EntityId, String>,
}

/// One declared connection, attributes resolved.
struct ConnectRecord {
    src: usize,
    dst: usize,
    weak: bool,
    shift: u64,
    async_requests: bool,
    flows: Vec<Flow>,
    initial: BTreeMap<String, SimValue>,
}

#[derive(Default)]
struct Setup {
    entries: Vec<SimEntry>,
    index_by_sid: BTreeMap<SimId, usize>,
    counters: BTreeMap<String, usize>,
    connects: Vec<ConnectRecord>,
    groups: Vec<Vec<usize>>,
    initial_events: Vec<(usize, u64)>,
}

/// Shared world state; the link layer holds onto this to answer
/// simulator callbacks.
pub(crate) struct WorldInner {
    setup: Mutex<Setup>,
    pub(crate) relations: Mutex<BTreeMap<FullId, BTreeSet<FullId>>>,
    pub(crate) entity_models: Mutex<BTreeMap<FullId, String>>,
    pub(crate) running: OnceLock<Arc<RunState>>,
}

/// Everything the scheduler needs while a run is active.
pub(crate) struct RunState {
    pub(crate) nodes: Vec<Arc<SimNode>>,
    pub(crate) graph: DependencyGraph,
    pub(crate) until: u64,
    pub(crate) config: RunConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) terminated: AtomicBool,
    pub(crate) started: Instant,
}

impl RunState {
    /// The horizon in a node's tier frame.
    pub(crate) fn until_for(&self, node: &SimNode) -> TieredTime {
        TieredTime::from_base(self.until, node.depth)
    }

    pub(crate) fn node_by_sid(&self, sid: &SimId) -> Option<&Arc<SimNode>> {
        self.nodes.iter().find(|n| &n.sid == sid)
    }
}

/// A co-simulation: the simulators, their connections, and `run`.
///
/// Scenario construction is deliberately minimal — start simulators,
/// create entities, connect them, optionally group same-time loops,
/// then [`run`](World::run):
///
/// ```no_run
/// # use tandem::{World, RunConfig, ConnectOptions};
/// # use tandem_types::FullId;
/// # async fn scenario(sim_a: Box<dyn tandem_proxy::ApiSimulator>,
/// #                   sim_b: Box<dyn tandem_proxy::ApiSimulator>) -> Result<(), tandem::RunError> {
/// let world = World::new(RunConfig::default());
/// let a = world.start_local("A", sim_a, Default::default()).await?;
/// let b = world.start_local("B", sim_b, Default::default()).await?;
/// let a0 = world.create(&a, 1, "Model", Default::default()).await?.remove(0);
/// let b0 = world.create(&b, 1, "Model", Default::default()).await?.remove(0);
/// world.connect(
///     FullId::new(a.clone(), a0.eid.clone()),
///     FullId::new(b.clone(), b0.eid.clone()),
///     &[("val_out", "val_in")],
///     ConnectOptions::new(),
/// )?;
/// world.run(10).await?;
/// # Ok(())
/// # }
/// ```
pub struct World {
    inner: Arc<WorldInner>,
    config: RunConfig,
    time_resolution: f64,
}

impl World {
    /// A fresh world with the given run configuration.
    pub fn new(config: RunConfig) -> Self {
        Self {
            inner: Arc::new(WorldInner {
                setup: Mutex::new(Setup::default()),
                relations: Mutex::new(BTreeMap::new()),
                entity_models: Mutex::new(BTreeMap::new()),
                running: OnceLock::new(),
            }),
            config,
            time_resolution: 1.0,
        }
    }

    /// Set the number of real seconds one tier-0 time unit stands for
    /// (passed to every simulator's `init`).
    pub fn with_time_resolution(mut self, resolution: f64) -> Self {
        assert!(resolution > 0.0, "time_resolution must be > 0");
        self.time_resolution = resolution;
        self
    }

    /// Start a simulator over any connection. `make` receives the
    /// assigned ID (`name` plus a running index) and the callback link
    /// for the new simulator, and returns its connection.
    pub async fn start<F>(
        &self,
        name: &str,
        params: Map<String, Value>,
        declared_version: Option<&str>,
        make: F,
    ) -> Result<SimId, ConfigError>
    where
        F: FnOnce(&SimId, LinkHandle) -> Box<dyn Connection>,
    {
        let (sid, link) = self.reserve(name)?;
        let conn = make(&sid, link);
        self.finish_start(sid, conn, params, declared_version).await
    }

    /// Start an in-process simulator.
    pub async fn start_local(
        &self,
        name: &str,
        sim: Box<dyn ApiSimulator>,
        params: Map<String, Value>,
    ) -> Result<SimId, ConfigError> {
        self.start(name, params, None, |_, link| {
            Box::new(LocalConnection::new(sim, link))
        })
        .await
    }

    /// Start a simulator by dialing an already-running service.
    pub async fn start_remote(
        &self,
        name: &str,
        addr: &str,
        params: Map<String, Value>,
        declared_version: Option<&str>,
    ) -> Result<SimId, ConfigError> {
        let (sid, link) = self.reserve(name)?;
        let conn = RemoteConnection::connect(sid.clone(), addr, link)
            .await
            .map_err(|e| ConfigError::InitFailed {
                sid: sid.clone(),
                reason: e.to_string(),
            })?;
        self.finish_start(sid, Box::new(conn), params, declared_version)
            .await
    }

    fn reserve(&self, name: &str) -> Result<(SimId, LinkHandle), ConfigError> {
        let mut setup = self.setup()?;
        let counter = setup.counters.entry(name.to_owned()).or_insert(0);
        let sid = SimId::new(format!("{name}-{counter}"));
        *counter += 1;
        drop(setup);
        let link: LinkHandle = Arc::new(WorldLink::new(Arc::clone(&self.inner), sid.clone()));
        Ok((sid, link))
    }

    async fn finish_start(
        &self,
        sid: SimId,
        conn: Box<dyn Connection>,
        params: Map<String, Value>,
        declared_version: Option<&str>,
    ) -> Result<SimId, ConfigError> {
        let proxy =
            Proxy::initialize(conn, sid.clone(), self.time_resolution, params, declared_version)
                .await?;
        let mut setup = self.setup()?;
        let index = setup.entries.len();
        setup.entries.push(SimEntry {
            sid: sid.clone(),
            meta: proxy.meta().clone(),
            proxy: Some(proxy),
            entities: BTreeMap::new(),
        });
        setup.index_by_sid.insert(sid.clone(), index);
        tracing::debug!(sid = %sid, "simulator started");
        Ok(sid)
    }

    /// Create `num` entities of `model` in simulator `sid` and record
    /// them (and their relations) world-side.
    pub async fn create(
        &self,
        sid: &SimId,
        num: usize,
        model: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, ConfigError> {
        let (index, proxy) = {
            let mut setup = self.setup()?;
            let index = *setup
                .index_by_sid
                .get(sid)
                .ok_or_else(|| ConfigError::UnknownSimulator { sid: sid.clone() })?;
            let proxy = setup.entries[index]
                .proxy
                .take()
                .ok_or(ConfigError::AlreadyRunning)?;
            (index, proxy)
        };
        let result = proxy.create(num, model, params).await;
        let mut setup = self.setup()?;
        setup.entries[index].proxy = Some(proxy);
        let entities = result?;
        for entity in &entities {
            self.register_entity(&mut setup, index, sid, entity, None);
        }
        Ok(entities)
    }

    fn register_entity(
        &self,
        setup: &mut Setup,
        index: usize,
        sid: &SimId,
        entity: &EntityDesc,
        parent: Option<&FullId>,
    ) {
        setup.entries[index]
            .entities
            .insert(entity.eid.clone(), entity.model.clone());
        let full = sid.entity(entity.eid.clone());
        self.inner
            .entity_models
            .lock()
            .expect("entity models poisoned")
            .insert(full.clone(), entity.model.clone());

        let mut relations = self.inner.relations.lock().expect("relations poisoned");
        if let Some(parent) = parent {
            relations.entry(parent.clone()).or_default().insert(full.clone());
            relations.entry(full.clone()).or_default().insert(parent.clone());
        }
        for rel in &entity.rel {
            match FullId::parse(rel) {
                Some(other) => {
                    relations.entry(full.clone()).or_default().insert(other.clone());
                    relations.entry(other).or_default().insert(full.clone());
                }
                None => tracing::warn!(sid = %sid, rel = %rel, "ignoring malformed relation"),
            }
        }
        drop(relations);

        for child in &entity.children {
            self.register_entity(setup, index, sid, child, Some(&full));
        }
    }

    /// Connect `src` to `dst`, exchanging the given `(src, dst)`
    /// attribute pairs.
    pub fn connect(
        &self,
        src: FullId,
        dst: FullId,
        attr_pairs: &[(&str, &str)],
        opts: ConnectOptions,
    ) -> Result<(), ConfigError> {
        let mut setup = self.setup()?;

        if opts.weak && opts.time_shifted > 0 {
            return Err(ConfigError::InvalidConnection {
                src: src.sid,
                dst: dst.sid,
                reason: "a connection cannot be both weak and time-shifted".into(),
            });
        }
        if opts.async_requests && (opts.weak || opts.time_shifted > 0) {
            return Err(ConfigError::InvalidConnection {
                src: src.sid,
                dst: dst.sid,
                reason: "async requests require a standard immediate connection".into(),
            });
        }
        if src == dst {
            return Err(ConfigError::InvalidConnection {
                src: src.sid,
                dst: dst.sid,
                reason: "cannot connect an entity to itself".into(),
            });
        }

        let si = *setup
            .index_by_sid
            .get(&src.sid)
            .ok_or_else(|| ConfigError::UnknownSimulator {
                sid: src.sid.clone(),
            })?;
        let di = *setup
            .index_by_sid
            .get(&dst.sid)
            .ok_or_else(|| ConfigError::UnknownSimulator {
                sid: dst.sid.clone(),
            })?;

        let src_model_name = setup.entries[si]
            .entities
            .get(&src.eid)
            .ok_or_else(|| ConfigError::UnknownEntity {
                sid: src.sid.clone(),
                eid: src.eid.clone(),
            })?
            .clone();
        let dst_model_name = setup.entries[di]
            .entities
            .get(&dst.eid)
            .ok_or_else(|| ConfigError::UnknownEntity {
                sid: dst.sid.clone(),
                eid: dst.eid.clone(),
            })?
            .clone();

        let src_meta = &setup.entries[si].meta;
        let dst_meta = &setup.entries[di].meta;
        let src_model = src_meta
            .model(&src_model_name)
            .expect("created entities have a declared model");
        let dst_model = dst_meta
            .model(&dst_model_name)
            .expect("created entities have a declared model");

        let mut pairs = Vec::with_capacity(attr_pairs.len());
        for &(src_attr, dst_attr) in attr_pairs {
            if !src_model.attrs.contains(src_attr) {
                return Err(ConfigError::UnknownAttr {
                    sid: src.sid.clone(),
                    eid: src.eid.clone(),
                    attr: src_attr.to_owned(),
                });
            }
            if !dst_model.accepts(dst_attr) {
                return Err(ConfigError::UnknownAttr {
                    sid: dst.sid.clone(),
                    eid: dst.eid.clone(),
                    attr: dst_attr.to_owned(),
                });
            }
            // attributes accepted only through any_inputs default by
            // the simulator's kind
            let declared = dst_model.attrs.contains(dst_attr);
            let trigger = dst_model.trigger.contains(dst_attr)
                || (!declared && dst_meta.kind == SimulatorKind::EventBased);
            let persistent = dst_model.persistent.contains(dst_attr)
                || (!declared && dst_meta.kind == SimulatorKind::TimeBased);
            pairs.push(AttrPair {
                src: src_attr.to_owned(),
                dst: dst_attr.to_owned(),
                trigger,
                persistent,
            });
        }

        let record = setup.connects.iter_mut().find(|r| {
            r.src == si
                && r.dst == di
                && r.weak == opts.weak
                && r.shift == opts.time_shifted
                && r.async_requests == opts.async_requests
        });
        let record = match record {
            Some(record) => record,
            None => {
                setup.connects.push(ConnectRecord {
                    src: si,
                    dst: di,
                    weak: opts.weak,
                    shift: opts.time_shifted,
                    async_requests: opts.async_requests,
                    flows: Vec::new(),
                    initial: BTreeMap::new(),
                });
                setup.connects.last_mut().expect("pushed above")
            }
        };
        match record
            .flows
            .iter_mut()
            .find(|f| f.src_eid == src.eid && f.dst_eid == dst.eid)
        {
            Some(flow) => flow.pairs.extend(pairs),
            None => record.flows.push(Flow {
                src_eid: src.eid,
                dst_eid: dst.eid,
                pairs,
            }),
        }
        record.initial.extend(opts.initial_data);
        Ok(())
    }

    /// Put simulators into a common group: they share one extra
    /// microstep tier, which is what lets weak connections order a
    /// same-time loop among them. Groups may nest.
    pub fn group(&self, members: &[SimId]) -> Result<(), ConfigError> {
        let mut setup = self.setup()?;
        let mut indices = Vec::with_capacity(members.len());
        for sid in members {
            indices.push(*setup.index_by_sid.get(sid).ok_or_else(|| {
                ConfigError::UnknownSimulator { sid: sid.clone() }
            })?);
        }
        setup.groups.push(indices);
        Ok(())
    }

    /// Schedule a first step for `sid` at `time`; event-based
    /// simulators do not step at all without one.
    pub fn set_initial_event(&self, sid: &SimId, time: u64) -> Result<(), ConfigError> {
        let mut setup = self.setup()?;
        let index = *setup
            .index_by_sid
            .get(sid)
            .ok_or_else(|| ConfigError::UnknownSimulator { sid: sid.clone() })?;
        setup.initial_events.push((index, time));
        Ok(())
    }

    /// Run the simulation until time `until`.
    ///
    /// # Errors
    ///
    /// [`RunError::Config`] for defects found while freezing the graph
    /// (cyclic strict dependencies above all); [`RunError::Simulation`]
    /// when a simulator fails mid-run — the run then shuts every other
    /// simulator down (bounded by the configured stop timeout) before
    /// returning the original error.
    pub async fn run(&self, until: u64) -> Result<(), RunError> {
        if let Some(factor) = self.config.rt_factor {
            if factor.is_nan() || factor <= 0.0 {
                return Err(ConfigError::InvalidRtFactor { value: factor }.into());
            }
        }
        let run = self.freeze(until)?;
        self.inner
            .running
            .set(Arc::clone(&run))
            .map_err(|_| ConfigError::AlreadyRunning)?;

        for node in &run.nodes {
            if let Err(e) = node.proxy.setup_done().await {
                self.shutdown(&run).await;
                return Err(e.into());
            }
        }

        tracing::info!(until, simulators = run.nodes.len(), "starting simulation");
        let mut tasks = JoinSet::new();
        for node in &run.nodes {
            tasks.spawn(scheduler::sim_task(Arc::clone(&run), Arc::clone(node)));
        }

        let mut first_err: Option<SimulationError> = None;
        while let Some(joined) = tasks.join_next().await {
            let failed = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join_err) => Some(SimulationError::Aborted {
                    sid: SimId::new("<scheduler>"),
                    reason: join_err.to_string(),
                }),
            };
            if let Some(e) = failed {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                run.cancel.cancel();
            }
        }

        self.shutdown(&run).await;
        match first_err {
            Some(e) => Err(e.into()),
            None => {
                tracing::info!(until, "simulation finished");
                Ok(())
            }
        }
    }

    /// Stop every simulator, downstream consumers first, each within
    /// the configured grace period.
    async fn shutdown(&self, run: &RunState) {
        run.cancel.cancel();
        let mut order: Vec<&Arc<SimNode>> = run.nodes.iter().collect();
        order.sort_by_key(|n| std::cmp::Reverse(n.rank));
        for node in order {
            if tokio::time::timeout(self.config.stop_timeout, node.proxy.stop())
                .await
                .is_err()
            {
                tracing::warn!(sid = %node.sid, "simulator did not stop in time");
            }
        }
    }

    fn setup(&self) -> Result<std::sync::MutexGuard<'_, Setup>, ConfigError> {
        if self.inner.running.get().is_some() {
            return Err(ConfigError::AlreadyRunning);
        }
        Ok(self.inner.setup.lock().expect("setup poisoned"))
    }

    /// Freeze the scenario into a runnable state.
    fn freeze(&self, until: u64) -> Result<Arc<RunState>, ConfigError> {
        let mut setup = self.setup()?;
        let Setup {
            entries,
            connects,
            groups,
            initial_events,
            ..
        } = &mut *setup;
        let n = entries.len();

        // groups must nest or be disjoint
        let group_sets: Vec<BTreeSet<usize>> = groups
            .iter()
            .map(|g| g.iter().copied().collect())
            .collect();
        for (i, a) in group_sets.iter().enumerate() {
            for b in &group_sets[i + 1..] {
                let overlap: BTreeSet<_> = a.intersection(b).copied().collect();
                if !overlap.is_empty() && !a.is_subset(b) && !b.is_subset(a) {
                    let offender = *overlap.iter().next().expect("nonempty overlap");
                    return Err(ConfigError::OverlappingGroups {
                        sid: entries[offender].sid.clone(),
                    });
                }
            }
        }

        let mut depth = vec![1usize; n];
        for g in &group_sets {
            for &m in g {
                depth[m] += 1;
            }
        }

        let mut edges = Vec::with_capacity(connects.len());
        for rec in connects.iter() {
            let (pre, post) = (depth[rec.src], depth[rec.dst]);
            let interval = if rec.shift > 0 {
                TieredInterval::shifted(pre, post, rec.shift)
            } else if rec.weak {
                let shared = group_sets
                    .iter()
                    .filter(|g| g.contains(&rec.src) && g.contains(&rec.dst))
                    .count();
                if shared == 0 {
                    return Err(ConfigError::WeakEdgeOutsideGroup {
                        src: entries[rec.src].sid.clone(),
                        dst: entries[rec.dst].sid.clone(),
                    });
                }
                TieredInterval::weak(pre, post, shared)
            } else {
                TieredInterval::identity(pre, post)
            };
            edges.push(Edge {
                src: rec.src,
                dst: rec.dst,
                weak: rec.weak,
                shift: rec.shift,
                async_requests: rec.async_requests,
                interval,
                flows: rec.flows.clone(),
                initial: rec.initial.clone(),
            });
        }

        let sids: Vec<SimId> = entries.iter().map(|e| e.sid.clone()).collect();
        let graph = DependencyGraph::build(n, edges, &sids)?;

        // what every simulator will be asked for after each step
        let mut output_requests: Vec<BTreeMap<EntityId, BTreeSet<String>>> = vec![BTreeMap::new(); n];
        for edge in &graph.edges {
            for flow in &edge.flows {
                let attrs = output_requests[edge.src].entry(flow.src_eid.clone()).or_default();
                for pair in &flow.pairs {
                    attrs.insert(pair.src.clone());
                }
            }
        }

        let mut nodes = Vec::with_capacity(n);
        for (i, entry) in entries.iter_mut().enumerate() {
            let proxy = entry.proxy.take().ok_or(ConfigError::AlreadyRunning)?;
            let kind = entry.meta.kind;
            let output_request: OutputRequest = output_requests[i]
                .iter()
                .map(|(eid, attrs)| (eid.clone(), attrs.iter().cloned().collect()))
                .collect();
            nodes.push(Arc::new(SimNode {
                sid: entry.sid.clone(),
                index: i,
                proxy,
                kind,
                depth: depth[i],
                rank: graph.ranks[i],
                progress: Progress::new(TieredTime::zero(depth[i])),
                schedule: StepSchedule::new(),
                outputs: Mutex::new(BTreeMap::new()),
                timed_input: Mutex::new(Default::default()),
                persistent_input: Mutex::new(Default::default()),
                async_input: Mutex::new(Default::default()),
                phase: Mutex::new(TaskPhase::Starting),
                last_step: Mutex::new(None),
                next_self_step: Mutex::new(None),
                output_request,
                loop_count: Mutex::new(0),
                read_marks: Mutex::new(BTreeMap::new()),
            }));
        }

        // seed persistent memory from initial data
        for edge in &graph.edges {
            let src = &nodes[edge.src];
            let dest = &nodes[edge.dst];
            for flow in &edge.flows {
                let src_full = src.full_id(&flow.src_eid);
                for pair in flow.pairs.iter().filter(|p| p.trigger && p.persistent) {
                    if let Some(value) = edge.initial.get(&pair.src) {
                        dest.persistent_input
                            .lock()
                            .expect("persistent buffer poisoned")
                            .seed(flow.dst_eid.clone(), &pair.dst, &src_full, value.clone());
                    }
                }
            }
        }

        // time-based and hybrid simulators start at zero on their own
        for node in &nodes {
            if matches!(node.kind, SimulatorKind::TimeBased | SimulatorKind::Hybrid) {
                node.schedule.push(TieredTime::zero(node.depth));
            }
        }
        for &(index, time) in initial_events.iter() {
            nodes[index]
                .schedule
                .push(TieredTime::from_base(time, nodes[index].depth));
        }

        Ok(Arc::new(RunState {
            nodes,
            graph,
            until,
            config: self.config.clone(),
            cancel: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            started: Instant::now(),
        }))
    }
}
