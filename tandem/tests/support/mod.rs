//! Mock simulators shared by the end-to-end scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tandem_proxy::{ApiSimulator, LinkHandle, SimError};
use tandem_types::{
    EntityDesc, EntityId, InputData, OutputReply, OutputRequest, RawMeta, SimId, SimValue,
};

/// Route scheduler traces into the test output; `RUST_LOG=debug`
/// shows the step-by-step decisions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every step of every simulator, in execution order.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<StepRecord>>,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub sid: String,
    pub time: u64,
    pub inputs: InputData,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, sid: &SimId, time: u64, inputs: &InputData) {
        self.log.lock().unwrap().push(StepRecord {
            sid: sid.to_string(),
            time,
            inputs: inputs.clone(),
        });
    }

    /// `(sid, time)` pairs in execution order.
    pub fn steps(&self) -> Vec<(String, u64)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.sid.clone(), r.time))
            .collect()
    }

    /// Steps of one simulator.
    pub fn steps_of(&self, sid: &str) -> Vec<u64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sid == sid)
            .map(|r| r.time)
            .collect()
    }

    /// The input value a simulator saw at its first step at `time`.
    pub fn input(&self, sid: &str, time: u64, eid: &str, attr: &str, src: &str) -> Option<Value> {
        let log = self.log.lock().unwrap();
        let record = log.iter().find(|r| r.sid == sid && r.time == time)?;
        record
            .inputs
            .get(&EntityId::new(eid))?
            .get(attr)?
            .get(src)?
            .as_json()
            .cloned()
    }

    /// All step records of one simulator, in execution order.
    pub fn records_of(&self, sid: &str) -> Vec<StepRecord> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sid == sid)
            .cloned()
            .collect()
    }
}

/// Pull one JSON input value out of a recorded step.
pub fn input_of(record: &StepRecord, eid: &str, attr: &str, src: &str) -> Option<Value> {
    record
        .inputs
        .get(&EntityId::new(eid))?
        .get(attr)?
        .get(src)?
        .as_json()
        .cloned()
}

fn meta(kind: &str, model: &str, attrs: &[&str]) -> RawMeta {
    serde_json::from_value(json!({
        "api_version": "3.0",
        "type": kind,
        "models": {model: {"public": true, "params": [], "attrs": attrs}},
    }))
    .unwrap()
}

fn entities(num: usize, model: &str) -> Vec<EntityDesc> {
    (0..num)
        .map(|i| EntityDesc {
            eid: EntityId::new(format!("{}{i}", model.to_lowercase())),
            model: model.to_owned(),
            rel: vec![],
            children: vec![],
        })
        .collect()
}

fn single_output(eid: &str, attr: &str, value: SimValue) -> OutputReply {
    let mut data = BTreeMap::new();
    data.entry(EntityId::new(eid))
        .or_insert_with(BTreeMap::new)
        .insert(attr.to_owned(), value);
    OutputReply { time: None, data }
}

/// Time-based counter: steps every `step_size`, its output is the
/// number of steps taken so far. Model `Node`, attrs `val_out` /
/// `val_in`.
pub struct CounterSim {
    pub step_size: u64,
    count: i64,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl CounterSim {
    pub fn new(step_size: u64, recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            step_size,
            count: 0,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for CounterSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(meta("time-based", "Node", &["val_out", "val_in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        self.count += 1;
        Ok(Some(time + self.step_size))
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(single_output("node0", "val_out", SimValue::json(self.count)))
    }
}

/// Event-based simulator driven by a script: at a scripted step time
/// it emits `ev_out` with an explicit (usually future) output time.
/// Model `Agent`, attrs `ev_out` / `ev_in`, all triggering.
pub struct EventSim {
    script: BTreeMap<u64, (i64, u64)>,
    last_step: Option<u64>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl EventSim {
    pub fn new(script: &[(u64, (i64, u64))], recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            script: script.iter().cloned().collect(),
            last_step: None,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for EventSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(meta("event-based", "Agent", &["ev_out", "ev_in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        self.last_step = Some(time);
        Ok(None)
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        let last = self.last_step.expect("get_data before the first step");
        Ok(match self.script.get(&last) {
            Some(&(value, out_time)) => {
                let mut reply = single_output("agent0", "ev_out", SimValue::json(value));
                reply.time = Some(out_time);
                reply
            }
            None => OutputReply::default(),
        })
    }
}

/// One half of a same-time loop. Emits `out` twice per outer tick,
/// then stops emitting and schedules the next tick. Event-based,
/// model `Loop`, attrs `out` / `in`.
pub struct LoopSim {
    iterations: u32,
    last_time: Option<u64>,
    iter: u32,
    emit: Option<i64>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl LoopSim {
    pub fn new(iterations: u32, recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            iterations,
            last_time: None,
            iter: 0,
            emit: None,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for LoopSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(meta("event-based", "Loop", &["out", "in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        if self.last_time == Some(time) {
            self.iter += 1;
        } else {
            self.last_time = Some(time);
            self.iter = 0;
        }
        if self.iter < self.iterations {
            self.emit = Some(self.iter as i64);
            Ok(None)
        } else {
            // loop finished for this tick
            self.emit = None;
            Ok(Some(time + 1))
        }
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(match self.emit {
            Some(value) => single_output("loop0", "out", SimValue::json(value)),
            None => OutputReply::default(),
        })
    }
}

/// The other half of a same-time loop: echoes whatever arrives.
/// Event-based, model `Echo`, attrs `out` / `in`.
pub struct EchoSim {
    received: Option<SimValue>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl EchoSim {
    pub fn new(recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            received: None,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for EchoSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(meta("event-based", "Echo", &["out", "in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        self.received = inputs
            .values()
            .flat_map(|attrs| attrs.values())
            .flat_map(|sources| sources.values())
            .next()
            .cloned();
        Ok(None)
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(match &self.received {
            Some(value) => single_output("echo0", "out", value.clone()),
            None => OutputReply::default(),
        })
    }
}

/// Time-based simulator whose output is an in-process object that
/// cannot be serialized to JSON.
pub struct OpaqueSim {
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl OpaqueSim {
    pub fn new(recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for OpaqueSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(meta("time-based", "Node", &["val_out"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        Ok(Some(time + 1))
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        // fine between local simulators, never encodable for a remote
        // one
        Ok(single_output(
            "node0",
            "val_out",
            SimValue::opaque(|x: i64| x * 2),
        ))
    }
}

/// Time-based controller exercising the asynchronous callbacks: every
/// step it pulls `val_out` from `source` via `get_data` and pushes it
/// into `target.val_in` via `set_data`. Model `Ctrl`.
pub struct ControllerSim {
    source: String,
    target: String,
    link: Option<LinkHandle>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl ControllerSim {
    pub fn new(source: &str, target: &str, recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            source: source.to_owned(),
            target: target.to_owned(),
            link: None,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for ControllerSim {
    async fn init(
        &mut self,
        link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.link = Some(link);
        self.sid = Some(sid);
        Ok(meta("time-based", "Ctrl", &["ctl_in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        let link = self.link.as_ref().unwrap();

        let source = tandem_types::FullId::parse(&self.source).unwrap();
        let mut request = BTreeMap::new();
        request.insert(source.clone(), vec!["val_out".to_owned()]);
        let data = link.get_data(request).await?;
        let value = data
            .get(&source)
            .and_then(|attrs| attrs.get("val_out"))
            .cloned()
            .unwrap_or(SimValue::json(Value::Null));

        let mut push = BTreeMap::new();
        let mut attrs = BTreeMap::new();
        attrs.insert("val_in".to_owned(), value);
        push.insert(tandem_types::FullId::parse(&self.target).unwrap(), attrs);
        link.set_data(push).await?;
        Ok(Some(time + 1))
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(OutputReply::default())
    }
}

/// Event-based simulator that reschedules itself through `set_event`.
pub struct SelfScheduler {
    pub times: Vec<u64>,
    link: Option<LinkHandle>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

impl SelfScheduler {
    /// After a step at `times[i]`, asks the orchestrator for an
    /// external event at `times[i + 1]`.
    pub fn new(times: Vec<u64>, recorder: Arc<Recorder>) -> Box<Self> {
        Box::new(Self {
            times,
            link: None,
            sid: None,
            recorder,
        })
    }
}

#[async_trait]
impl ApiSimulator for SelfScheduler {
    async fn init(
        &mut self,
        link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.link = Some(link);
        self.sid = Some(sid);
        Ok(meta("event-based", "Agent", &["ev_out", "ev_in"]))
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok(entities(num, model))
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        let next = self.times.iter().find(|&&t| t > time).copied();
        if let Some(next) = next {
            self.link.as_ref().unwrap().set_event(next).await?;
        }
        Ok(None)
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(OutputReply::default())
    }
}
