//! Failure semantics: errors abort the run, name the offender, and
//! still shut everything down.

mod support;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use support::*;
use tandem::{ConnectOptions, RunConfig, RunError, World};
use tandem_proxy::{ApiSimulator, LinkHandle, SimError};
use tandem_types::{
    EntityDesc, FullId, InputData, OutputReply, OutputRequest, RawMeta, SimId, SimulationError,
};

/// Steps fine until `fail_at`, then errors. Records whether it was
/// stopped.
struct FailingSim {
    fail_at: u64,
    stopped: Arc<AtomicBool>,
    sid: Option<SimId>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ApiSimulator for FailingSim {
    async fn init(
        &mut self,
        _link: LinkHandle,
        sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        self.sid = Some(sid);
        Ok(serde_json::from_value(serde_json::json!({
            "api_version": "3.0",
            "type": "time-based",
            "models": {"Node": {"public": true, "params": [], "attrs": ["val_out", "val_in"]}},
        }))?)
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok((0..num)
            .map(|i| EntityDesc {
                eid: format!("node{i}").into(),
                model: model.to_owned(),
                rel: vec![],
                children: vec![],
            })
            .collect())
    }

    async fn step(
        &mut self,
        time: u64,
        inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        self.recorder
            .record(self.sid.as_ref().unwrap(), time, &inputs);
        if time >= self.fail_at {
            return Err("pump pressure out of range".into());
        }
        Ok(Some(time + 1))
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(OutputReply::default())
    }

    async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn a_step_error_aborts_the_run_and_stops_everyone() {
    let rec = Recorder::new();
    let stopped = Arc::new(AtomicBool::new(false));
    let world = World::new(RunConfig::default());
    let bad = world
        .start_local(
            "Bad",
            Box::new(FailingSim {
                fail_at: 2,
                stopped: stopped.clone(),
                sid: None,
                recorder: rec.clone(),
            }),
            Map::new(),
        )
        .await
        .unwrap();
    let sink = world
        .start_local("Sink", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&bad, 1, "Node", Map::new()).await.unwrap();
    world.create(&sink, 1, "Node", Map::new()).await.unwrap();
    world
        .connect(
            FullId::new(bad.clone(), "node0"),
            FullId::new(sink.clone(), "node0"),
            &[("val_out", "val_in")],
            ConnectOptions::new(),
        )
        .unwrap();

    let err = world.run(10).await.unwrap_err();
    let (sid, message) = match err {
        RunError::Simulation(SimulationError::Request { sid, message, .. }) => (sid, message),
        other => panic!("expected a request failure, got {other}"),
    };
    assert_eq!(sid, SimId::new("Bad-0"));
    assert!(message.contains("pump pressure"), "{message}");

    assert_eq!(rec.steps_of("Bad-0"), vec![0, 1, 2]);
    assert!(
        stopped.load(Ordering::SeqCst),
        "the failing simulator must still be stopped"
    );
}

/// A simulator returning a next step that is not in the future.
struct BadNextStep;

#[async_trait]
impl ApiSimulator for BadNextStep {
    async fn init(
        &mut self,
        _link: LinkHandle,
        _sid: SimId,
        _time_resolution: f64,
        _params: Map<String, Value>,
    ) -> Result<RawMeta, SimError> {
        Ok(serde_json::from_value(serde_json::json!({
            "api_version": "3.0",
            "type": "time-based",
            "models": {"Node": {"public": true, "params": [], "attrs": []}},
        }))?)
    }

    async fn create(
        &mut self,
        num: usize,
        model: &str,
        _params: Map<String, Value>,
    ) -> Result<Vec<EntityDesc>, SimError> {
        Ok((0..num)
            .map(|i| EntityDesc {
                eid: format!("node{i}").into(),
                model: model.to_owned(),
                rel: vec![],
                children: vec![],
            })
            .collect())
    }

    async fn step(
        &mut self,
        time: u64,
        _inputs: InputData,
        _max_advance: u64,
    ) -> Result<Option<u64>, SimError> {
        Ok(Some(time)) // not strictly greater
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(OutputReply::default())
    }
}

#[tokio::test]
async fn a_non_advancing_next_step_is_fatal() {
    let world = World::new(RunConfig::default());
    let bad = world
        .start_local("Bad", Box::new(BadNextStep), Map::new())
        .await
        .unwrap();
    world.create(&bad, 1, "Node", Map::new()).await.unwrap();

    let err = world.run(5).await.unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Simulation(SimulationError::InvalidNextStep { .. })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn runaway_same_time_loops_hit_the_bound() {
    let rec = Recorder::new();
    // a loop that never stops emitting per tick
    let world = World::new(RunConfig::default().with_max_loop_iterations(10));
    let looper = world
        .start_local("Loop", LoopSim::new(u32::MAX, rec.clone()), Map::new())
        .await
        .unwrap();
    let echo = world
        .start_local("Echo", EchoSim::new(rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&looper, 1, "Loop", Map::new()).await.unwrap();
    world.create(&echo, 1, "Echo", Map::new()).await.unwrap();
    world
        .connect(
            FullId::new(looper.clone(), "loop0"),
            FullId::new(echo.clone(), "echo0"),
            &[("out", "in")],
            ConnectOptions::new(),
        )
        .unwrap();
    world
        .connect(
            FullId::new(echo.clone(), "echo0"),
            FullId::new(looper.clone(), "loop0"),
            &[("out", "in")],
            ConnectOptions::new().weak(),
        )
        .unwrap();
    world.group(&[looper.clone(), echo.clone()]).unwrap();
    world.set_initial_event(&looper, 0).unwrap();

    let err = world.run(2).await.unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Simulation(SimulationError::LoopBound { iterations: 10, .. })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn weak_connections_outside_a_group_are_rejected() {
    let rec = Recorder::new();
    let world = World::new(RunConfig::default());
    let a = world
        .start_local("A", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    let b = world
        .start_local("B", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&a, 1, "Node", Map::new()).await.unwrap();
    world.create(&b, 1, "Node", Map::new()).await.unwrap();
    world
        .connect(
            FullId::new(a.clone(), "node0"),
            FullId::new(b.clone(), "node0"),
            &[("val_out", "val_in")],
            ConnectOptions::new().weak(),
        )
        .unwrap();

    let err = world.run(2).await.unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Config(tandem_types::ConfigError::WeakEdgeOutsideGroup { .. })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn connecting_unknown_attributes_fails_immediately() {
    let rec = Recorder::new();
    let world = World::new(RunConfig::default());
    let a = world
        .start_local("A", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    let b = world
        .start_local("B", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&a, 1, "Node", Map::new()).await.unwrap();
    world.create(&b, 1, "Node", Map::new()).await.unwrap();

    let err = world
        .connect(
            FullId::new(a.clone(), "node0"),
            FullId::new(b.clone(), "node0"),
            &[("no_such_attr", "val_in")],
            ConnectOptions::new(),
        )
        .unwrap_err();
    assert!(
        matches!(err, tandem_types::ConfigError::UnknownAttr { ref attr, .. } if attr == "no_such_attr"),
        "{err}"
    );
}
