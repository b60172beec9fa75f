//! Real-time pacing: best-effort sleeping, strict-mode overruns.

mod support;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use support::*;
use tandem::{RunConfig, RunError, World};
use tandem_proxy::{ApiSimulator, LinkHandle, SimError};
use tandem_types::{
    EntityDesc, InputData, OutputReply, OutputRequest, RawMeta, SimId, SimulationError,
};

#[tokio::test]
async fn pacing_stretches_the_run_to_wallclock() {
    let rec = Recorder::new();
    let world = World::new(RunConfig::default().with_rt_factor(0.05));
    let a = world
        .start_local("A", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&a, 1, "Node", Map::new()).await.unwrap();

    let started = Instant::now();
    world.run(3).await.unwrap();
    // steps at 1 and 2 each wait for the wallclock
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "run finished after {:?}",
        started.elapsed()
    );
    assert_eq!(rec.steps_of("A-0"), vec![0, 1, 2]);
}

/// Burns wallclock inside `step`.
struct SlowSim {
    delay: Duration,
}

#[async_trait]
impl ApiSimulator for SlowSim {
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
        tokio::time::sleep(self.delay).await;
        Ok(Some(time + 1))
    }

    async fn get_data(&mut self, _outputs: OutputRequest) -> Result<OutputReply, SimError> {
        Ok(OutputReply::default())
    }
}

#[tokio::test]
async fn a_non_positive_rt_factor_is_rejected() {
    let rec = Recorder::new();
    let mut config = RunConfig::default();
    config.rt_factor = Some(0.0); // bypassing the setter must not help
    let world = World::new(config);
    let a = world
        .start_local("A", CounterSim::new(1, rec.clone()), Map::new())
        .await
        .unwrap();
    world.create(&a, 1, "Node", Map::new()).await.unwrap();

    let err = world.run(2).await.unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Config(tandem_types::ConfigError::InvalidRtFactor { .. })
        ),
        "{err}"
    );
    assert!(rec.steps().is_empty(), "the run must fail before stepping");
}

#[tokio::test]
async fn strict_mode_aborts_when_falling_behind() {
    let world = World::new(
        RunConfig::default()
            .with_rt_factor(0.005)
            .with_rt_strict(true),
    );
    let slow = world
        .start_local(
            "Slow",
            Box::new(SlowSim {
                delay: Duration::from_millis(100),
            }),
            Map::new(),
        )
        .await
        .unwrap();
    world.create(&slow, 1, "Node", Map::new()).await.unwrap();

    let err = world.run(5).await.unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Simulation(SimulationError::RealTimeOverrun { .. })
        ),
        "{err}"
    );
}
