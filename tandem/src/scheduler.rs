//! The cooperative scheduler: one task per simulator.
//!
//! Each task loops through the same states: wait for a queued step,
//! wait until every dependency can feed that step, gather inputs, step
//! the simulator, publish its outputs to the successors and advance
//! its progress. A global deadlock check runs whenever a task starts
//! waiting; it wakes the most senior blocked simulator when nothing
//! else can move, which is how weak edges make same-time loops
//! progress.

use crate::node::{SimNode, TaskPhase};
use crate::world::RunState;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tandem_types::{InputData, SimulationError, TieredTime, merge_inputs};

/// Run one simulator to completion. Returns the error that aborted the
/// run, if this simulator caused one.
pub(crate) async fn sim_task(run: Arc<RunState>, node: Arc<SimNode>) -> Result<(), SimulationError> {
    let result = drive(&run, &node).await;
    match &result {
        Ok(()) => {
            node.set_phase(TaskPhase::Done);
            // a finished simulator can no longer publish anything new
            node.progress
                .set(TieredTime::from_base(u64::MAX, node.depth));
            tracing::debug!(sid = %node.sid, "simulator finished");
        }
        Err(e) => {
            node.set_phase(TaskPhase::Failed);
            tracing::error!(sid = %node.sid, error = %e, "simulator failed");
        }
    }
    // neighbors re-check their termination conditions
    for other in &run.nodes {
        other.schedule.wake();
    }
    check_deadlock(&run);
    result
}

async fn drive(run: &Arc<RunState>, node: &Arc<SimNode>) -> Result<(), SimulationError> {
    let until = run.until_for(node);

    'main: loop {
        if run.cancel.is_cancelled() || run.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        if node.progress.value() >= until {
            return Ok(());
        }
        if !run.graph.succs[node.index].is_empty()
            && run.graph.succs[node.index]
                .iter()
                .all(|&ei| run.nodes[run.graph.edges[ei].dst].is_finished())
        {
            // nobody left to feed
            return Ok(());
        }

        // IDLE_WAIT_STEP
        let t = match node.schedule.next_after(&node.progress.value()) {
            Some(t) if t < until => t,
            _ => {
                if self_stepper_exhausted(run, node) && !rt_still_waiting(run) {
                    return Ok(());
                }
                node.set_phase(TaskPhase::WaitStep);
                check_deadlock(run);
                tokio::select! {
                    _ = node.schedule.step_queued() => {}
                    _ = run.cancel.cancelled() => return Ok(()),
                }
                continue 'main;
            }
        };

        // WAIT_DEPS
        let Some(t) = wait_for_dependencies(run, node, t).await else {
            return Ok(());
        };
        node.set_phase(TaskPhase::Active);

        // GATHER_INPUT
        let inputs = gather_inputs(run, node, &t);

        rt_pace(run, node, &t).await?;

        // STEPPING
        execute_step(run, node, &t, inputs).await?;

        // PUBLISHING + NOTIFY
        publish_outputs(run, node, &t).await?;

        tracing::trace!(
            sid = %node.sid,
            time = %t,
            progress = %format_args!("{:.2}%", world_percent(run)),
            "step complete"
        );
    }
}

/// A simulator with no predecessors stops once it has neither a queued
/// step nor a pending self-step.
fn self_stepper_exhausted(run: &RunState, node: &SimNode) -> bool {
    run.graph.preds[node.index].is_empty()
        && node.schedule.is_empty()
        && node
            .next_self_step
            .lock()
            .expect("next step poisoned")
            .is_none()
}

/// Under real-time pacing the world stays open for external events
/// until the wallclock horizon has passed.
fn rt_still_waiting(run: &RunState) -> bool {
    match run.config.rt_factor {
        Some(factor) => run.started.elapsed().as_secs_f64() < factor * run.until as f64,
        None => false,
    }
}

enum DepCondition {
    /// Data along this edge can still arrive at or before the step.
    Arrival { edge: usize },
    /// Lazy or async-request pacing on a successor.
    Lazy { succ: usize },
}

/// Wait until every dependency of the step at `t` is satisfied, the
/// deadlock resolver releases this simulator, or the run is cancelled
/// (`None`). An earlier queued step re-evaluates the wait.
async fn wait_for_dependencies(
    run: &Arc<RunState>,
    node: &Arc<SimNode>,
    mut t: TieredTime,
) -> Option<TieredTime> {
    loop {
        node.schedule.clear_release();

        let mut unmet: Vec<DepCondition> = Vec::new();
        for &ei in &run.graph.preds[node.index] {
            let edge = &run.graph.edges[ei];
            if edge.src == node.index {
                continue;
            }
            let pred = &run.nodes[edge.src];
            if !pred.progress.arrival_is_after(&edge.interval, &t) {
                unmet.push(DepCondition::Arrival { edge: ei });
            }
        }
        for &ei in &run.graph.succs[node.index] {
            let edge = &run.graph.edges[ei];
            if edge.dst == node.index {
                continue;
            }
            if !(run.config.lazy_stepping || edge.async_requests) {
                continue;
            }
            let succ = &run.nodes[edge.dst];
            if succ.progress.value() < t.project(succ.depth) {
                unmet.push(DepCondition::Lazy { succ: edge.dst });
            }
        }

        if unmet.is_empty() {
            return Some(t);
        }

        let futures: Vec<BoxFuture<'_, ()>> = unmet
            .iter()
            .map(|cond| match cond {
                DepCondition::Arrival { edge } => {
                    let edge = &run.graph.edges[*edge];
                    let pred = &run.nodes[edge.src];
                    pred.progress
                        .arrival_after(edge.interval.clone(), t.clone())
                        .boxed()
                }
                DepCondition::Lazy { succ } => {
                    let succ = &run.nodes[*succ];
                    succ.progress.has_reached(t.project(succ.depth)).boxed()
                }
            })
            .collect();

        node.set_phase(TaskPhase::WaitDeps(t.clone()));
        check_deadlock(run);

        tokio::select! {
            _ = futures::future::join_all(futures) => return Some(t),
            _ = node.schedule.released() => {
                tracing::debug!(sid = %node.sid, time = %t, "released by deadlock resolution");
                return Some(t);
            }
            _ = node.schedule.earlier_step() => {
                if let Some(earlier) = node.schedule.next_after(&node.progress.value()) {
                    if earlier < t {
                        tracing::debug!(sid = %node.sid, from = %t, to = %earlier, "earlier step");
                        t = earlier;
                    }
                }
                continue;
            }
            _ = run.cancel.cancelled() => return None,
        }
    }
}

/// The deadlock detector. Runs whenever a task starts waiting or
/// finishes; a no-op while anything is still active.
///
/// When every simulator is either idle without a runnable step or
/// blocked on dependencies, the blocked simulator with the smallest
/// `(rank, next step, sid)` is released past its wait — that breaks
/// the weakest link of the cycle deterministically. When nothing is
/// blocked either, the run has drained and every task is told to
/// finish.
pub(crate) fn check_deadlock(run: &RunState) {
    let mut candidates: Vec<(usize, TieredTime, tandem_types::SimId, usize)> = Vec::new();
    let mut any_idle = false;
    for node in &run.nodes {
        match node.phase() {
            TaskPhase::Starting | TaskPhase::Active => return,
            TaskPhase::WaitStep => {
                let until = run.until_for(node);
                if node
                    .schedule
                    .next_after(&node.progress.value())
                    .is_some_and(|t| t < until)
                {
                    // it will wake on its own
                    return;
                }
                any_idle = true;
            }
            TaskPhase::WaitDeps(t) => {
                candidates.push((node.rank, t, node.sid.clone(), node.index));
            }
            TaskPhase::Done | TaskPhase::Failed => {}
        }
    }

    match candidates.iter().min() {
        Some((rank, t, sid, index)) => {
            tracing::debug!(sid = %sid, rank = *rank, time = %t, "deadlock: releasing");
            run.nodes[*index].schedule.release();
        }
        None if any_idle => {
            tracing::debug!("no simulator has a queued step; finishing the run");
            run.terminated.store(true, Ordering::SeqCst);
            for node in &run.nodes {
                node.schedule.wake();
            }
        }
        None => {}
    }
}

/// Compose the inputs for the step at `t`: cache reads for non-trigger
/// attributes, then persistent memory, queued events, and finally any
/// asynchronously pushed data.
fn gather_inputs(run: &RunState, node: &SimNode, t: &TieredTime) -> InputData {
    let mut inputs = InputData::new();

    for &ei in &run.graph.preds[node.index] {
        let edge = &run.graph.edges[ei];
        let pred = &run.nodes[edge.src];
        let query = if edge.shift > 0 {
            t.rewind(edge.shift).map(|q| q.project(pred.depth))
        } else {
            Some(t.project(pred.depth))
        };

        let mut pred_outputs = pred.outputs.lock().expect("outputs poisoned");
        let mut marks = node.read_marks.lock().expect("read marks poisoned");
        for flow in &edge.flows {
            let src_full = pred.full_id(&flow.src_eid);
            for pair in flow.pairs.iter().filter(|p| !p.trigger) {
                let cached = query.as_ref().and_then(|q| {
                    pred_outputs
                        .get_mut(&(flow.src_eid.clone(), pair.src.clone()))
                        .and_then(|cache| cache.get_with_time(q))
                        .map(|(vt, v)| (vt.clone(), v.clone()))
                });
                let value = match cached {
                    Some((written_at, value)) => {
                        if pair.persistent {
                            Some(value)
                        } else {
                            // transient values are handed out once
                            let key = (
                                ei,
                                flow.src_eid.clone(),
                                pair.src.clone(),
                                flow.dst_eid.clone(),
                                pair.dst.clone(),
                            );
                            if marks.get(&key) == Some(&written_at) {
                                None
                            } else {
                                marks.insert(key, written_at);
                                Some(value)
                            }
                        }
                    }
                    None => edge.initial.get(&pair.src).cloned(),
                };
                if let Some(value) = value {
                    inputs
                        .entry(flow.dst_eid.clone())
                        .or_default()
                        .entry(pair.dst.clone())
                        .or_default()
                        .insert(src_full.clone(), value);
                }
            }
        }
    }

    let persistent = node
        .persistent_input
        .lock()
        .expect("persistent buffer poisoned")
        .drain(t);
    merge_inputs(&mut inputs, persistent);

    let timed = node
        .timed_input
        .lock()
        .expect("timed buffer poisoned")
        .drain(t);
    merge_inputs(&mut inputs, timed);

    let pushed = std::mem::take(&mut *node.async_input.lock().expect("async input poisoned"));
    merge_inputs(&mut inputs, pushed);

    inputs
}

/// Sleep out the wallclock when pacing is on; complain (or abort)
/// when the run has fallen behind it.
async fn rt_pace(run: &RunState, node: &SimNode, t: &TieredTime) -> Result<(), SimulationError> {
    let Some(factor) = run.config.rt_factor else {
        return Ok(());
    };
    let target = factor * t.time() as f64;
    let elapsed = run.started.elapsed().as_secs_f64();
    if elapsed > target {
        let behind = elapsed - target;
        if run.config.rt_strict {
            return Err(SimulationError::RealTimeOverrun {
                sid: node.sid.clone(),
                rt_factor: factor,
                behind,
            });
        }
        tracing::warn!(
            sid = %node.sid,
            rt_factor = factor,
            behind = %format_args!("{behind:.3}s"),
            "simulation too slow for real-time factor"
        );
    } else {
        tokio::time::sleep(Duration::from_secs_f64(target - elapsed)).await;
    }
    Ok(())
}

/// Call `step`, validate its return and queue the requested self-step.
async fn execute_step(
    run: &RunState,
    node: &SimNode,
    t: &TieredTime,
    inputs: InputData,
) -> Result<(), SimulationError> {
    {
        let mut count = node.loop_count.lock().expect("loop count poisoned");
        if t.is_microstep() {
            *count += 1;
            if *count > run.config.max_loop_iterations {
                return Err(SimulationError::LoopBound {
                    sid: node.sid.clone(),
                    iterations: run.config.max_loop_iterations,
                });
            }
        } else {
            *count = 0;
        }
    }

    let max_advance = compute_max_advance(run, node, t);
    tracing::debug!(sid = %node.sid, time = %t, max_advance, "stepping");

    *node.last_step.lock().expect("last step poisoned") = Some(t.clone());
    let next = node.proxy.step(t.time(), inputs, max_advance).await?;
    node.schedule.consume_through(t);
    *node.next_self_step.lock().expect("next step poisoned") = next;

    if let Some(next) = next {
        // an event-based simulator inside a running same-time loop may
        // not plan past the point where the loop could feed it again
        let self_triggering = node.kind == tandem_types::SimulatorKind::EventBased
            && *node.loop_count.lock().expect("loop count poisoned") > 0;
        if self_triggering && next > max_advance {
            return Err(SimulationError::InvalidNextStep {
                sid: node.sid.clone(),
                reason: format!("next step {next} exceeds max advance {max_advance}"),
            });
        }
        node.schedule
            .push(TieredTime::from_base(next, node.depth));
    }
    Ok(())
}

/// The earliest time any triggering predecessor could still deliver
/// into this simulator, capped by the horizon.
fn compute_max_advance(run: &RunState, node: &SimNode, t: &TieredTime) -> u64 {
    let mut max_advance = run.until;
    for &ei in &run.graph.preds[node.index] {
        let edge = &run.graph.edges[ei];
        if edge.src == node.index || !edge.has_trigger() {
            continue;
        }
        let pred = &run.nodes[edge.src];
        let progress = pred.progress.value();
        let earliest_step = pred
            .schedule
            .next_after(&progress)
            .unwrap_or(progress);
        let arrival = earliest_step.plus(&edge.interval);
        max_advance = max_advance.min(arrival.time());
    }
    max_advance.max(t.time())
}

/// Fetch the step's outputs, distribute them along the outgoing edges
/// and advance this simulator's progress.
async fn publish_outputs(
    run: &RunState,
    node: &SimNode,
    t: &TieredTime,
) -> Result<(), SimulationError> {
    let reply = if node.output_request.is_empty() {
        Default::default()
    } else {
        node.proxy.get_data(&node.output_request).await?
    };

    let out_time = match reply.time {
        Some(ts) if ts < t.time() => {
            return Err(SimulationError::MalformedReply {
                sid: node.sid.clone(),
                method: "get_data".into(),
                reason: format!("output time {ts} lies before the step at {t}"),
            });
        }
        Some(ts) if ts > t.time() => TieredTime::from_base(ts, node.depth),
        _ => t.clone(),
    };

    // inside a same-time loop the later microsteps refine the value
    let allow_overwrite = t.is_microstep();
    {
        let mut outputs = node.outputs.lock().expect("outputs poisoned");
        for (eid, attrs) in &reply.data {
            for (attr, value) in attrs {
                outputs
                    .entry((eid.clone(), attr.clone()))
                    .or_default()
                    .add(out_time.clone(), value.clone(), allow_overwrite)
                    .map_err(|e| SimulationError::MalformedReply {
                        sid: node.sid.clone(),
                        method: "get_data".into(),
                        reason: e.to_string(),
                    })?;
            }
        }
    }

    for &ei in &run.graph.succs[node.index] {
        let edge = &run.graph.edges[ei];
        let dest = &run.nodes[edge.dst];
        let arrival = out_time.plus(&edge.interval);
        let mut delivered = false;

        for flow in &edge.flows {
            let src_full = node.full_id(&flow.src_eid);
            for pair in flow.pairs.iter().filter(|p| p.trigger) {
                let Some(value) = reply
                    .data
                    .get(&flow.src_eid)
                    .and_then(|attrs| attrs.get(&pair.src))
                else {
                    continue;
                };
                let delivery = crate::buffers::QueuedDelivery {
                    time: arrival.clone(),
                    src: src_full.clone(),
                    dst_eid: flow.dst_eid.clone(),
                    dst_attr: pair.dst.clone(),
                    value: value.clone(),
                };
                if pair.persistent {
                    dest.persistent_input
                        .lock()
                        .expect("persistent buffer poisoned")
                        .add(delivery);
                } else {
                    dest.timed_input
                        .lock()
                        .expect("timed buffer poisoned")
                        .add(delivery);
                }
                delivered = true;
            }
        }

        if delivered {
            dest.schedule.push(arrival.clone());
            let phase = dest.phase();
            if let TaskPhase::WaitDeps(next) = phase {
                if arrival < next && arrival >= dest.progress.value() {
                    dest.schedule.interrupt();
                }
            }
        }
    }

    let new_progress = compute_progress(run, node, t);
    node.progress.set(new_progress);
    prune_outputs(run, node);
    Ok(())
}

/// The earliest time this simulator could still step at: its next
/// queued step or the earliest arrival a triggering predecessor could
/// still produce — and strictly after the step just executed.
fn compute_progress(run: &RunState, node: &SimNode, t: &TieredTime) -> TieredTime {
    let floor = t.successor();
    let mut earliest: Option<TieredTime> = node.schedule.next_after(&floor);
    for &ei in &run.graph.preds[node.index] {
        let edge = &run.graph.edges[ei];
        if edge.src == node.index || !edge.has_trigger() {
            continue;
        }
        let pred = &run.nodes[edge.src];
        let arrival = pred.progress.value().plus(&edge.interval).max(floor.clone());
        earliest = Some(match earliest {
            Some(e) => e.min(arrival),
            None => arrival,
        });
    }
    earliest.unwrap_or(floor)
}

/// Drop cached outputs every consumer has moved past.
fn prune_outputs(run: &RunState, node: &SimNode) {
    let mut horizon: Option<TieredTime> = None;
    for &ei in &run.graph.succs[node.index] {
        let edge = &run.graph.edges[ei];
        let consumer = &run.nodes[edge.dst];
        let last = consumer.last_step.lock().expect("last step poisoned").clone();
        let Some(last) = last else {
            return; // a consumer that never stepped may still read anything
        };
        let Some(reach) = last.rewind(edge.shift) else {
            return;
        };
        let reach = reach.project(node.depth);
        horizon = Some(match horizon {
            Some(h) => h.min(reach),
            None => reach,
        });
    }
    if let Some(horizon) = horizon {
        let mut outputs = node.outputs.lock().expect("outputs poisoned");
        for cache in outputs.values_mut() {
            cache.prune(&horizon);
        }
    }
}

/// Mean progress over all simulators, in percent of the horizon.
pub(crate) fn world_percent(run: &RunState) -> f64 {
    if run.nodes.is_empty() || run.until == 0 {
        return 100.0;
    }
    let sum: f64 = run
        .nodes
        .iter()
        .map(|n| n.progress.value().time().min(run.until) as f64)
        .sum();
    sum * 100.0 / (run.until as f64 * run.nodes.len() as f64)
}
