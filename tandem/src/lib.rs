//! # tandem — a discrete-event co-simulation orchestrator
//!
//! tandem coordinates independent simulator processes so that they
//! collectively advance a shared logical clock while exchanging data
//! through a declared dataflow graph.
//!
//! | Concern | Module |
//! |---------|--------|
//! | Scenario state and `run` | [`world`] |
//! | One cooperative task per simulator | `scheduler` (internal) |
//! | Dependency graph, tiered delays | `graph` (internal) |
//! | Output caches, input buffers | [`cache`], [`buffers`] |
//! | Progress and its wait predicates | [`progress`] |
//!
//! Simulators connect through the proxies of
//! [`tandem-proxy`](tandem_proxy) — in-process or over a framed JSON
//! channel — and are described by the types of
//! [`tandem-types`](tandem_types).
//!
//! ## The scheduling model
//!
//! Every simulator is driven by one cooperative task that waits for a
//! queued step, waits until the step's inputs can no longer change,
//! gathers them, steps the simulator and publishes its outputs. Times
//! are [`TieredTime`](tandem_types::TieredTime)s: tier 0 is the real
//! clock, deeper tiers count the microsteps of same-time loops. When
//! every task is blocked, a deterministic deadlock resolver releases
//! the most senior one — that, together with *weak* edges, is what
//! makes same-time feedback loops progress instead of deadlocking.

#![deny(missing_docs)]

pub mod buffers;
pub mod cache;
pub mod config;
pub mod progress;
pub mod schedule;
pub mod world;

pub(crate) mod graph;
pub(crate) mod link;
pub(crate) mod node;
pub(crate) mod scheduler;

pub use buffers::{PersistentInputBuffer, QueuedDelivery, TimedInputBuffer};
pub use cache::{OutputCache, StaleWrite};
pub use config::RunConfig;
pub use progress::Progress;
pub use schedule::StepSchedule;
pub use world::{ConnectOptions, RunError, World};
