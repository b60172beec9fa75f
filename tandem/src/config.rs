//! Run configuration.

use std::time::Duration;

/// Tunables for [`World::run`](crate::World::run).
///
/// The defaults match the common case: no real-time pacing, lazy
/// stepping on, a generous same-time-loop bound, and a short grace
/// period for shutting simulators down.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Wallclock seconds per unit of simulation time. `None` runs as
    /// fast as possible.
    pub rt_factor: Option<f64>,
    /// Abort when the run falls behind the real-time factor instead of
    /// warning.
    pub rt_strict: bool,
    /// Keep producers from running arbitrarily far ahead of their
    /// consumers.
    pub lazy_stepping: bool,
    /// How many same-time iterations a loop may make before the run is
    /// aborted as non-converging.
    pub max_loop_iterations: u32,
    /// Grace period per simulator during shutdown.
    pub stop_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rt_factor: None,
            rt_strict: false,
            lazy_stepping: true,
            max_loop_iterations: 100,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl RunConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pace the run at `factor` wallclock seconds per time unit. The
    /// factor must be strictly positive; it is checked when the run
    /// starts.
    pub fn with_rt_factor(mut self, factor: f64) -> Self {
        self.rt_factor = Some(factor);
        self
    }

    /// Abort instead of warning when the run falls behind wallclock.
    pub fn with_rt_strict(mut self, strict: bool) -> Self {
        self.rt_strict = strict;
        self
    }

    /// Enable or disable lazy stepping.
    pub fn with_lazy_stepping(mut self, lazy: bool) -> Self {
        self.lazy_stepping = lazy;
        self
    }

    /// Bound same-time loops to `n` iterations.
    pub fn with_max_loop_iterations(mut self, n: u32) -> Self {
        self.max_loop_iterations = n;
        self
    }

    /// Grace period per simulator during shutdown.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}
