//! Per-simulator progress with awaitable predicates.

use std::sync::Mutex;
use tandem_types::{TieredInterval, TieredTime};
use tokio::sync::oneshot;

/// A condition on a progress value.
#[derive(Debug, Clone)]
enum WaitCond {
    /// Progress `≥ t`.
    Reached(TieredTime),
    /// Progress `> t`.
    Passed(TieredTime),
    /// The earliest data that can still travel along `interval`
    /// arrives strictly after `t` in the destination frame:
    /// `progress + interval > t`. Outputs are final strictly below the
    /// progress, so this is exactly "data for `t` cannot change
    /// anymore".
    Arrival {
        interval: TieredInterval,
        t: TieredTime,
    },
}

impl WaitCond {
    fn satisfied(&self, value: &TieredTime) -> bool {
        match self {
            WaitCond::Reached(t) => value >= t,
            WaitCond::Passed(t) => value > t,
            WaitCond::Arrival { interval, t } => value.plus(interval) > *t,
        }
    }
}

struct Inner {
    value: TieredTime,
    waiters: Vec<(WaitCond, oneshot::Sender<()>)>,
}

/// A simulator's guaranteed-published-up-to-here time.
///
/// Monotonically advanced by the owning task; anyone may wait for it
/// to reach or pass a value. Every [`set`](Progress::set) wakes the
/// waiters whose condition now holds. Waiters whose future was dropped
/// are discarded on the next advance.
pub struct Progress {
    inner: Mutex<Inner>,
}

impl Progress {
    /// A progress starting at `initial`.
    pub fn new(initial: TieredTime) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: initial,
                waiters: Vec::new(),
            }),
        }
    }

    /// The current value.
    pub fn value(&self) -> TieredTime {
        self.inner.lock().expect("progress poisoned").value.clone()
    }

    /// Advance to `value` and wake every satisfied waiter. Progress
    /// never moves backwards; the scheduler only ever computes
    /// non-decreasing values.
    pub fn set(&self, value: TieredTime) {
        let fire = {
            let mut inner = self.inner.lock().expect("progress poisoned");
            assert!(value >= inner.value, "progress cannot move backwards");
            inner.value = value.clone();
            let waiters = std::mem::take(&mut inner.waiters);
            let mut fire = Vec::new();
            for (cond, tx) in waiters {
                if tx.is_closed() {
                    continue;
                }
                if cond.satisfied(&value) {
                    fire.push(tx);
                } else {
                    inner.waiters.push((cond, tx));
                }
            }
            fire
        };
        for tx in fire {
            let _ = tx.send(());
        }
    }

    async fn wait(&self, cond: WaitCond) {
        let rx = {
            let mut inner = self.inner.lock().expect("progress poisoned");
            if cond.satisfied(&inner.value) {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((cond, tx));
            rx
        };
        // a dropped sender means the owner shut down; waking the
        // waiter lets it observe that through the world state
        let _ = rx.await;
    }

    /// Wait until the progress has reached (or passed) `t`.
    pub async fn has_reached(&self, t: TieredTime) {
        self.wait(WaitCond::Reached(t)).await;
    }

    /// Wait until the progress has passed `t`.
    pub async fn has_passed(&self, t: TieredTime) {
        self.wait(WaitCond::Passed(t)).await;
    }

    /// Wait until no data travelling along `interval` can arrive at or
    /// before `t` anymore.
    pub async fn arrival_after(&self, interval: TieredInterval, t: TieredTime) {
        self.wait(WaitCond::Arrival { interval, t }).await;
    }

    /// Whether the earliest possible arrival along `interval` already
    /// lies strictly after `t`.
    pub fn arrival_is_after(&self, interval: &TieredInterval, t: &TieredTime) -> bool {
        WaitCond::Arrival {
            interval: interval.clone(),
            t: t.clone(),
        }
        .satisfied(&self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn t(base: u64) -> TieredTime {
        TieredTime::from_base(base, 1)
    }

    #[tokio::test]
    async fn reached_returns_immediately_when_satisfied() {
        let p = Progress::new(t(5));
        p.has_reached(t(5)).await;
        p.has_reached(t(3)).await;
    }

    #[tokio::test]
    async fn waiters_wake_on_advance() {
        let p = Arc::new(Progress::new(t(0)));
        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                p.has_passed(t(2)).await;
                p.value()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.set(t(2)); // reached, not passed
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "has_passed(2) must outwait set(2)");
        p.set(t(3));
        assert_eq!(waiter.await.unwrap(), t(3));
    }

    #[tokio::test]
    async fn arrival_condition_translates_frames() {
        // a producer inside a group (two tiers) feeding a plain
        // consumer: its whole same-time loop must finish first
        let p = Progress::new(TieredTime::new(vec![5, 1]));
        let out = TieredInterval::identity(2, 1);
        assert!(!p.arrival_is_after(&out, &t(5)));
        p.set(TieredTime::new(vec![6, 0]));
        assert!(p.arrival_is_after(&out, &t(5)));
    }

    #[test]
    #[should_panic(expected = "backwards")]
    fn progress_is_monotone() {
        let p = Progress::new(t(5));
        p.set(t(4));
    }
}
