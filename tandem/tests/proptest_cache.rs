//! Property-based tests: the output cache never rewrites read history.

use proptest::prelude::*;
use tandem::OutputCache;
use tandem_types::{SimValue, TieredTime};

#[derive(Debug, Clone)]
enum Op {
    Add(u64, i64),
    Get(u64),
    Prune(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..20, any::<i64>()).prop_map(|(t, v)| Op::Add(t, v)),
        (0u64..20).prop_map(Op::Get),
        (0u64..20).prop_map(Op::Prune),
    ]
}

fn t(base: u64) -> TieredTime {
    TieredTime::from_base(base, 1)
}

proptest! {
    /// Once a value has been handed out, no accepted write may change
    /// what earlier reads observed: replaying any read from the log
    /// still yields the same stored time.
    #[test]
    fn reads_are_stable_under_later_writes(ops in proptest::collection::vec(arb_op(), 1..60)) {
        let mut cache = OutputCache::new();
        let mut observed: Vec<(u64, TieredTime)> = Vec::new();
        let mut pruned_to: Option<u64> = None;

        for op in ops {
            match op {
                Op::Add(time, value) => {
                    // failures are fine; accepted writes must not
                    // violate what was already read
                    let _ = cache.add(t(time), SimValue::json(value), false);
                }
                Op::Get(time) => {
                    if let Some((stored, _)) = cache.get_with_time(&t(time)) {
                        observed.push((time, stored.clone()));
                    }
                }
                Op::Prune(time) => {
                    cache.prune(&t(time));
                    pruned_to = Some(pruned_to.map_or(time, |p| p.max(time)));
                    // pruning invalidates replay below the horizon
                    observed.retain(|(q, _)| Some(*q) >= pruned_to);
                }
            }
        }

        for (query, stored_then) in observed {
            if let Some((stored_now, _)) = cache.get_with_time(&t(query)) {
                prop_assert!(
                    *stored_now >= stored_then,
                    "read at {query} moved backwards: {stored_then} -> {stored_now}"
                );
            }
        }
    }

    /// After pruning, every query at or after the horizon still
    /// resolves whenever anything at or before it was ever written.
    #[test]
    fn prune_keeps_the_horizon_covered(
        writes in proptest::collection::vec(0u64..20, 1..20),
        horizon in 0u64..20,
    ) {
        let mut cache = OutputCache::new();
        let mut max_written = None;
        for w in writes {
            if cache.add(t(w), SimValue::json(w as i64), false).is_ok() {
                max_written = Some(max_written.map_or(w, |m: u64| m.max(w)));
            }
        }
        cache.prune(&t(horizon));
        let newest_written = max_written.expect("the first write always succeeds");
        let query = horizon.max(newest_written);
        prop_assert!(cache.get(&t(query)).is_some());
    }
}
