//! Per-attribute output storage with causality protection.

use std::collections::BTreeMap;
use tandem_types::{SimValue, TieredTime};
use thiserror::Error;

/// A write that would rewrite history.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot add data at {time}: data from {newest} was already read")]
pub struct StaleWrite {
    /// The rejected write time.
    pub time: TieredTime,
    /// The newest time already handed out.
    pub newest: TieredTime,
}

/// Storage for one output attribute of one entity, keyed by time.
///
/// A value added at time `t` is returned for every [`get`](Self::get)
/// between `t` and the next write. Reads record the newest accessed
/// time so that later writes cannot change data a consumer has already
/// seen; overwriting the newest entry at its exact time is permitted
/// only where a same-time loop legitimately refines it.
#[derive(Debug, Default)]
pub struct OutputCache {
    entries: BTreeMap<TieredTime, SimValue>,
    newest_access: Option<TieredTime>,
}

impl OutputCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` at `time`.
    ///
    /// # Errors
    ///
    /// [`StaleWrite`] when `time` lies before the newest written or
    /// read time, or equals it while `allow_same_time_overwrite` is
    /// `false`.
    pub fn add(
        &mut self,
        time: TieredTime,
        value: SimValue,
        allow_same_time_overwrite: bool,
    ) -> Result<(), StaleWrite> {
        if let Some(newest) = &self.newest_access {
            let ok = *newest < time || (*newest == time && allow_same_time_overwrite);
            if !ok {
                return Err(StaleWrite {
                    time,
                    newest: newest.clone(),
                });
            }
        }
        self.newest_access = Some(time.clone());
        self.entries.insert(time, value);
        Ok(())
    }

    /// The newest value with a time `≤ time`, if any. Records the
    /// access so the returned data cannot be rewritten afterwards.
    pub fn get(&mut self, time: &TieredTime) -> Option<&SimValue> {
        self.get_with_time(time).map(|(_, v)| v)
    }

    /// Like [`get`](Self::get), also returning the time the value was
    /// actually written at.
    pub fn get_with_time(&mut self, time: &TieredTime) -> Option<(&TieredTime, &SimValue)> {
        let (stored, value) = self.entries.range(..=time.clone()).next_back()?;
        if self.newest_access.as_ref().is_none_or(|n| stored >= n) {
            self.newest_access = Some(stored.clone());
        }
        Some((stored, value))
    }

    /// Drop entries that can no longer be returned for reads at or
    /// after `time`. At least one entry at or before the horizon is
    /// always retained.
    pub fn prune(&mut self, time: &TieredTime) {
        while self.entries.len() >= 2 {
            let second = self
                .entries
                .keys()
                .nth(1)
                .expect("len checked above")
                .clone();
            if second <= *time {
                self.entries.pop_first();
            } else {
                break;
            }
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
