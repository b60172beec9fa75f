//! The tiered-time algebra.
//!
//! A [`TieredTime`] is a tuple of non-negative integers. Tier 0 is the
//! real logical time of the simulation; each further tier counts
//! microsteps inside a same-time loop (nested groups add further tiers).
//! Comparison is lexicographic, which gives a total, causal order even
//! when several simulators step at the same logical instant.
//!
//! A [`TieredInterval`] describes how an edge in the dependency graph
//! maps a source-side time to a destination-side time: its first
//! `cutoff` tiers are *added* to the source time, the remaining tiers
//! *replace* the source's trailing tiers. Interval composition is
//! associative, and `(t + i1) + i2 == t + (i1 + i2)` — both laws are
//! checked property-based in this crate's test suite.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A point on the tiered clock.
///
/// Two values of different tier counts compare as if the shorter one
/// were padded with zero tiers, so `5` and `5~0` are the same instant.
/// Equality and hashing follow the same rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredTime {
    tiers: Vec<u64>,
}

impl TieredTime {
    /// A time from explicit tiers. At least one tier is required.
    pub fn new(tiers: Vec<u64>) -> Self {
        assert!(!tiers.is_empty(), "a tiered time needs at least one tier");
        Self { tiers }
    }

    /// The zero time with the given number of tiers.
    pub fn zero(depth: usize) -> Self {
        Self::new(vec![0; depth.max(1)])
    }

    /// A time whose tier 0 is `time` and whose deeper tiers are zero.
    pub fn from_base(time: u64, depth: usize) -> Self {
        let mut tiers = vec![0; depth.max(1)];
        tiers[0] = time;
        Self { tiers }
    }

    /// The real logical time (tier 0).
    pub fn time(&self) -> u64 {
        self.tiers[0]
    }

    /// Number of tiers.
    pub fn depth(&self) -> usize {
        self.tiers.len()
    }

    /// The raw tiers.
    pub fn tiers(&self) -> &[u64] {
        &self.tiers
    }

    /// True if any tier beyond tier 0 is nonzero, i.e. this time lies
    /// inside a same-time loop.
    pub fn is_microstep(&self) -> bool {
        self.tiers[1..].iter().any(|&t| t != 0)
    }

    /// Reinterpret this time in a frame with `depth` tiers, truncating
    /// or zero-padding the tail.
    pub fn project(&self, depth: usize) -> TieredTime {
        let depth = depth.max(1);
        let mut tiers = self.tiers.clone();
        tiers.resize(depth, 0);
        TieredTime { tiers }
    }

    /// The smallest time strictly after this one: +1 on the deepest tier.
    pub fn successor(&self) -> TieredTime {
        let mut tiers = self.tiers.clone();
        let last = tiers.last_mut().expect("tiers are never empty");
        *last = last.saturating_add(1);
        TieredTime { tiers }
    }

    /// Apply an interval, mapping this time into the interval's
    /// destination frame.
    ///
    /// Defined iff the interval's `pre_length` matches this time's
    /// depth; the scheduler only ever pairs a time with intervals built
    /// for its frame, so a mismatch is a bug.
    pub fn plus(&self, interval: &TieredInterval) -> TieredTime {
        assert_eq!(
            self.tiers.len(),
            interval.pre_length,
            "interval built for a different tier frame"
        );
        let mut tiers = Vec::with_capacity(interval.tiers.len());
        for (i, &iv) in interval.tiers.iter().enumerate() {
            if i < interval.cutoff {
                tiers.push(self.tiers[i].saturating_add(iv));
            } else {
                tiers.push(iv);
            }
        }
        TieredTime { tiers }
    }

    /// Subtract `shift` from tier 0, or `None` if the result would lie
    /// before the start of the simulation.
    pub fn rewind(&self, shift: u64) -> Option<TieredTime> {
        let base = self.tiers[0].checked_sub(shift)?;
        let mut tiers = self.tiers.clone();
        tiers[0] = base;
        Some(TieredTime { tiers })
    }

    fn canonical(&self) -> &[u64] {
        let mut len = self.tiers.len();
        while len > 1 && self.tiers[len - 1] == 0 {
            len -= 1;
        }
        &self.tiers[..len]
    }
}

impl PartialEq for TieredTime {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for TieredTime {}

impl Hash for TieredTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl PartialOrd for TieredTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TieredTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.canonical(), other.canonical());
        let common = a.len().min(b.len());
        match a[..common].cmp(&b[..common]) {
            Ordering::Equal => a.len().cmp(&b.len()),
            ord => ord,
        }
    }
}

impl fmt::Display for TieredTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tiers[0])?;
        for t in &self.tiers[1..] {
            write!(f, "~{t}")?;
        }
        Ok(())
    }
}

/// The delay an edge imposes on data travelling along it.
///
/// `pre_length` is the tier count of the source frame, the tier vector's
/// length is the tier count of the destination frame. The first `cutoff`
/// tiers add to the source time; trailing tiers replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredInterval {
    pre_length: usize,
    cutoff: usize,
    tiers: Vec<u64>,
}

impl TieredInterval {
    /// Build an interval from raw parts. `cutoff` must not exceed
    /// `pre_length` or the tier count.
    pub fn new(pre_length: usize, cutoff: usize, tiers: Vec<u64>) -> Self {
        assert!(cutoff <= pre_length, "cutoff exceeds source frame");
        assert!(cutoff <= tiers.len(), "cutoff exceeds tier count");
        Self {
            pre_length,
            cutoff,
            tiers,
        }
    }

    /// The identity delay between a source frame of `pre` tiers and a
    /// destination frame of `post` tiers (an immediate, non-weak edge).
    pub fn identity(pre: usize, post: usize) -> Self {
        Self::new(pre, pre.min(post), vec![0; post])
    }

    /// The delay of a weak edge inside a group whose microstep tier has
    /// index `group_tier`: same instant, next microstep.
    pub fn weak(pre: usize, post: usize, group_tier: usize) -> Self {
        assert!(group_tier >= 1 && group_tier < pre.min(post));
        let mut tiers = vec![0; post];
        tiers[group_tier] = 1;
        Self::new(pre, group_tier + 1, tiers)
    }

    /// The delay of an edge time-shifted by `shift` on the real clock.
    pub fn shifted(pre: usize, post: usize, shift: u64) -> Self {
        let mut tiers = vec![0; post];
        tiers[0] = shift;
        Self::new(pre, 1, tiers)
    }

    /// Source frame tier count.
    pub fn pre_length(&self) -> usize {
        self.pre_length
    }

    /// Destination frame tier count.
    pub fn post_length(&self) -> usize {
        self.tiers.len()
    }

    /// How many leading tiers add to the source time.
    pub fn cutoff(&self) -> usize {
        self.cutoff
    }

    /// The shift this interval applies on the real clock (tier 0).
    pub fn base_shift(&self) -> u64 {
        self.tiers[0]
    }

    /// Compose two intervals: `t.plus(&a.then(&b)) == t.plus(&a).plus(&b)`.
    ///
    /// Defined iff `other` starts in the frame this interval ends in.
    pub fn then(&self, other: &TieredInterval) -> TieredInterval {
        assert_eq!(
            self.tiers.len(),
            other.pre_length,
            "intervals composed across different frames"
        );
        let cutoff = self.cutoff.min(other.cutoff);
        let mut tiers = Vec::with_capacity(other.tiers.len());
        for i in 0..cutoff {
            tiers.push(self.tiers[i] + other.tiers[i]);
        }
        if self.cutoff < other.cutoff {
            // other still adds where we already replace: fold our
            // replaced tiers into its additions
            for i in self.cutoff..other.cutoff {
                tiers.push(self.tiers.get(i).copied().unwrap_or(0) + other.tiers[i]);
            }
        }
        tiers.extend_from_slice(&other.tiers[other.cutoff..]);
        TieredInterval::new(self.pre_length, cutoff, tiers)
    }
}

impl fmt::Display for TieredInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+[")?;
        for (i, t) in self.tiers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if i == self.cutoff {
                write!(f, "|")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")
    }
}
