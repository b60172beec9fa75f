//! Input buffers: queued event deliveries and persistent memory.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tandem_types::{EntityId, InputData, SimValue, TieredTime, merge_inputs};

/// One pending delivery into a destination simulator.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    /// When the destination should see the value.
    pub time: TieredTime,
    /// Full ID of the producing entity.
    pub src: String,
    /// Destination entity.
    pub dst_eid: EntityId,
    /// Destination attribute.
    pub dst_attr: String,
    /// The delivered value.
    pub value: SimValue,
}

impl QueuedDelivery {
    fn key(&self) -> (&TieredTime, &str, &EntityId, &str) {
        (&self.time, &self.src, &self.dst_eid, &self.dst_attr)
    }
}

// Heap order ignores the value: deliveries sort by (time, src, dst).
impl PartialEq for QueuedDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedDelivery {}

impl PartialOrd for QueuedDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A min-heap of pending deliveries for transient (event) attributes.
/// Each delivery is handed out exactly once, by the first step whose
/// time is not before it.
#[derive(Debug, Default)]
pub struct TimedInputBuffer {
    queue: BinaryHeap<Reverse<QueuedDelivery>>,
}

impl TimedInputBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a delivery.
    pub fn add(&mut self, delivery: QueuedDelivery) {
        self.queue.push(Reverse(delivery));
    }

    /// The time of the earliest pending delivery.
    pub fn peek_next_time(&self) -> Option<&TieredTime> {
        self.queue.peek().map(|Reverse(d)| &d.time)
    }

    /// Remove and compose every delivery with `time ≤ step`.
    pub fn drain(&mut self, step: &TieredTime) -> InputData {
        let mut input = InputData::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.time > *step {
                break;
            }
            let Reverse(d) = self.queue.pop().expect("peeked above");
            input
                .entry(d.dst_eid)
                .or_default()
                .entry(d.dst_attr)
                .or_default()
                .insert(d.src, d.value);
        }
        input
    }

    /// True when deliveries are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Buffer for persistent trigger attributes: like
/// [`TimedInputBuffer`], but the last delivered value per
/// `(entity, attribute, source)` stays visible to every later step
/// until overwritten.
#[derive(Debug, Default)]
pub struct PersistentInputBuffer {
    queue: TimedInputBuffer,
    memory: InputData,
}

impl PersistentInputBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the memory for a connection, so the first step sees a value
    /// even before anything was delivered.
    pub fn seed(&mut self, dst_eid: EntityId, dst_attr: &str, src: &str, value: SimValue) {
        self.memory
            .entry(dst_eid)
            .or_default()
            .entry(dst_attr.to_owned())
            .or_default()
            .insert(src.to_owned(), value);
    }

    /// Queue a delivery.
    pub fn add(&mut self, delivery: QueuedDelivery) {
        self.queue.add(delivery);
    }

    /// The time of the earliest pending delivery.
    pub fn peek_next_time(&self) -> Option<&TieredTime> {
        self.queue.peek_next_time()
    }

    /// Fold every delivery with `time ≤ step` into the memory and
    /// return a snapshot of it.
    pub fn drain(&mut self, step: &TieredTime) -> InputData {
        let fresh = self.queue.drain(step);
        merge_inputs(&mut self.memory, fresh);
        self.memory.clone()
    }

    /// True when no value has ever been seeded or delivered.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.memory.is_empty()
    }
}
