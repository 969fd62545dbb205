//! Sequence number generation.
//!
//! One named counter per queue, mutated only through the counter store's
//! atomic increment-and-fetch. Sequence numbers are dense and strictly
//! increasing under arbitrary concurrent callers; insertion order is not
//! guaranteed to match them exactly, which is why resumption uses the track
//! field rather than natural order alone.

use crate::error::Result;
use crate::store::CounterStore;
use crate::types::Sequence;
use std::sync::Arc;

/// Generates monotonic sequence numbers for named queues.
#[derive(Clone)]
pub struct SequenceGenerator {
    counters: Arc<dyn CounterStore>,
}

impl SequenceGenerator {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    /// Atomically increment and return the new value, creating the counter
    /// (seeded at 1) when absent.
    pub fn next(&self, name: &str) -> Result<Sequence> {
        Ok(Sequence(self.counters.increment(name, 1)?))
    }

    /// Reserve a block of `count` values; returns the last one. The caller
    /// owns `returned - count + 1 ..= returned`.
    pub fn next_by(&self, name: &str, count: u64) -> Result<Sequence> {
        Ok(Sequence(self.counters.increment(name, count)?))
    }

    /// Current value without mutating; zero when the counter does not exist.
    pub fn current(&self, name: &str) -> Result<Sequence> {
        Ok(Sequence(self.counters.current(name)?))
    }

    /// Force the counter to a value.
    pub fn set(&self, name: &str, value: Sequence) -> Result<Sequence> {
        Ok(Sequence(self.counters.set(name, value.0)?))
    }

    /// Delete the counter; the next `next` restarts from 1.
    pub fn reset(&self, name: &str) -> Result<()> {
        self.counters.remove(name)
    }
}
