//! Queue monitoring.
//!
//! Read-only: everything here issues count/group/find_one reads, so the
//! collector is safe to run alongside publishers and subscribers. Not on the
//! delivery critical path.

use crate::error::Result;
use crate::store::{Filter, MessageCollection, Order, StatusGroup};
use crate::subscriptions::StopHandle;
use crate::types::{MsgState, Timestamp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Backlog breakdown at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub total: u64,
    /// Published, unclaimed.
    pub pending: u64,
    /// Claimed, not yet completed.
    pub in_flight: u64,
    /// Terminal (success, fail, or custom code).
    pub done: u64,
}

impl QueueDepth {
    /// Messages still owed work.
    pub fn backlog(&self) -> u64 {
        self.total.saturating_sub(self.done)
    }
}

/// Delivery rate between the first and last processed envelope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Throughput {
    pub messages: u64,
    pub seconds: f64,
    pub per_sec: f64,
}

/// One monitoring snapshot.
#[derive(Clone, Debug)]
pub struct QueueStats {
    pub depth: QueueDepth,
    /// None until at least two envelopes have been processed.
    pub throughput: Option<Throughput>,
    /// Per-(topic, state) counts.
    pub groups: Vec<StatusGroup>,
    /// Change since the previous sample; None for one-off snapshots and the
    /// first sample of a [`Sampler`].
    pub delta: Option<SampleDelta>,
    pub sampled_at: Timestamp,
}

/// What changed between two consecutive samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleDelta {
    /// Envelopes published since the previous sample.
    pub published: u64,
    /// Envelopes reaching a terminal state since the previous sample.
    pub completed: u64,
    pub seconds: f64,
}

/// Periodically summarizes collection state.
#[derive(Clone)]
pub struct StatsCollector {
    collection: Arc<dyn MessageCollection>,
    interval: Duration,
}

impl StatsCollector {
    pub fn new(collection: Arc<dyn MessageCollection>) -> Self {
        Self {
            collection,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Current backlog breakdown.
    pub fn depth(&self) -> Result<QueueDepth> {
        let total = self.collection.count(&Filter::all())?;
        let pending = self.collection.count(&Filter {
            state: Some(MsgState::Sent),
            ..Filter::default()
        })?;
        let in_flight = self.collection.count(&Filter {
            state: Some(MsgState::Received),
            ..Filter::default()
        })?;
        let done = self.collection.count(&Filter {
            state_at_least: Some(MsgState::Success),
            ..Filter::default()
        })?;
        Ok(QueueDepth {
            total,
            pending,
            in_flight,
            done,
        })
    }

    /// Messages per second over the processed span, or None with fewer than
    /// two processed envelopes.
    pub fn throughput(&self) -> Result<Option<Throughput>> {
        let processed = Filter {
            state_at_least: Some(MsgState::Received),
            ..Filter::default()
        };
        let first = match self.collection.find_one(&processed, Order::NaturalAsc)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let last = match self.collection.find_one(&processed, Order::NaturalDesc)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        if first.id == last.id {
            return Ok(None);
        }

        let messages = self.collection.count(&processed)?;
        let seconds = last.received_at.seconds_since(first.received_at);
        let per_sec = if seconds > 0.0 {
            messages as f64 / seconds
        } else {
            0.0
        };
        Ok(Some(Throughput {
            messages,
            seconds,
            per_sec,
        }))
    }

    /// Per-(topic, state) counts.
    pub fn status_groups(&self) -> Result<Vec<StatusGroup>> {
        self.collection.status_groups()
    }

    /// One full snapshot.
    pub fn snapshot(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            depth: self.depth()?,
            throughput: self.throughput()?,
            groups: self.status_groups()?,
            delta: None,
            sampled_at: Timestamp::now(),
        })
    }

    /// Stateful sampler producing interval deltas on top of snapshots.
    pub fn sampler(&self) -> Sampler {
        Sampler {
            collector: self.clone(),
            previous: None,
        }
    }

    /// Sampling loop: sample every interval until stopped, handing each
    /// sample to `on_sample`. Read errors are reported and sampling
    /// continues.
    pub fn run<F>(&self, stop: &StopHandle, mut on_sample: F)
    where
        F: FnMut(QueueStats),
    {
        let mut sampler = self.sampler();
        while !stop.is_stopped() {
            match sampler.sample() {
                Ok(stats) => on_sample(stats),
                Err(e) => debug!(%e, "stats sample failed"),
            }

            let deadline = Instant::now() + self.interval;
            while !stop.is_stopped() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

/// Tracks the previous sample's depth to report what changed in between.
pub struct Sampler {
    collector: StatsCollector,
    previous: Option<(Instant, QueueDepth)>,
}

impl Sampler {
    /// Snapshot with an interval delta from the second call onward.
    ///
    /// Counts use saturating subtraction: capped eviction can shrink the
    /// totals between samples.
    pub fn sample(&mut self) -> Result<QueueStats> {
        let now = Instant::now();
        let mut stats = self.collector.snapshot()?;
        if let Some((at, depth)) = self.previous {
            stats.delta = Some(SampleDelta {
                published: stats.depth.total.saturating_sub(depth.total),
                completed: stats.depth.done.saturating_sub(depth.done),
                seconds: now.duration_since(at).as_secs_f64(),
            });
        }
        self.previous = Some((now, stats.depth));
        Ok(stats)
    }
}
