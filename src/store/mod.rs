//! Backing-store interface.
//!
//! The queue never talks to a concrete database. Everything goes through
//! [`MessageCollection`] and [`CounterStore`], explicit traits wrapping
//! whatever document store backs the queue. A driver binding implements the
//! traits once; [`memory::MemoryCollection`] is the in-process reference
//! implementation used by the test suites.

pub mod memory;

pub use memory::{CappedSpec, MemoryCollection, MemoryCounters};

use crate::error::Result;
use crate::types::{Envelope, MessageId, MsgState, Sequence, Timestamp};
use std::time::Duration;

/// Lower bound on the track field of matching envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackBound {
    /// Strictly after (tail from "now").
    Gt(Sequence),
    /// At or after (inclusive replay/checkpoint boundary).
    Gte(Sequence),
}

impl TrackBound {
    pub fn accepts(&self, value: Sequence) -> bool {
        match self {
            TrackBound::Gt(v) => value > *v,
            TrackBound::Gte(v) => value >= *v,
        }
    }
}

/// How an envelope's routing target is matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetMatch {
    /// Target equals the given value.
    Exact(String),
    /// Target equals the given value, or the envelope is untargeted.
    ExactOrNone(String),
    /// Target starts with the given value.
    Prefix(String),
}

impl TargetMatch {
    pub fn matches(&self, target: Option<&str>) -> bool {
        match self {
            TargetMatch::Exact(name) => target == Some(name.as_str()),
            TargetMatch::ExactOrNone(name) => match target {
                Some(t) => t == name || t.is_empty(),
                None => true,
            },
            TargetMatch::Prefix(prefix) => target.is_some_and(|t| t.starts_with(prefix.as_str())),
        }
    }
}

/// A closed query filter over envelopes.
///
/// This is the whole query language the queue needs; a driver binding
/// translates it to the store's native filter documents.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub id: Option<MessageId>,
    pub state: Option<MsgState>,
    /// Matches states whose code is >= this state's code (e.g. "processed":
    /// anything at or past `Received`).
    pub state_at_least: Option<MsgState>,
    /// Compared against the padded `received_by_raw` field.
    pub received_by: Option<String>,
    pub topic: Option<String>,
    pub verb: Option<String>,
    pub target: Option<TargetMatch>,
    pub track: Option<TrackBound>,
}

impl Filter {
    /// Filter matching everything.
    pub fn all() -> Self {
        Filter::default()
    }

    /// Filter selecting a single message by id.
    pub fn by_id(id: MessageId) -> Self {
        Filter {
            id: Some(id),
            ..Filter::default()
        }
    }

    /// Same filter with a (re)placed track bound.
    pub fn with_track(mut self, bound: TrackBound) -> Self {
        self.track = Some(bound);
        self
    }

    /// Whether an envelope satisfies every present criterion.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(id) = self.id {
            if envelope.id != id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if envelope.status.state != state {
                return false;
            }
        }
        if let Some(floor) = self.state_at_least {
            if envelope.status.state.code() < floor.code() {
                return false;
            }
        }
        if let Some(ref received_by) = self.received_by {
            if envelope.status.received_by_raw != *received_by {
                return false;
            }
        }
        if let Some(ref topic) = self.topic {
            if envelope.routing.topic != *topic {
                return false;
            }
        }
        if let Some(ref verb) = self.verb {
            if envelope.routing.verb != *verb {
                return false;
            }
        }
        if let Some(ref target) = self.target {
            if !target.matches(envelope.routing.target.as_deref()) {
                return false;
            }
        }
        if let Some(ref track) = self.track {
            if !track.accepts(envelope.track) {
                return false;
            }
        }
        true
    }
}

/// Fields set by a conditional update. Closed set: the acknowledgement
/// protocol is the only writer after insert.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub state: Option<MsgState>,
    /// Padded consumer name (see [`crate::types::DeliveryStatus::pad_name`]).
    pub received_by_raw: Option<String>,
    pub received_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl StatusUpdate {
    /// Apply to an envelope in place.
    pub fn apply(&self, envelope: &mut Envelope) {
        if let Some(state) = self.state {
            envelope.status.state = state;
        }
        if let Some(ref received_by) = self.received_by_raw {
            envelope.status.received_by_raw = received_by.clone();
        }
        if let Some(received_at) = self.received_at {
            envelope.received_at = received_at;
        }
        if let Some(completed_at) = self.completed_at {
            envelope.completed_at = completed_at;
        }
    }
}

/// Sort order for single-document lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// Oldest first (natural insertion order).
    NaturalAsc,
    /// Newest first.
    NaturalDesc,
}

/// Static properties of a collection.
#[derive(Clone, Debug)]
pub struct CollectionOptions {
    /// Capped collections preserve insertion order and evict from the front;
    /// subscribers tail them instead of polling.
    pub capped: bool,
    /// Field the collection suggests for cursor resumption, if any.
    pub track_field: Option<String>,
}

/// One row of a per-(topic, state) grouping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusGroup {
    pub topic: String,
    pub state: MsgState,
    pub count: u64,
}

/// Blocking cursor over a capped collection.
///
/// `next_timeout` returns the next matching envelope in natural insertion
/// order, waiting up to `wait` for new data. A cursor dies when eviction
/// overruns its position; the subscriber reopens from its last checkpoint.
pub trait TailCursor: Send {
    /// Next matching envelope, or None on timeout / cursor death.
    fn next_timeout(&mut self, wait: Duration) -> Result<Option<Envelope>>;

    /// False once the cursor can no longer produce documents.
    fn is_alive(&self) -> bool;
}

/// The document-store operations the queue needs from a message collection.
///
/// `find_one_and_update` must be atomic: filter match and update happen as
/// one indivisible operation. It is the sole synchronization primitive for
/// cross-consumer coordination.
pub trait MessageCollection: Send + Sync {
    fn options(&self) -> CollectionOptions;

    fn insert_one(&self, envelope: Envelope) -> Result<()>;

    fn insert_many(&self, envelopes: Vec<Envelope>) -> Result<()> {
        for envelope in envelopes {
            self.insert_one(envelope)?;
        }
        Ok(())
    }

    /// First matching envelope in the given natural order.
    fn find_one(&self, filter: &Filter, order: Order) -> Result<Option<Envelope>>;

    /// Matching envelopes sorted ascending by track value.
    fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Envelope>>;

    /// Atomically update the first envelope matching `filter`, returning the
    /// updated document, or None when nothing matched.
    fn find_one_and_update(&self, filter: &Filter, update: &StatusUpdate)
        -> Result<Option<Envelope>>;

    /// Ensure the track field is indexed (idempotent).
    fn ensure_track_index(&self) -> Result<()>;

    fn count(&self, filter: &Filter) -> Result<u64>;

    /// Per-(topic, state) counts, for monitoring.
    fn status_groups(&self) -> Result<Vec<StatusGroup>>;

    /// Remove every envelope (queue reset).
    fn clear(&self) -> Result<()>;

    /// Open a tailable cursor over matching envelopes.
    fn tail(&self, filter: Filter) -> Result<Box<dyn TailCursor>>;
}

/// Named atomic counters backing sequence generation.
///
/// `increment` must be a single atomic increment-and-fetch that creates the
/// counter (seeded at `by`) when absent; never read-then-write.
pub trait CounterStore: Send + Sync {
    fn increment(&self, name: &str, by: u64) -> Result<u64>;

    /// Current value without mutating; 0 when absent.
    fn current(&self, name: &str) -> Result<u64>;

    /// Force the counter to a value, creating it if needed.
    fn set(&self, name: &str, value: u64) -> Result<u64>;

    /// Delete the counter.
    fn remove(&self, name: &str) -> Result<()>;
}
