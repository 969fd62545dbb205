//! In-memory store implementation.
//!
//! Reference implementation of [`MessageCollection`] and [`CounterStore`],
//! with real capped-collection semantics: bounded size, front eviction, and
//! tailable cursors that block on a condvar and die when eviction overruns
//! their position. This is the substrate for the crate's test suites and for
//! single-process deployments.

use super::{
    CollectionOptions, CounterStore, Filter, MessageCollection, Order, StatusGroup, StatusUpdate,
    TailCursor,
};
use crate::error::{QueueError, Result};
use crate::types::{Envelope, MsgState};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size/count bounds for a capped collection.
#[derive(Clone, Copy, Debug)]
pub struct CappedSpec {
    /// Maximum number of documents (None = unbounded count).
    pub max_docs: Option<usize>,
    /// Maximum total serialized bytes (None = unbounded size).
    pub max_bytes: Option<usize>,
}

impl Default for CappedSpec {
    fn default() -> Self {
        Self {
            max_docs: None,
            max_bytes: Some(1 << 30), // ~1 GB, matching the usual capped default
        }
    }
}

struct Entry {
    natural: u64,
    bytes: usize,
    doc: Envelope,
}

struct Inner {
    /// Retained documents in natural insertion order. Naturals are
    /// contiguous: `entries[i].natural == entries[0].natural + i`.
    entries: VecDeque<Entry>,
    /// Natural position assigned to the next insert.
    next_natural: u64,
    /// Naturals below this have been evicted or cleared.
    evicted_to: u64,
    total_bytes: usize,
    indexed_fields: Vec<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled on every insert; tail cursors wait on it.
    data_ready: Condvar,
}

/// In-memory message collection, optionally capped.
#[derive(Clone)]
pub struct MemoryCollection {
    shared: Arc<Shared>,
    capped: Option<CappedSpec>,
    track_field: String,
}

impl MemoryCollection {
    /// Plain (uncapped) collection.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Capped collection with the given bounds.
    pub fn capped(spec: CappedSpec) -> Self {
        Self::build(Some(spec))
    }

    fn build(capped: Option<CappedSpec>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    entries: VecDeque::new(),
                    next_natural: 0,
                    evicted_to: 0,
                    total_bytes: 0,
                    indexed_fields: Vec::new(),
                }),
                data_ready: Condvar::new(),
            }),
            capped,
            track_field: "track".to_string(),
        }
    }

    /// Names of indexed fields, in creation order.
    pub fn index_names(&self) -> Vec<String> {
        self.shared.inner.lock().indexed_fields.clone()
    }

    fn evict_over_capacity(&self, inner: &mut Inner) {
        let Some(spec) = self.capped else { return };
        loop {
            if inner.entries.len() <= 1 {
                break;
            }
            let over_docs = spec.max_docs.is_some_and(|max| inner.entries.len() > max);
            let over_bytes = spec.max_bytes.is_some_and(|max| inner.total_bytes > max);
            if !over_docs && !over_bytes {
                break;
            }
            if let Some(evicted) = inner.entries.pop_front() {
                inner.total_bytes -= evicted.bytes;
                inner.evicted_to = evicted.natural + 1;
            }
        }
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCollection for MemoryCollection {
    fn options(&self) -> CollectionOptions {
        CollectionOptions {
            capped: self.capped.is_some(),
            track_field: Some(self.track_field.clone()),
        }
    }

    fn insert_one(&self, envelope: Envelope) -> Result<()> {
        let bytes = serde_json::to_vec(&envelope)?.len();

        let mut inner = self.shared.inner.lock();
        if inner
            .entries
            .iter()
            .any(|entry| entry.doc.id == envelope.id)
        {
            return Err(QueueError::Store(format!(
                "duplicate key: {:?}",
                envelope.id
            )));
        }

        let natural = inner.next_natural;
        inner.next_natural += 1;
        inner.total_bytes += bytes;
        inner.entries.push_back(Entry {
            natural,
            bytes,
            doc: envelope,
        });
        self.evict_over_capacity(&mut inner);
        drop(inner);

        self.shared.data_ready.notify_all();
        Ok(())
    }

    fn find_one(&self, filter: &Filter, order: Order) -> Result<Option<Envelope>> {
        let inner = self.shared.inner.lock();
        let found = match order {
            Order::NaturalAsc => inner
                .entries
                .iter()
                .find(|entry| filter.matches(&entry.doc)),
            Order::NaturalDesc => inner
                .entries
                .iter()
                .rev()
                .find(|entry| filter.matches(&entry.doc)),
        };
        Ok(found.map(|entry| entry.doc.clone()))
    }

    fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Envelope>> {
        let inner = self.shared.inner.lock();
        let mut matching: Vec<Envelope> = inner
            .entries
            .iter()
            .filter(|entry| filter.matches(&entry.doc))
            .map(|entry| entry.doc.clone())
            .collect();
        drop(inner);

        matching.sort_by_key(|doc| doc.track);
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &StatusUpdate,
    ) -> Result<Option<Envelope>> {
        let mut inner = self.shared.inner.lock();
        for entry in inner.entries.iter_mut() {
            if filter.matches(&entry.doc) {
                update.apply(&mut entry.doc);
                return Ok(Some(entry.doc.clone()));
            }
        }
        Ok(None)
    }

    fn ensure_track_index(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        let field = self.track_field.clone();
        if !inner.indexed_fields.contains(&field) {
            inner.indexed_fields.push(field);
        }
        Ok(())
    }

    fn count(&self, filter: &Filter) -> Result<u64> {
        let inner = self.shared.inner.lock();
        Ok(inner
            .entries
            .iter()
            .filter(|entry| filter.matches(&entry.doc))
            .count() as u64)
    }

    fn status_groups(&self) -> Result<Vec<StatusGroup>> {
        let inner = self.shared.inner.lock();
        let mut groups: BTreeMap<(String, u32), u64> = BTreeMap::new();
        for entry in &inner.entries {
            let key = (
                entry.doc.routing.topic.clone(),
                entry.doc.status.state.code(),
            );
            *groups.entry(key).or_insert(0) += 1;
        }
        Ok(groups
            .into_iter()
            .map(|((topic, code), count)| StatusGroup {
                topic,
                state: MsgState::from_code(code).unwrap_or(MsgState::Unknown),
                count,
            })
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.evicted_to = inner.next_natural;
        drop(inner);

        // Wake tailing cursors so they notice they are dead.
        self.shared.data_ready.notify_all();
        Ok(())
    }

    fn tail(&self, filter: Filter) -> Result<Box<dyn TailCursor>> {
        if self.capped.is_none() {
            return Err(QueueError::Config(
                "tailable cursors require a capped collection".to_string(),
            ));
        }
        let inner = self.shared.inner.lock();
        let position = inner
            .entries
            .front()
            .map(|entry| entry.natural)
            .unwrap_or(inner.next_natural);
        drop(inner);

        Ok(Box::new(MemoryTailCursor {
            shared: Arc::clone(&self.shared),
            filter,
            position,
            alive: true,
        }))
    }
}

/// Tailable cursor over a capped [`MemoryCollection`].
struct MemoryTailCursor {
    shared: Arc<Shared>,
    filter: Filter,
    /// Natural position of the next document to examine.
    position: u64,
    alive: bool,
}

impl TailCursor for MemoryTailCursor {
    fn next_timeout(&mut self, wait: Duration) -> Result<Option<Envelope>> {
        if !self.alive {
            return Ok(None);
        }
        let deadline = Instant::now() + wait;

        let mut inner = self.shared.inner.lock();
        loop {
            // Eviction ran past our position: the cursor is dead and must be
            // reopened from a checkpoint.
            if self.position < inner.evicted_to {
                self.alive = false;
                return Ok(None);
            }

            let front = inner
                .entries
                .front()
                .map(|entry| entry.natural)
                .unwrap_or(inner.next_natural);
            let mut index = (self.position.max(front) - front) as usize;
            while index < inner.entries.len() {
                let entry = &inner.entries[index];
                self.position = entry.natural + 1;
                index += 1;
                if self.filter.matches(&entry.doc) {
                    return Ok(Some(entry.doc.clone()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let timed_out = self
                .shared
                .data_ready
                .wait_for(&mut inner, deadline - now)
                .timed_out();
            if timed_out {
                // Re-check once under the lock, then report exhaustion.
                continue;
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// In-memory named counters with atomic increment-and-fetch.
#[derive(Default)]
pub struct MemoryCounters {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounters {
    fn increment(&self, name: &str, by: u64) -> Result<u64> {
        let mut counters = self.counters.lock();
        let value = counters.entry(name.to_string()).or_insert(0);
        *value += by;
        Ok(*value)
    }

    fn current(&self, name: &str) -> Result<u64> {
        Ok(self.counters.lock().get(name).copied().unwrap_or(0))
    }

    fn set(&self, name: &str, value: u64) -> Result<u64> {
        self.counters.lock().insert(name.to_string(), value);
        Ok(value)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.counters.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TrackBound;
    use crate::types::{
        AckMode, DeliveryStatus, MessageId, Routing, Sequence, Timestamp,
    };
    use std::thread;

    fn envelope(seq: u64, topic: &str) -> Envelope {
        Envelope {
            id: MessageId::new(Sequence(seq)),
            track: Sequence(seq),
            ack: AckMode::Receipt,
            routing: Routing {
                topic: topic.to_string(),
                verb: String::new(),
                target: None,
            },
            status: DeliveryStatus::sent("tester"),
            sent_at: Timestamp::now(),
            received_at: Timestamp::UNSET,
            completed_at: Timestamp::UNSET,
            payload: serde_json::json!({"seq": seq}),
        }
    }

    #[test]
    fn test_insert_and_find_sorted_by_track() {
        let collection = MemoryCollection::new();
        for seq in [3, 1, 2] {
            collection.insert_one(envelope(seq, "t")).unwrap();
        }
        let docs = collection.find(&Filter::all(), None).unwrap();
        let seqs: Vec<u64> = docs.iter().map(|d| d.track.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let limited = collection.find(&Filter::all(), Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let collection = MemoryCollection::new();
        collection.insert_one(envelope(1, "t")).unwrap();
        let err = collection.insert_one(envelope(1, "t")).unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
    }

    #[test]
    fn test_natural_order_find_one() {
        let collection = MemoryCollection::new();
        for seq in 1..=3 {
            collection.insert_one(envelope(seq, "t")).unwrap();
        }
        let first = collection
            .find_one(&Filter::all(), Order::NaturalAsc)
            .unwrap()
            .unwrap();
        let last = collection
            .find_one(&Filter::all(), Order::NaturalDesc)
            .unwrap()
            .unwrap();
        assert_eq!(first.track, Sequence(1));
        assert_eq!(last.track, Sequence(3));
    }

    #[test]
    fn test_capped_eviction_from_front() {
        let collection = MemoryCollection::capped(CappedSpec {
            max_docs: Some(3),
            max_bytes: None,
        });
        for seq in 1..=5 {
            collection.insert_one(envelope(seq, "t")).unwrap();
        }
        let docs = collection.find(&Filter::all(), None).unwrap();
        let seqs: Vec<u64> = docs.iter().map(|d| d.track.0).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_tail_requires_capped() {
        let collection = MemoryCollection::new();
        assert!(matches!(
            collection.tail(Filter::all()),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn test_tail_cursor_blocks_until_insert() {
        let collection = MemoryCollection::capped(CappedSpec::default());
        let mut cursor = collection.tail(Filter::all()).unwrap();

        let writer = {
            let collection = collection.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                collection.insert_one(envelope(1, "t")).unwrap();
            })
        };

        let doc = cursor.next_timeout(Duration::from_secs(2)).unwrap();
        writer.join().unwrap();
        assert_eq!(doc.unwrap().track, Sequence(1));
        assert!(cursor.is_alive());
    }

    #[test]
    fn test_tail_cursor_timeout_is_not_death() {
        let collection = MemoryCollection::capped(CappedSpec::default());
        collection.insert_one(envelope(1, "t")).unwrap();
        let mut cursor = collection.tail(Filter::all()).unwrap();

        assert!(cursor.next_timeout(Duration::from_millis(5)).unwrap().is_some());
        assert!(cursor.next_timeout(Duration::from_millis(5)).unwrap().is_none());
        assert!(cursor.is_alive());
    }

    #[test]
    fn test_tail_cursor_killed_by_eviction() {
        let collection = MemoryCollection::capped(CappedSpec {
            max_docs: Some(2),
            max_bytes: None,
        });
        collection.insert_one(envelope(1, "t")).unwrap();
        let mut cursor = collection.tail(Filter::all()).unwrap();

        // Push the cursor's start position out of the collection.
        for seq in 2..=6 {
            collection.insert_one(envelope(seq, "t")).unwrap();
        }
        assert!(cursor.next_timeout(Duration::from_millis(5)).unwrap().is_none());
        assert!(!cursor.is_alive());
    }

    #[test]
    fn test_tail_cursor_filter_skips_without_yield() {
        let collection = MemoryCollection::capped(CappedSpec::default());
        collection.insert_one(envelope(1, "red")).unwrap();
        collection.insert_one(envelope(2, "green")).unwrap();
        collection.insert_one(envelope(3, "red")).unwrap();

        let filter = Filter {
            topic: Some("red".to_string()),
            ..Filter::default()
        };
        let mut cursor = collection.tail(filter).unwrap();
        let a = cursor.next_timeout(Duration::from_millis(10)).unwrap().unwrap();
        let b = cursor.next_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!((a.track, b.track), (Sequence(1), Sequence(3)));
        assert!(cursor.next_timeout(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_conditional_update_claims_once() {
        let collection = MemoryCollection::new();
        collection.insert_one(envelope(1, "t")).unwrap();

        let claim_filter = Filter {
            id: Some(MessageId::new(Sequence(1))),
            state: Some(MsgState::Sent),
            ..Filter::default()
        };
        let update = StatusUpdate {
            state: Some(MsgState::Received),
            received_by_raw: Some(DeliveryStatus::pad_name("w")),
            received_at: Some(Timestamp::now()),
            completed_at: None,
        };

        let first = collection.find_one_and_update(&claim_filter, &update).unwrap();
        assert!(first.is_some());
        let second = collection.find_one_and_update(&claim_filter, &update).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_track_bound_in_find() {
        let collection = MemoryCollection::new();
        for seq in 1..=5 {
            collection.insert_one(envelope(seq, "t")).unwrap();
        }
        let filter = Filter::all().with_track(TrackBound::Gte(Sequence(3)));
        let docs = collection.find(&filter, None).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].track, Sequence(3));
    }

    #[test]
    fn test_status_groups() {
        let collection = MemoryCollection::new();
        collection.insert_one(envelope(1, "red")).unwrap();
        collection.insert_one(envelope(2, "red")).unwrap();
        collection.insert_one(envelope(3, "green")).unwrap();

        let groups = collection.status_groups().unwrap();
        assert!(groups.contains(&StatusGroup {
            topic: "red".to_string(),
            state: MsgState::Sent,
            count: 2,
        }));
        assert!(groups.contains(&StatusGroup {
            topic: "green".to_string(),
            state: MsgState::Sent,
            count: 1,
        }));
    }

    #[test]
    fn test_counters_increment_and_reset() {
        let counters = MemoryCounters::new();
        assert_eq!(counters.current("q").unwrap(), 0);
        assert_eq!(counters.increment("q", 1).unwrap(), 1);
        assert_eq!(counters.increment("q", 5).unwrap(), 6);
        assert_eq!(counters.current("q").unwrap(), 6);
        counters.remove("q").unwrap();
        assert_eq!(counters.current("q").unwrap(), 0);
    }

    #[test]
    fn test_counters_concurrent_density() {
        let counters = Arc::new(MemoryCounters::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counters = Arc::clone(&counters);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(counters.increment("q", 1).unwrap());
                }
                seen
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (1..=800).collect();
        assert_eq!(all, expected);
    }
}
