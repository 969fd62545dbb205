//! The subscription read loop.
//!
//! A [`Subscriber`] drives either a tailing cursor (capped collections) or a
//! batched poll loop (plain collections) and hands every document to a
//! caller-supplied filter/transform. The loop is an explicit state machine:
//! `Initializing -> Streaming <-> RetryWait -> Stopped`, with transient
//! failures re-entering `Initializing` from the last known resume point.

use super::cursor::{CursorStrategy, ResumeFrom};
use crate::error::{QueueError, Result};
use crate::store::{Filter, MessageCollection, TailCursor, TrackBound};
use crate::types::{Envelope, Sequence};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry budget for transient connection failures and dead tail cursors.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts before giving up (ignored when `unbounded`).
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Multiplier applied per consecutive failure (1.0 = fixed delay).
    pub backoff: f64,
    /// Retry forever. Explicit opt-in; bounded-then-fatal is the default
    /// contract.
    pub unbounded: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            delay: Duration::from_millis(500),
            backoff: 1.0,
            unbounded: false,
        }
    }
}

impl RetryPolicy {
    /// Retry forever with the default delay.
    pub fn unbounded() -> Self {
        Self {
            unbounded: true,
            ..Self::default()
        }
    }

    /// Delay before the given 1-based attempt, capped at 30s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.delay.as_millis() as f64 * factor).min(30_000.0);
        Duration::from_millis(millis as u64)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        !self.unbounded && attempts >= self.max_attempts
    }
}

/// Subscription tuning knobs.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Where to start reading.
    pub from: ResumeFrom,
    /// Batch size for poll mode.
    pub batch_limit: usize,
    /// Sleep between poll batches.
    pub poll_interval: Duration,
    /// How long a tail cursor awaits new data before reporting exhaustion.
    pub tail_wait: Duration,
    /// Retry budget for transient failures.
    pub retry: RetryPolicy,
    /// Expected track field. None accepts the collection's default; a value
    /// that differs from the collection's field is a configuration error.
    pub track_field: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            from: ResumeFrom::Latest,
            batch_limit: 100,
            poll_interval: Duration::from_millis(1000),
            tail_wait: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            track_field: None,
        }
    }
}

/// Read-loop state, exposed for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Initializing,
    Streaming,
    RetryWait,
    Stopped,
}

/// Cooperative stop flag shared between a subscriber and its streams.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a stop. Observed at the next loop iteration; a document
    /// already dequeued but not yet yielded is still delivered.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Re-arm after a stop.
    pub fn restart(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sleep in small slices so a stop request interrupts the wait.
fn sleep_cooperative(stop: &StopHandle, total: Duration) {
    let deadline = Instant::now() + total;
    loop {
        if stop.is_stopped() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

/// Delivery mode, chosen from the collection's options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryMode {
    Tail,
    Poll,
}

/// Subscribes to a message collection.
pub struct Subscriber {
    collection: Arc<dyn MessageCollection>,
    base_filter: Filter,
    options: SubscribeOptions,
    mode: DeliveryMode,
    stop: StopHandle,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("base_filter", &self.base_filter)
            .field("options", &self.options)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Validate configuration and build a subscriber.
    ///
    /// Tailing is used when the collection is capped, polling otherwise.
    /// Fails before any I/O loop starts when the track field is unusable.
    pub fn new(
        collection: Arc<dyn MessageCollection>,
        base_filter: Filter,
        options: SubscribeOptions,
    ) -> Result<Self> {
        let store_options = collection.options();

        // The track bound is always applied to the collection's own track
        // field; an explicit override is accepted only when it names that
        // same field, otherwise the bound would silently mean something else.
        let track_field = match (&options.track_field, &store_options.track_field) {
            (Some(explicit), Some(default)) if explicit == default => explicit.clone(),
            (Some(explicit), Some(default)) => {
                return Err(QueueError::Config(format!(
                    "track field '{}' does not match the collection's '{}'",
                    explicit, default
                )))
            }
            (Some(explicit), None) => {
                return Err(QueueError::Config(format!(
                    "collection has no track field to match '{}'",
                    explicit
                )))
            }
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(QueueError::Config(
                    "no usable track field on collection".to_string(),
                ))
            }
        };
        if track_field.is_empty() {
            return Err(QueueError::Config("track field is empty".to_string()));
        }
        if track_field.contains('.') {
            return Err(QueueError::Config(format!(
                "track field '{}' is not a first-level field",
                track_field
            )));
        }

        let mode = if store_options.capped {
            DeliveryMode::Tail
        } else {
            DeliveryMode::Poll
        };

        Ok(Self {
            collection,
            base_filter,
            options,
            mode,
            stop: StopHandle::new(),
        })
    }

    /// Handle for stopping/restarting streams cooperatively.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request a cooperative stop of all streams.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Re-arm after a stop; subsequent streams run again.
    pub fn restart(&self) {
        self.stop.restart();
    }

    /// Open a message stream. Each document from the cursor is handed to
    /// `transform`; `Ok(Some(value))` is yielded, `Ok(None)` skips the
    /// document, and an error ends the stream after yielding it.
    pub fn stream<T, F>(&self, transform: F) -> MessageStream<T>
    where
        F: FnMut(Envelope) -> Result<Option<T>> + Send + 'static,
    {
        MessageStream {
            collection: Arc::clone(&self.collection),
            base_filter: self.base_filter.clone(),
            options: self.options.clone(),
            mode: self.mode,
            stop: self.stop.clone(),
            transform: Box::new(transform),
            state: SubscriberState::Initializing,
            cursor: None,
            batch: VecDeque::new(),
            batch_drained: false,
            last_seen: None,
            pinned_from: None,
            attempts: 0,
            finished: false,
        }
    }

    /// Stream of raw envelopes with no transformation.
    pub fn envelopes(&self) -> MessageStream<Envelope> {
        self.stream(|doc| Ok(Some(doc)))
    }
}

/// Iterator over subscribed messages.
///
/// Yields `Ok(value)` per delivered document. A fatal condition (exhausted
/// retry budget, integrity error) is yielded as one `Err` and the stream
/// ends; a cooperative stop simply ends the stream.
pub struct MessageStream<T> {
    collection: Arc<dyn MessageCollection>,
    base_filter: Filter,
    options: SubscribeOptions,
    mode: DeliveryMode,
    stop: StopHandle,
    transform: Box<dyn FnMut(Envelope) -> Result<Option<T>> + Send>,
    state: SubscriberState,
    cursor: Option<Box<dyn TailCursor>>,
    batch: VecDeque<Envelope>,
    /// True once at least one poll batch completed (drives inter-batch sleep).
    batch_drained: bool,
    last_seen: Option<Sequence>,
    /// Starting point resolved once at first initialization.
    pinned_from: Option<ResumeFrom>,
    attempts: u32,
    finished: bool,
}

impl<T> std::fmt::Debug for MessageStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("last_seen", &self.last_seen)
            .field("attempts", &self.attempts)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> MessageStream<T> {
    /// Current loop state.
    pub fn state(&self) -> SubscriberState {
        self.state
    }

    /// Stop flag shared with the subscriber that opened this stream.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Track value of the last document handed to the transform; the
    /// checkpoint to resume from (exclusive) after a restart.
    pub fn last_seen(&self) -> Option<Sequence> {
        self.last_seen
    }

    /// Compute the resume filter for (re)initialization: strictly after the
    /// last seen document, or the pinned starting point before any progress.
    fn build_resume_filter(&mut self) -> Result<Filter> {
        let from = match self.last_seen {
            Some(seq) => ResumeFrom::At(Sequence(seq.0 + 1)),
            None => match self.pinned_from {
                Some(from) => from,
                None => {
                    let pinned = self.pin_start()?;
                    self.pinned_from = Some(pinned);
                    pinned
                }
            },
        };
        CursorStrategy::resume_filter(self.collection.as_ref(), &self.base_filter, from)
    }

    /// Resolve `Latest` against the collection exactly once, at first
    /// initialization. Re-resolving it on every retry would let the anchor
    /// drift forward and miss documents inserted between two empty reads.
    fn pin_start(&self) -> Result<ResumeFrom> {
        match self.options.from {
            ResumeFrom::Latest => Ok(
                match CursorStrategy::resume_bound(self.collection.as_ref(), ResumeFrom::Latest)? {
                    Some(TrackBound::Gt(v)) => ResumeFrom::At(Sequence(v.0 + 1)),
                    Some(TrackBound::Gte(v)) => ResumeFrom::At(v),
                    // Empty collection: everything that ever arrives is new.
                    None => ResumeFrom::Earliest,
                },
            ),
            from => Ok(from),
        }
    }

    /// Register a transient failure; either schedules a retry (true) or
    /// reports exhaustion (false).
    fn note_transient_failure(&mut self, what: &str, error: &QueueError) -> bool {
        self.attempts += 1;
        if self.options.retry.exhausted(self.attempts) {
            warn!(attempts = self.attempts, %error, "{} retries exhausted", what);
            return false;
        }
        debug!(attempt = self.attempts, %error, "{} failed, backing off", what);
        self.state = SubscriberState::RetryWait;
        sleep_cooperative(&self.stop, self.options.retry.delay_for(self.attempts));
        self.state = SubscriberState::Initializing;
        true
    }

    fn fatal(&mut self, error: QueueError) -> Option<Result<T>> {
        self.finished = true;
        self.state = SubscriberState::Stopped;
        Some(Err(error))
    }

    fn exhausted_error(&self, last: &QueueError) -> QueueError {
        QueueError::RetriesExhausted {
            attempts: self.attempts,
            last: last.to_string(),
        }
    }

    fn next_tail(&mut self) -> Option<Result<T>> {
        loop {
            if self.stop.is_stopped() {
                self.state = SubscriberState::Stopped;
                return None;
            }

            if self.cursor.is_none() {
                self.state = SubscriberState::Initializing;
                let filter = match self.build_resume_filter() {
                    Ok(filter) => filter,
                    Err(e) if e.is_transient() => {
                        if self.note_transient_failure("resume-point lookup", &e) {
                            continue;
                        }
                        let err = self.exhausted_error(&e);
                        return self.fatal(err);
                    }
                    Err(e) => return self.fatal(e),
                };
                match self.collection.tail(filter) {
                    Ok(cursor) => {
                        self.cursor = Some(cursor);
                        self.state = SubscriberState::Streaming;
                    }
                    Err(e) if e.is_transient() => {
                        if self.note_transient_failure("cursor open", &e) {
                            continue;
                        }
                        let err = self.exhausted_error(&e);
                        return self.fatal(err);
                    }
                    Err(e) => return self.fatal(e),
                }
            }

            let cursor = self.cursor.as_mut().expect("cursor just initialized");
            match cursor.next_timeout(self.options.tail_wait) {
                Ok(Some(doc)) => {
                    self.attempts = 0;
                    self.state = SubscriberState::Streaming;
                    self.last_seen = Some(doc.track);
                    match (self.transform)(doc) {
                        Ok(Some(value)) => return Some(Ok(value)),
                        // Declined by the filter function; not yielded.
                        Ok(None) => {}
                        Err(e) => return self.fatal(e),
                    }
                }
                Ok(None) => {
                    if cursor.is_alive() {
                        // Exhaustion is not an error; the await already
                        // bounded our wait, go around and query again.
                        self.state = SubscriberState::RetryWait;
                        continue;
                    }
                    // Dead cursor: eviction overran us or the collection was
                    // reset. Reopen from the checkpoint.
                    debug!(last_seen = ?self.last_seen, "tail cursor died, reopening");
                    self.cursor = None;
                    let placeholder = QueueError::Connection("tail cursor died".to_string());
                    if self.note_transient_failure("tail cursor", &placeholder) {
                        continue;
                    }
                    let err = self.exhausted_error(&placeholder);
                    return self.fatal(err);
                }
                Err(e) if e.is_transient() => {
                    self.cursor = None;
                    if self.note_transient_failure("tail read", &e) {
                        continue;
                    }
                    let err = self.exhausted_error(&e);
                    return self.fatal(err);
                }
                Err(e) => return self.fatal(e),
            }
        }
    }

    fn next_poll(&mut self) -> Option<Result<T>> {
        loop {
            if self.stop.is_stopped() {
                self.state = SubscriberState::Stopped;
                return None;
            }

            if let Some(doc) = self.batch.pop_front() {
                self.attempts = 0;
                self.state = SubscriberState::Streaming;
                self.last_seen = Some(doc.track);
                match (self.transform)(doc) {
                    Ok(Some(value)) => return Some(Ok(value)),
                    Ok(None) => {}
                    Err(e) => return self.fatal(e),
                }
                continue;
            }

            // Sleep between batches, but not before the very first query.
            if self.batch_drained {
                self.state = SubscriberState::RetryWait;
                sleep_cooperative(&self.stop, self.options.poll_interval);
                if self.stop.is_stopped() {
                    self.state = SubscriberState::Stopped;
                    return None;
                }
            }

            self.state = SubscriberState::Initializing;
            // The resume filter is a fresh value each batch, recomputed from
            // the checkpoint rather than accumulated in place.
            let filter = match self.last_seen {
                Some(seq) => Ok(CursorStrategy::advance_past(&self.base_filter, seq)),
                None => self.build_resume_filter(),
            };
            let filter = match filter {
                Ok(filter) => filter,
                Err(e) if e.is_transient() => {
                    if self.note_transient_failure("resume-point lookup", &e) {
                        continue;
                    }
                    let err = self.exhausted_error(&e);
                    return self.fatal(err);
                }
                Err(e) => return self.fatal(e),
            };

            match self.collection.find(&filter, Some(self.options.batch_limit)) {
                Ok(docs) => {
                    self.attempts = 0;
                    self.batch_drained = true;
                    self.batch.extend(docs);
                    self.state = SubscriberState::Streaming;
                }
                Err(e) if e.is_transient() => {
                    if self.note_transient_failure("poll query", &e) {
                        continue;
                    }
                    let err = self.exhausted_error(&e);
                    return self.fatal(err);
                }
                Err(e) => return self.fatal(e),
            }
        }
    }
}

impl<T> Iterator for MessageStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.mode {
            DeliveryMode::Tail => self.next_tail(),
            DeliveryMode::Poll => self.next_poll(),
        }
    }
}
