//! Message publishing.
//!
//! Builds fixed-shape envelopes and inserts them. Only transient connection
//! errors are retried (bounded, fixed delay); anything else, such as a
//! duplicate key or a validation failure, propagates immediately.
//! `publish_async` is an explicit
//! opt-in wrapper: a spawned thread plus a channel-backed result handle, the
//! synchronous call remains the primary contract.

use crate::error::{QueueError, Result};
use crate::sequence::SequenceGenerator;
use crate::store::MessageCollection;
use crate::subscriptions::RetryPolicy;
use crate::types::{AckMode, DeliveryStatus, Envelope, MessageId, Routing, Sequence, Timestamp};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use tracing::debug;

use std::sync::Arc;

/// What to publish; routing fields are opaque to the queue.
#[derive(Clone, Debug, Default)]
pub struct PublishRequest {
    pub topic: String,
    pub verb: String,
    pub target: Option<String>,
    pub ack: AckMode,
    /// Request message this one responds to (result envelopes).
    pub parent: Option<Sequence>,
    pub payload: serde_json::Value,
}

impl PublishRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            ack: AckMode::Receipt,
            payload,
            ..Self::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = verb.into();
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    pub fn parent(mut self, parent: Sequence) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Publishes envelopes into one collection under one sender identity.
#[derive(Clone)]
pub struct Publisher {
    collection: Arc<dyn MessageCollection>,
    sequence: SequenceGenerator,
    /// Counter name (the queue name).
    counter: String,
    /// Recorded as `sent_by`.
    sender: String,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(
        collection: Arc<dyn MessageCollection>,
        sequence: SequenceGenerator,
        counter: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            collection,
            sequence,
            counter: counter.into(),
            sender: sender.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Build and insert an envelope, returning it as stored.
    pub fn publish(&self, request: PublishRequest) -> Result<Envelope> {
        let sequence = self.sequence.next(&self.counter)?;
        let id = match request.parent {
            Some(parent) => MessageId::with_parent(sequence, parent),
            None => MessageId::new(sequence),
        };

        let envelope = Envelope {
            id,
            track: sequence,
            ack: request.ack,
            routing: Routing {
                topic: request.topic,
                verb: request.verb,
                target: request.target,
            },
            status: DeliveryStatus::sent(self.sender.clone()),
            sent_at: Timestamp::now(),
            received_at: Timestamp::UNSET,
            completed_at: Timestamp::UNSET,
            payload: request.payload,
        };

        self.insert_with_retry(envelope)
    }

    /// Publish on a spawned thread; the handle resolves to the stored
    /// envelope.
    pub fn publish_async(&self, request: PublishRequest) -> PublishHandle {
        let publisher = self.clone();
        let (sender, receiver) = bounded(1);
        let thread = std::thread::spawn(move || {
            // A dropped handle is fine; the publish still ran.
            let _ = sender.send(publisher.publish(request));
        });
        PublishHandle {
            receiver,
            _thread: thread,
        }
    }

    fn insert_with_retry(&self, envelope: Envelope) -> Result<Envelope> {
        let mut attempts = 0u32;
        loop {
            match self.collection.insert_one(envelope.clone()) {
                Ok(()) => return Ok(envelope),
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if !self.retry.unbounded && attempts >= self.retry.max_attempts {
                        return Err(QueueError::RetriesExhausted {
                            attempts,
                            last: e.to_string(),
                        });
                    }
                    debug!(attempt = attempts, %e, "insert failed, retrying");
                    std::thread::sleep(self.retry.delay_for(attempts));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result handle for an asynchronous publish.
pub struct PublishHandle {
    receiver: Receiver<Result<Envelope>>,
    _thread: std::thread::JoinHandle<()>,
}

impl PublishHandle {
    /// Block until the publish finishes.
    pub fn wait(self) -> Result<Envelope> {
        self.receiver
            .recv()
            .map_err(|_| QueueError::Connection("publish thread dropped".to_string()))?
    }

    /// Non-blocking probe; None while the publish is still running.
    pub fn try_wait(&self) -> Option<Result<Envelope>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(QueueError::Connection(
                "publish thread dropped".to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCollection, MemoryCounters};
    use crate::types::MsgState;
    use serde_json::json;

    fn publisher(collection: Arc<dyn MessageCollection>) -> Publisher {
        let sequence = SequenceGenerator::new(Arc::new(MemoryCounters::new()));
        Publisher::new(collection, sequence, "jobs", "publisher-1")
    }

    #[test]
    fn test_publish_builds_fixed_shape_envelope() {
        let collection = Arc::new(MemoryCollection::new());
        let publisher = publisher(collection.clone());

        let envelope = publisher
            .publish(
                PublishRequest::new(json!({"work": 1}))
                    .topic("red")
                    .verb("run")
                    .target("worker-1"),
            )
            .unwrap();

        assert_eq!(envelope.id.sequence, Sequence(1));
        assert_eq!(envelope.track, Sequence(1));
        assert_eq!(envelope.status.state, MsgState::Sent);
        assert_eq!(envelope.status.sent_by, "publisher-1");
        assert_eq!(envelope.status.received_by(), None);
        assert!(envelope.received_at.is_unset());
        assert!(envelope.completed_at.is_unset());
        assert_eq!(envelope.routing.topic, "red");
        assert_eq!(envelope.routing.target.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_publish_assigns_increasing_sequences() {
        let collection = Arc::new(MemoryCollection::new());
        let publisher = publisher(collection);

        let a = publisher.publish(PublishRequest::new(json!(1))).unwrap();
        let b = publisher.publish(PublishRequest::new(json!(2))).unwrap();
        assert_eq!(a.id.sequence, Sequence(1));
        assert_eq!(b.id.sequence, Sequence(2));
    }

    #[test]
    fn test_result_envelope_links_parent() {
        let collection = Arc::new(MemoryCollection::new());
        let publisher = publisher(collection);

        let request = publisher.publish(PublishRequest::new(json!("job"))).unwrap();
        let result = publisher
            .publish(
                PublishRequest::new(json!("done"))
                    .ack(AckMode::None)
                    .parent(request.id.sequence),
            )
            .unwrap();
        assert_eq!(result.id.parent, Some(request.id.sequence));
    }

    #[test]
    fn test_publish_async_handle() {
        let collection = Arc::new(MemoryCollection::new());
        let publisher = publisher(collection);

        let handle = publisher.publish_async(PublishRequest::new(json!("bg")));
        let envelope = handle.wait().unwrap();
        assert_eq!(envelope.id.sequence, Sequence(1));
    }

    #[test]
    fn test_duplicate_key_not_retried() {
        let collection = Arc::new(MemoryCollection::new());
        let publisher = publisher(collection.clone());

        let first = publisher.publish(PublishRequest::new(json!(1))).unwrap();
        // Force a collision by re-inserting the same envelope directly.
        let err = collection.insert_one(first).unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
    }
}
