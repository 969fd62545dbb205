//! The queue facade.
//!
//! [`MessageQueue`] wires a [`MessageCollection`] and a [`CounterStore`]
//! into one publish/subscribe surface under a single instance identity.
//! Everything it does is delegation; the pieces remain usable on their own
//! when a caller needs only one side of the protocol.

use crate::ack::AckProtocol;
use crate::error::{QueueError, Result};
use crate::publish::{PublishHandle, Publisher, PublishRequest};
use crate::sequence::SequenceGenerator;
use crate::stats::StatsCollector;
use crate::store::{CounterStore, Filter, MessageCollection, TargetMatch};
use crate::subscriptions::{MessageStream, RetryPolicy, SubscribeOptions, Subscriber};
use crate::types::{AckMode, Envelope, MessageInfo, MsgState, TargetSelector, MAX_NAME_LEN};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Queue-wide settings.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Instance identity: recorded as `sent_by` on publishes, as
    /// `received_by` on claims, and matched by name-relative target
    /// selectors. At most [`MAX_NAME_LEN`] characters.
    pub name: String,
    /// Sequence counter name; instances sharing a collection must share it.
    pub counter: String,
    /// Ack mode stamped on envelopes published through [`MessageQueue::send`].
    pub ack: AckMode,
    /// Throttle before claiming (see [`AckProtocol::with_claim_delay`]).
    pub claim_delay: Duration,
    /// Retry budget shared by publishes and subscriptions.
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counter: "messages".to_string(),
            ack: AckMode::Receipt,
            claim_delay: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }

    pub fn counter(mut self, counter: impl Into<String>) -> Self {
        self.counter = counter.into();
        self
    }

    pub fn ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    pub fn claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = delay;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What a subscription listens to.
#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub topic: Option<String>,
    pub verb: Option<String>,
    /// Resolved against the queue instance name.
    pub target: TargetSelector,
    pub options: SubscribeOptions,
}

impl Default for SubscribeRequest {
    fn default() -> Self {
        Self {
            topic: None,
            verb: None,
            target: TargetSelector::NameOrAny,
            options: SubscribeOptions::default(),
        }
    }
}

impl SubscribeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = Some(verb.into());
        self
    }

    pub fn target(mut self, target: TargetSelector) -> Self {
        self.target = target;
        self
    }

    pub fn options(mut self, options: SubscribeOptions) -> Self {
        self.options = options;
        self
    }
}

/// One named participant on a message collection.
///
/// Cheap to clone; clones share the collection, the counter store and the
/// instance identity.
#[derive(Clone)]
pub struct MessageQueue {
    collection: Arc<dyn MessageCollection>,
    sequence: SequenceGenerator,
    publisher: Publisher,
    ack: AckProtocol,
    config: QueueConfig,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageQueue {
    /// Build a queue over the given stores.
    ///
    /// Validates the instance name and makes sure the collection's track
    /// field is indexed before any traffic flows.
    pub fn new(
        collection: Arc<dyn MessageCollection>,
        counters: Arc<dyn CounterStore>,
        config: QueueConfig,
    ) -> Result<Self> {
        if config.name.is_empty() {
            return Err(QueueError::Config("queue name is empty".to_string()));
        }
        if config.name.len() > MAX_NAME_LEN {
            return Err(QueueError::Config(format!(
                "queue name '{}' exceeds {} characters",
                config.name, MAX_NAME_LEN
            )));
        }

        collection.ensure_track_index()?;

        let sequence = SequenceGenerator::new(counters);
        let publisher = Publisher::new(
            Arc::clone(&collection),
            sequence.clone(),
            config.counter.clone(),
            config.name.clone(),
        )
        .with_retry(config.retry.clone());
        let ack = AckProtocol::new(Arc::clone(&collection), config.name.clone())
            .with_claim_delay(config.claim_delay);

        Ok(Self {
            collection,
            sequence,
            publisher,
            ack,
            config,
        })
    }

    /// Instance identity.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Publish an envelope as this instance.
    pub fn publish(&self, request: PublishRequest) -> Result<Envelope> {
        self.publisher.publish(request)
    }

    /// Publish on a spawned thread.
    pub fn publish_async(&self, request: PublishRequest) -> PublishHandle {
        self.publisher.publish_async(request)
    }

    /// Convenience publish with the queue's configured ack mode.
    pub fn send(
        &self,
        topic: impl Into<String>,
        verb: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Envelope> {
        self.publish(
            PublishRequest::new(payload)
                .topic(topic)
                .verb(verb)
                .ack(self.config.ack),
        )
    }

    /// Publish a result envelope for a processed request.
    ///
    /// The result carries the request's routing, links the request as its
    /// parent, targets whoever sent it, and asks for no acknowledgement.
    pub fn publish_result(
        &self,
        request: &Envelope,
        payload: serde_json::Value,
    ) -> Result<Envelope> {
        self.publish(
            PublishRequest::new(payload)
                .topic(request.routing.topic.clone())
                .verb(request.routing.verb.clone())
                .target(request.status.sent_by.clone())
                .ack(AckMode::None)
                .parent(request.id.sequence),
        )
    }

    /// Subscribe with the acknowledgement protocol engaged.
    ///
    /// Every yielded envelope requesting acknowledgement has been claimed by
    /// this instance (state `Received`); envelopes another consumer claimed
    /// first are skipped. Envelopes with [`AckMode::None`] pass through
    /// untouched.
    pub fn subscribe(&self, request: SubscribeRequest) -> Result<MessageStream<Envelope>> {
        let subscriber = self.subscriber(&request)?;
        let ack = self.ack.clone();
        Ok(subscriber.stream(move |doc| match doc.ack {
            AckMode::None => Ok(Some(doc)),
            AckMode::Receipt | AckMode::Results => ack.claim(&doc),
        }))
    }

    /// Subscribe without claiming anything: a plain read-side view of the
    /// stream, useful for observers and result listeners.
    pub fn subscribe_raw(&self, request: SubscribeRequest) -> Result<MessageStream<Envelope>> {
        Ok(self.subscriber(&request)?.envelopes())
    }

    fn subscriber(&self, request: &SubscribeRequest) -> Result<Subscriber> {
        let filter = Filter {
            topic: request.topic.clone(),
            verb: request.verb.clone(),
            target: self.resolve_target(&request.target),
            ..Filter::default()
        };
        Subscriber::new(
            Arc::clone(&self.collection),
            filter,
            request.options.clone(),
        )
    }

    /// Resolve a name-relative target selector to a concrete match.
    fn resolve_target(&self, selector: &TargetSelector) -> Option<TargetMatch> {
        match selector {
            TargetSelector::Any => None,
            TargetSelector::Name => Some(TargetMatch::Exact(self.config.name.clone())),
            TargetSelector::NameOrAny => {
                Some(TargetMatch::ExactOrNone(self.config.name.clone()))
            }
            TargetSelector::NamePrefix => Some(TargetMatch::Prefix(self.config.name.clone())),
            TargetSelector::Literal(value) => Some(TargetMatch::Exact(value.clone())),
        }
    }

    /// Mark an envelope this instance claimed as terminal.
    pub fn complete(&self, envelope: &Envelope, state: MsgState) -> Result<Envelope> {
        self.ack.complete(envelope, state)
    }

    /// Monitoring over this queue's collection.
    pub fn stats(&self) -> StatsCollector {
        StatsCollector::new(Arc::clone(&self.collection))
    }

    /// Delivery timings for one envelope.
    pub fn info(&self, envelope: &Envelope) -> MessageInfo {
        envelope.info()
    }

    /// Drop every message and restart sequencing from 1.
    ///
    /// Running subscribers observe this as a dead cursor.
    pub fn reset(&self) -> Result<()> {
        self.collection.clear()?;
        self.sequence.reset(&self.config.counter)?;
        info!(queue = %self.config.name, "queue reset");
        Ok(())
    }
}
