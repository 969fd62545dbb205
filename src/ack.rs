//! Acknowledgement protocol.
//!
//! Lifecycle: `Sent -> Received -> {Success, Fail, Custom>=10}`. Both
//! transitions are conditional atomic updates on the backing store; the
//! claim's state precondition is what guarantees at most one consumer wins
//! an envelope under concurrent competition.

use crate::error::{QueueError, Result};
use crate::store::{Filter, MessageCollection, StatusUpdate};
use crate::types::{DeliveryStatus, Envelope, MsgState, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Claims and completes envelopes on behalf of one named consumer.
#[derive(Clone)]
pub struct AckProtocol {
    collection: Arc<dyn MessageCollection>,
    /// Consumer identity recorded in `received_by`.
    consumer: String,
    /// Optional throttle before claiming. Raising it on a loaded consumer
    /// shifts contended messages toward less-loaded competitors.
    claim_delay: Duration,
}

impl AckProtocol {
    pub fn new(collection: Arc<dyn MessageCollection>, consumer: impl Into<String>) -> Self {
        Self {
            collection,
            consumer: consumer.into(),
            claim_delay: Duration::ZERO,
        }
    }

    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = delay;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Try to claim an envelope for this consumer.
    ///
    /// Succeeds only while the stored document is still `Sent`; returns the
    /// updated envelope, or `None` when another consumer won the race.
    /// Losing is benign contention, not an error.
    pub fn claim(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        if !self.claim_delay.is_zero() {
            std::thread::sleep(self.claim_delay);
        }

        let filter = Filter {
            id: Some(envelope.id),
            state: Some(MsgState::Sent),
            ..Filter::default()
        };
        let update = StatusUpdate {
            state: Some(MsgState::Received),
            received_by_raw: Some(DeliveryStatus::pad_name(&self.consumer)),
            received_at: Some(Timestamp::now()),
            completed_at: None,
        };

        let claimed = self.collection.find_one_and_update(&filter, &update)?;
        if claimed.is_none() {
            debug!(id = ?envelope.id, "claim lost to another consumer");
        }
        Ok(claimed)
    }

    /// Mark a claimed envelope terminal.
    ///
    /// The precondition (still `Received`, claimed by this consumer) not
    /// holding means a double completion or completing someone else's claim:
    /// an integrity error, never retried.
    pub fn complete(&self, envelope: &Envelope, final_state: MsgState) -> Result<Envelope> {
        if !final_state.is_terminal() {
            return Err(QueueError::Integrity(format!(
                "completion state must be terminal, got {:?}",
                final_state
            )));
        }

        let filter = Filter {
            id: Some(envelope.id),
            state: Some(MsgState::Received),
            received_by: Some(DeliveryStatus::pad_name(&self.consumer)),
            ..Filter::default()
        };
        let update = StatusUpdate {
            state: Some(final_state),
            received_by_raw: None,
            received_at: None,
            completed_at: Some(Timestamp::now()),
        };

        self.collection
            .find_one_and_update(&filter, &update)?
            .ok_or_else(|| {
                QueueError::Integrity(format!(
                    "message {:?} not claimed by '{}' (double completion?)",
                    envelope.id, self.consumer
                ))
            })
    }
}
