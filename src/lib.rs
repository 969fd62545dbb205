//! # tailmq
//!
//! A publish/subscribe message queue layered on an append-mostly document
//! store.
//!
//! ## Core Concepts
//!
//! - **Envelopes**: Fixed-shape messages with routing, delivery status, and
//!   an opaque JSON payload
//! - **Subscriptions**: Tailing cursors over capped collections, batched
//!   track-field polling over plain ones
//! - **Acknowledgement**: `Sent -> Received -> terminal`, with at most one
//!   consumer winning each claim
//! - **Sequencing**: Collision-free message ids from atomic counters
//!
//! ## Example
//!
//! ```ignore
//! use tailmq::{MessageQueue, QueueConfig, SubscribeRequest};
//! use tailmq::store::{MemoryCollection, MemoryCounters};
//! use std::sync::Arc;
//!
//! let queue = MessageQueue::new(
//!     Arc::new(MemoryCollection::new()),
//!     Arc::new(MemoryCounters::new()),
//!     QueueConfig::new("worker-1"),
//! )?;
//!
//! // Publish a message
//! queue.send("renders", "run", serde_json::json!({"frame": 7}))?;
//!
//! // Consume with acknowledgement
//! for item in queue.subscribe(SubscribeRequest::new().topic("renders"))? {
//!     let envelope = item?;
//!     // ... work ...
//!     queue.complete(&envelope, tailmq::MsgState::Success)?;
//! }
//! ```

pub mod ack;
pub mod error;
pub mod publish;
pub mod queue;
pub mod sequence;
pub mod stats;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use ack::AckProtocol;
pub use error::{QueueError, Result};
pub use publish::{PublishHandle, Publisher, PublishRequest};
pub use queue::{MessageQueue, QueueConfig, SubscribeRequest};
pub use sequence::SequenceGenerator;
pub use stats::{QueueDepth, QueueStats, Sampler, StatsCollector, Throughput};
pub use subscriptions::{
    CursorStrategy, MessageStream, ResumeFrom, RetryPolicy, StopHandle, SubscribeOptions,
    Subscriber, SubscriberState,
};
pub use types::*;
