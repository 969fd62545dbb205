//! Subscription machinery: resume-point computation and the read loop.

mod cursor;
mod subscriber;

pub use cursor::{CursorStrategy, ResumeFrom};
pub use subscriber::{
    MessageStream, RetryPolicy, StopHandle, SubscribeOptions, Subscriber, SubscriberState,
};
