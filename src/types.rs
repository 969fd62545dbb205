//! Core types for the message queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of a queue/consumer instance name.
///
/// `received_by` is stored padded to this width so that claiming a message
/// never grows the stored document (capped collections reject growing
/// in-place updates).
pub const MAX_NAME_LEN: usize = 32;

/// Monotonically increasing message sequence number.
///
/// Globally unique across the life of the backing collection; the sole
/// ordering key for delivery and resumption.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Sentinel for "not yet happened". Stored instead of a null so the
    /// document shape stays fixed for in-place updates.
    pub const UNSET: Timestamp = Timestamp(0);

    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    pub fn is_unset(&self) -> bool {
        *self == Timestamp::UNSET
    }

    /// Seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1_000_000.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Message lifecycle state.
///
/// `Sent` is the initial state; `Success`, `Fail` and `Custom` codes are
/// terminal. Transitioning past `Sent` requires a successful atomic claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MsgState {
    /// Unknown / unset.
    Unknown,
    /// Published, not yet picked up.
    Sent,
    /// Claimed for processing by exactly one consumer.
    Received,
    /// Processed successfully.
    Success,
    /// Processed but failed.
    Fail,
    /// Domain-specific terminal code (>= 10).
    Custom(u32),
}

impl MsgState {
    /// Wire code for this state.
    pub fn code(&self) -> u32 {
        match self {
            MsgState::Unknown => 0,
            MsgState::Sent => 1,
            MsgState::Received => 2,
            MsgState::Success => 3,
            MsgState::Fail => 4,
            MsgState::Custom(c) => *c,
        }
    }

    /// Decode a wire code. Codes in 5..10 are reserved and rejected.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MsgState::Unknown),
            1 => Some(MsgState::Sent),
            2 => Some(MsgState::Received),
            3 => Some(MsgState::Success),
            4 => Some(MsgState::Fail),
            c if c >= 10 => Some(MsgState::Custom(c)),
            _ => None,
        }
    }

    /// Build a domain-specific terminal state. Codes below 10 collide with
    /// the built-in lifecycle states.
    pub fn custom(code: u32) -> Option<Self> {
        if code >= 10 {
            Some(MsgState::Custom(code))
        } else {
            None
        }
    }

    /// Terminal states end the message lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MsgState::Success | MsgState::Fail | MsgState::Custom(_)
        )
    }

    /// Whether processing finished (successfully or not).
    /// Used by stats to split pending/in-flight from done.
    pub fn is_done(&self) -> bool {
        self.code() >= MsgState::Success.code()
    }
}

impl From<MsgState> for u32 {
    fn from(s: MsgState) -> u32 {
        s.code()
    }
}

impl TryFrom<u32> for MsgState {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, String> {
        MsgState::from_code(code).ok_or_else(|| format!("reserved message state code: {}", code))
    }
}

/// Acknowledgement requested by the publisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Fire-and-forget broadcast; consumers yield without claiming.
    None,
    /// Consumer must claim (state -> Received) before the message is yielded.
    Receipt,
    /// Claim, then publish a result envelope with this message as parent
    /// and complete.
    Results,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::Receipt
    }
}

/// Which targets a subscriber listens to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSelector {
    /// Any target, including untargeted messages.
    Any,
    /// Only messages targeting this instance by name.
    Name,
    /// Messages targeting this instance or carrying no target.
    NameOrAny,
    /// Messages whose target starts with this instance's name.
    NamePrefix,
    /// Messages targeting an explicit literal value.
    Literal(String),
}

/// Composite message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Unique, strictly increasing component.
    pub sequence: Sequence,
    /// Request message this one responds to (AckMode::Results).
    pub parent: Option<Sequence>,
}

impl MessageId {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            parent: None,
        }
    }

    pub fn with_parent(sequence: Sequence, parent: Sequence) -> Self {
        Self {
            sequence,
            parent: Some(parent),
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(p) => write!(f, "MessageId({} <- {})", self.sequence, p),
            None => write!(f, "MessageId({})", self.sequence),
        }
    }
}

/// Application-defined routing metadata. Opaque to the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub topic: String,
    pub verb: String,
    pub target: Option<String>,
}

/// Delivery status of an envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub state: MsgState,
    /// Name of the publishing instance.
    pub sent_by: String,
    /// Name of the claiming consumer, space-padded to [`MAX_NAME_LEN`].
    /// Use [`DeliveryStatus::received_by`] for the trimmed value.
    pub received_by_raw: String,
}

impl DeliveryStatus {
    /// Fresh status for a just-published message.
    pub fn sent(sent_by: impl Into<String>) -> Self {
        Self {
            state: MsgState::Sent,
            sent_by: sent_by.into(),
            received_by_raw: " ".repeat(MAX_NAME_LEN),
        }
    }

    /// Claiming consumer's name, or None while unclaimed.
    pub fn received_by(&self) -> Option<&str> {
        let trimmed = self.received_by_raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Pad a consumer name to the reserved width.
    pub fn pad_name(name: &str) -> String {
        format!("{:width$}", name, width = MAX_NAME_LEN)
    }
}

/// A stored message: payload plus routing and acknowledgement metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,

    /// Cursor-resumption value; equals `id.sequence` for queue-managed
    /// collections.
    pub track: Sequence,

    pub ack: AckMode,

    pub routing: Routing,

    pub status: DeliveryStatus,

    pub sent_at: Timestamp,

    /// [`Timestamp::UNSET`] until claimed.
    pub received_at: Timestamp,

    /// [`Timestamp::UNSET`] until completed.
    pub completed_at: Timestamp,

    /// Application data, opaque to the queue.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Human-readable summary with delivery latencies.
    pub fn info(&self) -> MessageInfo {
        let receive_secs = if self.status.state.code() > MsgState::Sent.code() {
            self.received_at.seconds_since(self.sent_at)
        } else {
            -1.0
        };
        let complete_secs = if self.status.state.code() > MsgState::Received.code() {
            self.completed_at.seconds_since(self.received_at)
        } else {
            -1.0
        };

        MessageInfo {
            sequence: self.id.sequence,
            parent: self.id.parent,
            state: self.status.state,
            topic: self.routing.topic.clone(),
            verb: self.routing.verb.clone(),
            target: self.routing.target.clone(),
            sent_by: self.status.sent_by.clone(),
            received_by: self.status.received_by().map(str::to_string),
            receive_secs,
            complete_secs,
        }
    }
}

/// Summary of an envelope's delivery progress (for diagnostics).
#[derive(Clone, Debug, Serialize)]
pub struct MessageInfo {
    pub sequence: Sequence,
    pub parent: Option<Sequence>,
    pub state: MsgState,
    pub topic: String,
    pub verb: String,
    pub target: Option<String>,
    pub sent_by: String,
    pub received_by: Option<String>,
    /// Seconds from publish to claim, or -1 if not yet claimed.
    pub receive_secs: f64,
    /// Seconds from claim to completion, or -1 if not yet completed.
    pub complete_secs: f64,
}
