//! Domain types for the switchboard coordination core
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase. Agent
//! identifiers are opaque, externally-chosen strings; message, task, and
//! approval identifiers are generated UUIDs.

use nutype::nutype;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Unique identifier for an agent
///
/// Agents register under an opaque, caller-supplied identifier. The registry
/// enforces uniqueness; this type only enforces non-emptiness.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Creates a fresh random agent ID for callers that do not supply one
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).expect("uuid is non-empty")
    }
}

/// Decentralized identifier, shaped `did:<method>:<id>`
///
/// The core never resolves or mints DIDs; it only indexes by them.
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct Did(String);

/// Free-form capability tag advertised by an agent
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CapabilityName(String);

/// Role tag attached to an agent
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct RoleName(String);

/// Unique identifier for a message
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an A2A task
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a HITL approval request
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ApprovalId(Uuid);

impl ApprovalId {
    /// Creates a new random approval request ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for a workflow definition
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Creates a new random workflow ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for a peer instance participating in federated learning
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct InstanceId(String);

/// Correlation identifier threading a message through events
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CorrelationId(String);

/// Wall-clock timestamp with helpers for monotonic advancement
///
/// Successive mutations of a record must observe strictly increasing
/// timestamps even when the system clock has sub-resolution ticks; use
/// [`Timestamp::after`] when refreshing an `updated_at` field.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into
))]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        Self::new(SystemTime::now())
    }

    /// Current wall-clock time, nudged forward if the clock has not moved
    /// past `prev`
    #[must_use]
    pub fn after(prev: Self) -> Self {
        let now = SystemTime::now();
        let floor = prev.into_inner() + Duration::from_nanos(1);
        Self::new(now.max(floor))
    }

    /// The underlying [`SystemTime`]
    #[must_use]
    pub fn as_system_time(&self) -> SystemTime {
        self.into_inner()
    }

    /// This timestamp shifted `secs` seconds into the future
    #[must_use]
    pub fn plus_secs(&self, secs: u64) -> Self {
        Self::new(self.into_inner() + Duration::from_secs(secs))
    }

    /// Whether the wall clock has passed this timestamp
    #[must_use]
    pub fn is_past(&self) -> bool {
        SystemTime::now() > self.into_inner()
    }

    /// Duration from now until this timestamp, zero if already past
    #[must_use]
    pub fn until(&self) -> Duration {
        self.into_inner()
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}
