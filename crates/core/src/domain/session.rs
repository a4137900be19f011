use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::message::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Product,
    Delivery,
    General,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [Self::Product, Self::Delivery, Self::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Delivery => "delivery",
            Self::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "product" => Some(Self::Product),
            "delivery" => Some(Self::Delivery),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque optimistic-concurrency token issued by the session store on every write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionToken(u64);

impl VersionToken {
    pub fn initial() -> Self {
        Self(1)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationId(pub String);

impl ContinuationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker for a conversation that is mid-flow awaiting a specific kind of follow-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    Clarification {
        agent: AgentKind,
        slot: String,
        candidates: Vec<String>,
        opened_at_turn: u64,
        window_turns: u32,
        opened_at: DateTime<Utc>,
    },
    StatusCheck {
        continuation_id: ContinuationId,
        order_ref: Option<String>,
        requested_at: DateTime<Utc>,
    },
    HumanHandoff {
        reason: String,
        flagged_at: DateTime<Utc>,
    },
}

/// Time windows after which a non-terminal pending action stops being resumable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub clarification_ttl: Duration,
    pub status_check_ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self { clarification_ttl: Duration::seconds(600), status_check_ttl: Duration::seconds(900) }
    }
}

impl PendingAction {
    pub fn agent(&self) -> AgentKind {
        match self {
            Self::Clarification { agent, .. } => *agent,
            Self::StatusCheck { .. } => AgentKind::Delivery,
            Self::HumanHandoff { .. } => AgentKind::General,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Clarification { .. } => "clarification",
            Self::StatusCheck { .. } => "status_check",
            Self::HumanHandoff { .. } => "human_handoff",
        }
    }

    pub fn is_handoff(&self) -> bool {
        matches!(self, Self::HumanHandoff { .. })
    }

    /// `incoming_turn` is the turn number the message being routed would receive.
    /// A human handoff never expires on its own.
    pub fn is_expired(&self, incoming_turn: u64, now: DateTime<Utc>, policy: &ExpiryPolicy) -> bool {
        match self {
            Self::Clarification { opened_at_turn, window_turns, opened_at, .. } => {
                let turns_elapsed = incoming_turn.saturating_sub(*opened_at_turn);
                turns_elapsed > u64::from(*window_turns)
                    || now - *opened_at > policy.clarification_ttl
            }
            Self::StatusCheck { requested_at, .. } => now - *requested_at > policy.status_check_ttl,
            Self::HumanHandoff { .. } => false,
        }
    }
}

/// Customer messages held back during the batch window, answered together when it closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Rotated on every buffered message; only the flush carrying the latest id may answer.
    pub batch_id: ContinuationId,
    pub texts: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

impl MessageBatch {
    pub fn open(text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self { batch_id: ContinuationId::generate(), texts: vec![text.into()], opened_at: now }
    }

    /// Appends `text` and issues a fresh id so earlier flushes go stale.
    pub fn push(&mut self, text: impl Into<String>) {
        self.texts.push(text.into());
        self.batch_id = ContinuationId::generate();
    }

    /// Buffered texts joined by a single space, trimmed.
    pub fn joined(&self) -> String {
        self.texts
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub current_agent: Option<AgentKind>,
    pub pending_action: Option<PendingAction>,
    pub slots: BTreeMap<String, String>,
    pub turn_count: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<MessageBatch>,
}

impl SessionState {
    /// The empty starting state for a session that has never been written.
    pub fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            current_agent: None,
            pending_action: None,
            slots: BTreeMap::new(),
            turn_count: 0,
            last_updated: now,
            batch: None,
        }
    }

    pub fn next_turn(&self) -> u64 {
        self.turn_count.saturating_add(1)
    }

    pub fn slot(&self, name: &str) -> Option<&str> {
        self.slots.get(name).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedSession {
    pub state: SessionState,
    pub version: VersionToken,
}
