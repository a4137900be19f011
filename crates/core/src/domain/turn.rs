use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::session::{AgentKind, PendingAction};
use crate::ontology::MatchStrength;
use crate::scheduler::ContinuationPayload;

/// Why the router picked its target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingReason {
    OntologyMatch { term: String, strength: MatchStrength },
    ExplicitKeyword { keywords: Vec<String> },
    ContinuationResume,
    HandoffHold,
    Stickiness { tied: Vec<AgentKind> },
    Fallback,
}

impl RoutingReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OntologyMatch { .. } => "ontology_match",
            Self::ExplicitKeyword { .. } => "explicit_keyword",
            Self::ContinuationResume => "continuation_resume",
            Self::HandoffHold => "handoff_hold",
            Self::Stickiness { .. } => "stickiness",
            Self::Fallback => "fallback",
        }
    }
}

/// Why a pending action was dropped before fresh classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingRelease {
    Expired,
    Superseded,
}

/// Context handed from the router to the selected agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryState {
    pub pending: Option<PendingAction>,
    pub product_id: Option<String>,
    pub policy_id: Option<String>,
    pub continuation: Option<ContinuationPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: AgentKind,
    pub reason: RoutingReason,
    pub carry: CarryState,
    pub release: Option<PendingRelease>,
    pub scores: BTreeMap<AgentKind, u32>,
}

impl RoutingDecision {
    pub fn new(target: AgentKind, reason: RoutingReason) -> Self {
        Self { target, reason, carry: CarryState::default(), release: None, scores: BTreeMap::new() }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self.reason, RoutingReason::ContinuationResume)
    }
}

/// What an agent wants done to the pending-action slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "action", rename_all = "snake_case")]
pub enum PendingChange {
    #[default]
    Keep,
    Open(PendingAction),
    Resolve,
}

/// Partial update to a session, applied by the runtime in a single conditional write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMutation {
    pub pending: PendingChange,
    pub set_slots: BTreeMap<String, String>,
    pub clear_slots: Vec<String>,
}

impl StateMutation {
    pub fn open(pending: PendingAction) -> Self {
        Self { pending: PendingChange::Open(pending), ..Self::default() }
    }

    pub fn resolve() -> Self {
        Self { pending: PendingChange::Resolve, ..Self::default() }
    }

    pub fn with_slot(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_slots.insert(name.into(), value.into());
        self
    }

    pub fn clearing_slot(mut self, name: impl Into<String>) -> Self {
        self.clear_slots.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.pending, PendingChange::Keep)
            && self.set_slots.is_empty()
            && self.clear_slots.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledContinuation {
    pub delay: Duration,
    pub payload: ContinuationPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub reply_text: String,
    pub mutation: StateMutation,
    pub continuation: Option<ScheduledContinuation>,
}

impl AgentResult {
    pub fn reply(reply_text: impl Into<String>) -> Self {
        Self { reply_text: reply_text.into(), mutation: StateMutation::default(), continuation: None }
    }

    pub fn with_mutation(mut self, mutation: StateMutation) -> Self {
        self.mutation = mutation;
        self
    }

    pub fn with_continuation(mut self, continuation: ScheduledContinuation) -> Self {
        self.continuation = Some(continuation);
        self
    }
}
