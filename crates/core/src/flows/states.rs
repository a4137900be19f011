use serde::{Deserialize, Serialize};

use crate::domain::session::PendingAction;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "action", rename_all = "snake_case")]
pub enum PendingEvent {
    Open(PendingAction),
    Resolved,
    Expired,
    /// A fresh message unrelated to the pending action arrived.
    Superseded,
    HandoffReleased,
}

impl PendingEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
            Self::Superseded => "superseded",
            Self::HandoffReleased => "handoff_released",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: Option<PendingAction>,
    pub to: Option<PendingAction>,
    pub event: PendingEvent,
}

impl TransitionOutcome {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub(crate) fn label_of(pending: Option<&PendingAction>) -> &'static str {
    pending.map(PendingAction::label).unwrap_or("none")
}
