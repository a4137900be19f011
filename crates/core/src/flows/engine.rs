use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::session::PendingAction;
use crate::flows::states::{label_of, PendingEvent, TransitionOutcome};

/// State machine over the single pending-action slot of a session.
///
/// A `HumanHandoff` is terminal for automation: only `HandoffReleased` leaves it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingFlow;

impl PendingFlow {
    pub fn apply(
        &self,
        current: Option<&PendingAction>,
        event: &PendingEvent,
    ) -> Result<TransitionOutcome, PendingTransitionError> {
        let to = match (current, event) {
            (Some(PendingAction::HumanHandoff { .. }), PendingEvent::HandoffReleased) => None,
            (_, PendingEvent::HandoffReleased) => {
                return Err(PendingTransitionError::NotInHandoff {
                    current: label_of(current).to_owned(),
                });
            }
            (Some(held @ PendingAction::HumanHandoff { .. }), PendingEvent::Open(next))
                if next.is_handoff() =>
            {
                Some(held.clone())
            }
            (Some(PendingAction::HumanHandoff { .. }), _) => {
                return Err(PendingTransitionError::HandoffLocked {
                    event: event.label().to_owned(),
                });
            }
            (_, PendingEvent::Open(next)) => Some(next.clone()),
            (_, PendingEvent::Resolved | PendingEvent::Expired | PendingEvent::Superseded) => None,
        };

        Ok(TransitionOutcome { from: current.cloned(), to, event: event.clone() })
    }

    pub fn apply_with_audit<S>(
        &self,
        current: Option<&PendingAction>,
        event: &PendingEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, PendingTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event);
        match &result {
            Ok(outcome) => sink.emit(
                audit
                    .event("pending.transition_applied", AuditCategory::Session, AuditOutcome::Success)
                    .with_metadata("from", label_of(outcome.from.as_ref()))
                    .with_metadata("to", label_of(outcome.to.as_ref()))
                    .with_metadata("event", event.label()),
            ),
            Err(error) => sink.emit(
                audit
                    .event(
                        "pending.transition_rejected",
                        AuditCategory::Session,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PendingTransitionError {
    #[error("session is held for human handoff; `{event}` requires an external release first")]
    HandoffLocked { event: String },
    #[error("handoff release requested but pending action is `{current}`")]
    NotInHandoff { current: String },
}
