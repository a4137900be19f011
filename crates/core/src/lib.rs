pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ontology;
pub mod scheduler;
pub mod text;

pub use domain::message::{EgressReply, Message, SenderType, SessionId};
pub use domain::session::{
    AgentKind, ContinuationId, ExpiryPolicy, MessageBatch, PendingAction, SessionState,
    VersionToken, VersionedSession,
};
pub use domain::turn::{
    AgentResult, CarryState, PendingChange, PendingRelease, RoutingDecision, RoutingReason,
    ScheduledContinuation, StateMutation,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, HOLD_REPLY};
pub use flows::{PendingEvent, PendingFlow, PendingTransitionError};
pub use ontology::{LoadError, LookupError, OntologyFact, OntologyIndex};
pub use scheduler::{
    ContinuationFire, ContinuationPayload, ExecutionHandle, SchedulingError, WorkflowScheduler,
};
