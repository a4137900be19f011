use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use concierge_core::domain::message::Message;
use concierge_core::domain::session::{AgentKind, SessionState};
use concierge_core::domain::turn::{AgentResult, RoutingDecision};
use concierge_core::ontology::OntologyIndex;
use concierge_core::scheduler::ContinuationPayload;

pub mod delivery;
pub mod general;
pub mod product;

pub use delivery::DeliveryAgent;
pub use general::GeneralAgent;
pub use product::ProductAgent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    pub clarification_window_turns: u32,
    pub status_check_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { clarification_window_turns: 3, status_check_delay: Duration::from_secs(60) }
    }
}

/// What re-entered the pipeline: a user message or a fired continuation.
#[derive(Clone, Copy, Debug)]
pub enum TurnInput<'a> {
    Message(&'a Message),
    Continuation(&'a ContinuationPayload),
}

impl<'a> TurnInput<'a> {
    pub fn text(&self) -> Option<&'a str> {
        match self {
            Self::Message(message) => Some(message.text.as_str()),
            Self::Continuation(_) => None,
        }
    }
}

/// Everything an agent may read. Agents never write; they describe a mutation instead.
#[derive(Clone, Copy, Debug)]
pub struct TurnContext<'a> {
    pub input: TurnInput<'a>,
    pub state: &'a SessionState,
    pub decision: &'a RoutingDecision,
    pub ontology: &'a OntologyIndex,
    pub settings: &'a AgentSettings,
    /// Turn number this input is handled as. Continuations reuse the current count.
    pub turn: u64,
    pub now: DateTime<Utc>,
}

impl<'a> TurnContext<'a> {
    pub fn text(&self) -> &'a str {
        self.input.text().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("{agent} agent needs {missing} to handle this turn")]
    MissingContext { agent: AgentKind, missing: &'static str },
}

pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;
    fn handle(&self, ctx: &TurnContext<'_>) -> Result<AgentResult, AgentError>;
}

/// The closed set of agents, selected by [`AgentKind`].
#[derive(Clone, Debug, Default)]
pub struct AgentSet {
    product: ProductAgent,
    delivery: DeliveryAgent,
    general: GeneralAgent,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: AgentKind) -> &dyn Agent {
        match kind {
            AgentKind::Product => &self.product,
            AgentKind::Delivery => &self.delivery,
            AgentKind::General => &self.general,
        }
    }

    pub fn handle(
        &self,
        kind: AgentKind,
        ctx: &TurnContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        self.get(kind).handle(ctx)
    }
}
