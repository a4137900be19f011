//! Turn pipeline for the concierge: routing, domain agents and the runtime that commits each turn.
//!
//! A turn flows one way:
//! 1. **Routing** (`router`) - score the message against the ontology and keyword lists, honour
//!    pending actions (resume, expire, supersede, handoff hold).
//! 2. **Agents** (`agents`) - product, delivery or general; each returns a reply plus a
//!    `StateMutation` and never writes state itself.
//! 3. **Runtime** (`runtime`) - reads the session, applies the mutation through `PendingFlow`,
//!    writes with a single conditional put and schedules any requested continuation.
//!
//! Users only ever see agent replies or the hold reply; diagnostics stay in logs and audit events.

pub mod agents;
pub mod router;
pub mod runtime;

pub use agents::{Agent, AgentError, AgentSet, AgentSettings, TurnContext, TurnInput};
pub use router::{ContinuationRouting, Router};
pub use runtime::{RuntimeSettings, TurnError, TurnOutcome, TurnPolicy, TurnRuntime};
