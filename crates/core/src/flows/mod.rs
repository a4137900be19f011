pub mod engine;
pub mod states;

pub use engine::{PendingFlow, PendingTransitionError};
pub use states::{PendingEvent, TransitionOutcome};
