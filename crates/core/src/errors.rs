use thiserror::Error;

use crate::flows::PendingTransitionError;

/// The only text a user ever sees when a turn fails.
pub const HOLD_REPLY: &str =
    "보다 정확하고 친절한 안내를 위해 확인 중입니다. 잠시 기다려주시면 빠른 응대 도와드리겠습니다.";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    PendingTransition(#[from] PendingTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("ontology unavailable: {0}")]
    OntologyUnavailable(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("concurrent update: gave up after {attempts} attempts")]
    ConcurrentUpdate { attempts: u32 },
    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    /// Diagnostics stay in logs; chat users only get the hold reply.
    pub fn user_message(&self) -> &'static str {
        HOLD_REPLY
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::Conflict { .. } => "conflict",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate { .. } | Self::Timeout { .. })
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::ConcurrentUpdate { attempts } => Self::Conflict {
                message: format!("gave up after {attempts} attempts"),
                correlation_id,
            },
            ApplicationError::Timeout { operation } => Self::ServiceUnavailable {
                message: format!("timed out waiting for {operation}"),
                correlation_id,
            },
            ApplicationError::Persistence(message)
            | ApplicationError::Integration(message)
            | ApplicationError::OntologyUnavailable(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
