use async_trait::async_trait;
use thiserror::Error;

use concierge_core::domain::message::SessionId;
use concierge_core::domain::session::{SessionState, VersionToken, VersionedSession};

pub mod memory;
pub mod session;

pub use memory::InMemorySessionStore;
pub use session::{SqlSessionStore, DEFAULT_SESSION_TABLE};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("session `{session_id}` changed since version {expected}")]
    Conflict { session_id: SessionId, expected: String },
    #[error("invalid session table name `{0}`")]
    InvalidTable(String),
}

impl RepositoryError {
    pub fn conflict(session_id: &SessionId, expected: Option<VersionToken>) -> Self {
        Self::Conflict {
            session_id: session_id.clone(),
            expected: expected.map(|token| token.to_string()).unwrap_or_else(|| "none".to_owned()),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Versioned per-session state with conditional writes.
///
/// `put(state, None)` creates the record only if none exists. `put(state, Some(v))` replaces it
/// only while the stored version is still `v`. Any other case is `RepositoryError::Conflict`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &SessionId)
        -> Result<Option<VersionedSession>, RepositoryError>;

    async fn put(
        &self,
        state: SessionState,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, RepositoryError>;
}
