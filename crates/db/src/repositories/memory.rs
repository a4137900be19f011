use std::collections::HashMap;

use tokio::sync::RwLock;

use concierge_core::domain::message::SessionId;
use concierge_core::domain::session::{SessionState, VersionToken, VersionedSession};

use super::{RepositoryError, SessionStore};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, VersionedSession>>,
}

impl InMemorySessionStore {
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<VersionedSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id.as_str()).cloned())
    }

    async fn put(
        &self,
        state: SessionState,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.get(state.session_id.as_str()).map(|session| session.version);

        let version = match (stored, expected) {
            (None, None) => VersionToken::initial(),
            (Some(current), Some(expected)) if current == expected => current.next(),
            _ => return Err(RepositoryError::conflict(&state.session_id, expected)),
        };

        sessions.insert(state.session_id.0.clone(), VersionedSession { state, version });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use concierge_core::domain::message::SessionId;
    use concierge_core::domain::session::{AgentKind, SessionState};

    use crate::repositories::{InMemorySessionStore, SessionStore};

    fn state(id: &str, turns: u64) -> SessionState {
        let mut state = SessionState::new(SessionId::new(id), Utc::now());
        state.turn_count = turns;
        state
    }

    #[tokio::test]
    async fn missing_session_reads_as_empty() {
        let store = InMemorySessionStore::default();
        let found = store.get(&SessionId::new("chat-none")).await.expect("get");
        assert!(found.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn create_then_conditional_update_advances_version() {
        let store = InMemorySessionStore::default();
        let first = store.put(state("chat-1", 1), None).await.expect("create");

        let mut next = state("chat-1", 2);
        next.current_agent = Some(AgentKind::Product);
        let second = store.put(next, Some(first)).await.expect("update");
        assert_ne!(first, second);

        let found = store.get(&SessionId::new("chat-1")).await.expect("get").expect("present");
        assert_eq!(found.version, second);
        assert_eq!(found.state.turn_count, 2);
        assert_eq!(found.state.current_agent, Some(AgentKind::Product));
    }

    #[tokio::test]
    async fn create_without_token_conflicts_when_record_exists() {
        let store = InMemorySessionStore::default();
        store.put(state("chat-1", 1), None).await.expect("create");

        let error = store.put(state("chat-1", 1), None).await.expect_err("duplicate create");
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn stale_token_conflicts_and_keeps_winner() {
        let store = Arc::new(InMemorySessionStore::default());
        let base = store.put(state("chat-1", 1), None).await.expect("create");

        let left = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put(state("chat-1", 2), Some(base)).await })
        };
        let right = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put(state("chat-1", 3), Some(base)).await })
        };
        let results = [left.await.expect("join"), right.await.expect("join")];

        let successes = results.iter().filter(|result| result.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|result| matches!(result, Err(error) if error.is_conflict()))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        let stored = store.get(&SessionId::new("chat-1")).await.expect("get").expect("present");
        let winner = results.iter().find_map(|result| result.as_ref().ok()).expect("one winner");
        assert_eq!(&stored.version, winner);
    }

    #[tokio::test]
    async fn update_of_missing_session_conflicts() {
        let store = InMemorySessionStore::default();
        let error = store
            .put(state("chat-2", 1), Some(concierge_core::VersionToken::initial()))
            .await
            .expect_err("nothing to update");
        assert!(error.is_conflict());
        assert_eq!(store.len().await, 0);
    }
}
