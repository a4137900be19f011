use std::sync::Arc;

use chrono::Utc;

use concierge_core::domain::message::SessionId;
use concierge_core::domain::session::{AgentKind, SessionState, VersionToken};
use concierge_db::{
    connect_with_settings, migrations, InMemorySessionStore, SessionStore, SqlSessionStore,
};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

fn state(id: &str, turns: u64) -> SessionState {
    let mut state = SessionState::new(SessionId::new(id), Utc::now());
    state.turn_count = turns;
    state
}

async fn sql_store() -> ContractResult<SqlSessionStore> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrate: {error}"))?;
    Ok(SqlSessionStore::new(pool))
}

/// N sequential read-modify-write turns leave `turn_count == N` and one version per write.
async fn sequential_turns_are_counted(store: &dyn SessionStore) -> ContractResult {
    let id = SessionId::new("chat-sequential");
    for _ in 0..5 {
        let current = store.get(&id).await.map_err(|error| error.to_string())?;
        let (mut next, expected) = match current {
            Some(versioned) => (versioned.state, Some(versioned.version)),
            None => (SessionState::new(id.clone(), Utc::now()), None),
        };
        next.turn_count += 1;
        next.current_agent = Some(AgentKind::General);
        store.put(next, expected).await.map_err(|error| error.to_string())?;
    }

    let stored = store
        .get(&id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "session should exist".to_string())?;
    require_eq!(stored.state.turn_count, 5);
    require_eq!(stored.version, VersionToken::from_raw(5));
    Ok(())
}

/// Two writers holding the same version: exactly one wins, the other conflicts.
async fn same_version_has_one_winner(store: Arc<dyn SessionStore>) -> ContractResult {
    let base = store.put(state("chat-race", 1), None).await.map_err(|error| error.to_string())?;

    let mut handles = Vec::new();
    for turns in [2_u64, 3] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.put(state("chat-race", turns), Some(base)).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.map_err(|error| error.to_string())? {
            Ok(_) => successes += 1,
            Err(error) if error.is_conflict() => conflicts += 1,
            Err(error) => return Err(format!("unexpected store error: {error}")),
        }
    }
    require_eq!(successes, 1);
    require_eq!(conflicts, 1);

    let stored = store
        .get(&SessionId::new("chat-race"))
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| "session should exist".to_string())?;
    require!(
        stored.state.turn_count == 2 || stored.state.turn_count == 3,
        "stored state must be one of the writers, got {}",
        stored.state.turn_count
    );
    require_eq!(stored.version, base.next());
    Ok(())
}

#[tokio::test]
async fn in_memory_store_honours_the_contract() -> ContractResult {
    let store = Arc::new(InMemorySessionStore::default());
    sequential_turns_are_counted(store.as_ref()).await?;
    same_version_has_one_winner(store).await
}

#[tokio::test]
async fn sql_store_honours_the_contract() -> ContractResult {
    let store = Arc::new(sql_store().await?);
    sequential_turns_are_counted(store.as_ref()).await?;
    same_version_has_one_winner(store).await
}
