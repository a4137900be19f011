use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use concierge_core::config::is_sql_identifier;
use concierge_core::domain::message::SessionId;
use concierge_core::domain::session::{SessionState, VersionToken, VersionedSession};

use super::{RepositoryError, SessionStore};
use crate::DbPool;

/// Table created by the bundled migrations.
pub const DEFAULT_SESSION_TABLE: &str = "session_state";

pub struct SqlSessionStore {
    pool: DbPool,
    table: String,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, table: DEFAULT_SESSION_TABLE.to_owned() }
    }

    /// The name is interpolated into SQL, so only plain identifiers are accepted.
    pub fn with_table(pool: DbPool, table: impl Into<String>) -> Result<Self, RepositoryError> {
        let table = table.into();
        if !is_sql_identifier(&table) {
            return Err(RepositoryError::InvalidTable(table));
        }
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates a configured non-default table with the migration schema.
    pub async fn ensure_table(&self) -> Result<(), RepositoryError> {
        let table = &self.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                session_id TEXT PRIMARY KEY NOT NULL,
                state_json TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version > 0),
                current_agent TEXT,
                pending_kind TEXT,
                turn_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
             )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(&self, state: &SessionState, state_json: &str) -> Result<u64, RepositoryError> {
        let version = VersionToken::initial();
        let result = sqlx::query(&format!(
            "INSERT INTO {} (
                session_id,
                state_json,
                version,
                current_agent,
                pending_kind,
                turn_count,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO NOTHING",
            self.table
        ))
        .bind(state.session_id.as_str())
        .bind(state_json)
        .bind(to_db_version(version)?)
        .bind(state.current_agent.map(|agent| agent.as_str()))
        .bind(state.pending_action.as_ref().map(|pending| pending.label()))
        .bind(to_db_count(state.turn_count)?)
        .bind(state.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update(
        &self,
        state: &SessionState,
        state_json: &str,
        expected: VersionToken,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(&format!(
            "UPDATE {}
             SET state_json = ?,
                 version = ?,
                 current_agent = ?,
                 pending_kind = ?,
                 turn_count = ?,
                 updated_at = ?
             WHERE session_id = ? AND version = ?",
            self.table
        ))
        .bind(state_json)
        .bind(to_db_version(expected.next())?)
        .bind(state.current_agent.map(|agent| agent.as_str()))
        .bind(state.pending_action.as_ref().map(|pending| pending.label()))
        .bind(to_db_count(state.turn_count)?)
        .bind(state.last_updated.to_rfc3339())
        .bind(state.session_id.as_str())
        .bind(to_db_version(expected)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<VersionedSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT state_json, version FROM {} WHERE session_id = ?",
            self.table
        ))
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn put(
        &self,
        state: SessionState,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken, RepositoryError> {
        let state_json = serde_json::to_string(&state)
            .map_err(|error| RepositoryError::Decode(format!("encode session state: {error}")))?;

        let (affected, version) = match expected {
            None => (self.insert(&state, &state_json).await?, VersionToken::initial()),
            Some(expected) => (self.update(&state, &state_json, expected).await?, expected.next()),
        };

        if affected == 0 {
            debug!(
                event_name = "session_store.conflict",
                session_id = %state.session_id,
                expected = ?expected,
                "conditional write lost"
            );
            return Err(RepositoryError::conflict(&state.session_id, expected));
        }
        Ok(version)
    }
}

fn session_from_row(row: SqliteRow) -> Result<VersionedSession, RepositoryError> {
    let state_json = row.try_get::<String, _>("state_json")?;
    let state = serde_json::from_str::<SessionState>(&state_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid state_json: {error}")))?;
    let raw_version = row.try_get::<i64, _>("version")?;
    let version = u64::try_from(raw_version)
        .ok()
        .filter(|version| *version > 0)
        .map(VersionToken::from_raw)
        .ok_or_else(|| {
            RepositoryError::Decode(format!("invalid value for `version`: {raw_version}"))
        })?;

    Ok(VersionedSession { state, version })
}

fn to_db_version(version: VersionToken) -> Result<i64, RepositoryError> {
    i64::try_from(version.as_raw())
        .map_err(|_| RepositoryError::Decode(format!("version {version} exceeds storage range")))
}

fn to_db_count(count: u64) -> Result<i64, RepositoryError> {
    i64::try_from(count)
        .map_err(|_| RepositoryError::Decode(format!("turn count {count} exceeds storage range")))
}
