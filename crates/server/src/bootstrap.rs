use std::sync::Arc;

use concierge_agent::{RuntimeSettings, TurnRuntime};
use concierge_channel::{
    blob_source_from_config, chat_history_from_config, reply_sink_from_config, ChatHistory,
    EgressError, HttpWorkflowScheduler, LocalWorkflowScheduler, ReplySink,
};
use concierge_core::audit::TracingAuditSink;
use concierge_core::config::{AppConfig, ConfigError, LoadOptions, SchedulerMode};
use concierge_core::ontology::{LoadError, OntologyIndex};
use concierge_core::scheduler::{ContinuationFire, SchedulingError, WorkflowScheduler};
use concierge_db::{connect_with_settings, migrations, DbPool, RepositoryError, SqlSessionStore};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

const LOCAL_FIRE_CAPACITY: usize = 64;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub ontology: Arc<OntologyIndex>,
    pub runtime: Arc<TurnRuntime>,
    pub replies: Arc<dyn ReplySink>,
    /// Present when the channel API is configured.
    pub history: Option<Arc<dyn ChatHistory>>,
    /// Present only in local scheduler mode; drained by the fire loop.
    pub fires: Option<mpsc::Receiver<ContinuationFire>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("ontology unavailable, refusing to serve: {0}")]
    Ontology(#[source] LoadError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("session store setup failed: {0}")]
    SessionStore(#[source] RepositoryError),
    #[error("workflow scheduler setup failed: {0}")]
    Scheduler(#[source] SchedulingError),
    #[error("channel egress setup failed: {0}")]
    Egress(#[source] EgressError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        session_id = "unknown",
        "starting application bootstrap"
    );

    let source = blob_source_from_config(&config.ontology)
        .map_err(|error| BootstrapError::Ontology(LoadError::Fetch(error)))?;
    let ontology = OntologyIndex::load_from(
        source.as_ref(),
        &config.ontology.location(),
        config.ontology.max_bytes,
    )
    .await
    .map_err(BootstrapError::Ontology)?;
    let stats = ontology.stats();
    info!(
        event_name = "system.bootstrap.ontology_loaded",
        correlation_id = "bootstrap",
        session_id = "unknown",
        namespace = stats.namespace.as_deref().unwrap_or("default"),
        products = stats.products,
        policies = stats.policies,
        "ontology index built"
    );
    let ontology = Arc::new(ontology);

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        session_id = "unknown",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    let store = SqlSessionStore::with_table(db_pool.clone(), config.session.table.clone())
        .map_err(BootstrapError::SessionStore)?;
    store.ensure_table().await.map_err(BootstrapError::SessionStore)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        session_id = "unknown",
        table = store.table(),
        "session table ready"
    );

    let (scheduler, fires): (Arc<dyn WorkflowScheduler>, _) = match config.scheduler.mode {
        SchedulerMode::Local => {
            let (scheduler, fires) =
                LocalWorkflowScheduler::new(config.scheduler.target.clone(), LOCAL_FIRE_CAPACITY);
            (Arc::new(scheduler), Some(fires))
        }
        SchedulerMode::Http => {
            let scheduler = HttpWorkflowScheduler::from_config(&config.scheduler)
                .map_err(BootstrapError::Scheduler)?;
            (Arc::new(scheduler), None)
        }
    };

    let replies = reply_sink_from_config(&config.channel).map_err(BootstrapError::Egress)?;
    let history = chat_history_from_config(&config.channel).map_err(BootstrapError::Egress)?;
    info!(
        event_name = "system.bootstrap.channel_ready",
        correlation_id = "bootstrap",
        session_id = "unknown",
        egress = if config.channel.egress_enabled() { "channel_api" } else { "noop" },
        scheduler = ?config.scheduler.mode,
        "channel adapters initialized"
    );

    let settings = RuntimeSettings::from_config(&config);
    let runtime = Arc::new(TurnRuntime::new(
        Arc::new(store),
        ontology.clone(),
        scheduler,
        Arc::new(TracingAuditSink),
        settings,
    ));

    Ok(Application { config, db_pool, ontology, runtime, replies, history, fires })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use concierge_core::config::{AppConfig, ConfigOverrides, LoadOptions, SchedulerMode};
    use concierge_core::domain::message::{Message, SessionId};
    use concierge_db::{SessionStore, SqlSessionStore};

    use crate::bootstrap::{bootstrap, bootstrap_with_config, BootstrapError};

    const ONTOLOGY: &str = include_str!("../../../data/concierge-ontology/ontology.json");

    fn ontology_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("concierge-ontology")).expect("bucket dir");
        fs::write(dir.path().join("concierge-ontology/ontology.json"), ONTOLOGY).expect("write");
        dir
    }

    fn config_for(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;
        config.ontology.base = dir.path().display().to_string();
        config.scheduler.mode = SchedulerMode::Local;
        config
    }

    #[tokio::test]
    async fn bootstrap_refuses_to_serve_without_ontology() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ontology_base: Some(dir.path().display().to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let error = result.err().expect("bootstrap must fail");
        assert!(matches!(error, BootstrapError::Ontology(_)), "unexpected error {error}");
        assert!(error.to_string().contains("refusing to serve"));
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_session_table() {
        let dir = ontology_dir();
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ontology_base: Some(dir.path().display().to_string()),
                session_table: Some("bad-name".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }

    #[tokio::test]
    async fn bootstrap_wires_runtime_against_sql_store() {
        let dir = ontology_dir();
        let mut config = config_for(&dir);
        config.session.table = "concierge_sessions".to_string();

        let app = bootstrap_with_config(config).await.expect("bootstrap succeeds");
        assert!(app.fires.is_some(), "local mode keeps the fire receiver");
        assert!(app.ontology.stats().products > 0);

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('session_state', 'concierge_sessions')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("table lookup");
        assert_eq!(table_count, 2);

        let outcome = app
            .runtime
            .handle_message(Message::from_user("chat-boot", "배송비 얼마예요?"), "req-boot")
            .await;
        assert!(outcome.reply().is_some());

        let store = SqlSessionStore::with_table(app.db_pool.clone(), "concierge_sessions")
            .expect("valid table");
        let stored = store.get(&SessionId::new("chat-boot")).await.expect("read").expect("stored");
        assert_eq!(stored.state.turn_count, 1);

        app.db_pool.close().await;
    }
}
