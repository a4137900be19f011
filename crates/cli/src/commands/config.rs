use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

impl Field {
    fn new(key: &'static str, env_key: &'static str, value: impl ToString) -> Self {
        Self { key, env_key, value: value.to_string() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        Field::new("database.url", "CONCIERGE_DATABASE_URL", &config.database.url),
        Field::new(
            "database.max_connections",
            "CONCIERGE_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
        ),
        Field::new("database.timeout_secs", "CONCIERGE_DATABASE_TIMEOUT_SECS", config.database.timeout_secs),
        Field::new("ontology.source", "CONCIERGE_ONTOLOGY_SOURCE", format!("{:?}", config.ontology.source)),
        Field::new("ontology.base", "CONCIERGE_ONTOLOGY_BASE", &config.ontology.base),
        Field::new("ontology.bucket", "CONCIERGE_ONTOLOGY_BUCKET", &config.ontology.bucket),
        Field::new("ontology.key", "CONCIERGE_ONTOLOGY_KEY", &config.ontology.key),
        Field::new("ontology.max_bytes", "CONCIERGE_ONTOLOGY_MAX_BYTES", config.ontology.max_bytes),
        Field::new("session.table", "CONCIERGE_SESSION_TABLE", &config.session.table),
        Field::new(
            "session.store_timeout_ms",
            "CONCIERGE_SESSION_STORE_TIMEOUT_MS",
            config.session.store_timeout_ms,
        ),
        Field::new(
            "session.max_turn_attempts",
            "CONCIERGE_SESSION_MAX_TURN_ATTEMPTS",
            config.session.max_turn_attempts,
        ),
        Field::new(
            "session.batch_window_secs",
            "CONCIERGE_SESSION_BATCH_WINDOW_SECS",
            config.session.batch_window_secs,
        ),
        Field::new("scheduler.mode", "CONCIERGE_SCHEDULER_MODE", format!("{:?}", config.scheduler.mode)),
        Field::new("scheduler.target", "CONCIERGE_SCHEDULER_TARGET", &config.scheduler.target),
        Field::new(
            "scheduler.endpoint",
            "CONCIERGE_SCHEDULER_ENDPOINT",
            config.scheduler.endpoint.as_deref().unwrap_or("<unset>"),
        ),
        Field::new("scheduler.timeout_ms", "CONCIERGE_SCHEDULER_TIMEOUT_MS", config.scheduler.timeout_ms),
        Field::new(
            "channel.api_base_url",
            "CONCIERGE_CHANNEL_API_BASE_URL",
            config.channel.api_base_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "channel.access_key",
            "CONCIERGE_CHANNEL_ACCESS_KEY",
            redact_secret(&config.channel.access_key),
        ),
        Field::new(
            "channel.access_secret",
            "CONCIERGE_CHANNEL_ACCESS_SECRET",
            redact_secret(&config.channel.access_secret),
        ),
        Field::new(
            "routing.clarification_window_turns",
            "CONCIERGE_ROUTING_CLARIFICATION_WINDOW_TURNS",
            config.routing.clarification_window_turns,
        ),
        Field::new(
            "routing.clarification_ttl_secs",
            "CONCIERGE_ROUTING_CLARIFICATION_TTL_SECS",
            config.routing.clarification_ttl_secs,
        ),
        Field::new(
            "routing.status_check_ttl_secs",
            "CONCIERGE_ROUTING_STATUS_CHECK_TTL_SECS",
            config.routing.status_check_ttl_secs,
        ),
        Field::new(
            "routing.status_check_delay_secs",
            "CONCIERGE_ROUTING_STATUS_CHECK_DELAY_SECS",
            config.routing.status_check_delay_secs,
        ),
        Field::new("server.bind_address", "CONCIERGE_SERVER_BIND_ADDRESS", &config.server.bind_address),
        Field::new("server.port", "CONCIERGE_SERVER_PORT", config.server.port),
        Field::new(
            "server.graceful_shutdown_secs",
            "CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs,
        ),
        Field::new("logging.level", "CONCIERGE_LOGGING_LEVEL", &config.logging.level),
        Field::new("logging.format", "CONCIERGE_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &SecretString) -> &'static str {
    if secret.expose_secret().trim().is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}
