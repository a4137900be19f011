use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::ExpiryPolicy;
use crate::ontology::BlobLocation;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ontology: OntologyConfig,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub channel: ChannelConfig,
    pub routing: RoutingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OntologyConfig {
    pub source: OntologySourceKind,
    /// Directory for `file`, base URL for `http`.
    pub base: String,
    pub bucket: String,
    pub key: String,
    pub max_bytes: usize,
}

impl OntologyConfig {
    pub fn location(&self) -> BlobLocation {
        BlobLocation::new(self.bucket.clone(), self.key.clone())
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub table: String,
    pub store_timeout_ms: u64,
    pub max_turn_attempts: u32,
    /// Quiet period during which consecutive messages are buffered and answered as one turn.
    /// Zero answers every message immediately.
    pub batch_window_secs: u64,
}

impl SessionConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn batch_window(&self) -> Option<Duration> {
        (self.batch_window_secs > 0).then(|| Duration::from_secs(self.batch_window_secs))
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    pub target: String,
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub api_base_url: Option<String>,
    pub access_key: SecretString,
    pub access_secret: SecretString,
}

impl ChannelConfig {
    pub fn egress_enabled(&self) -> bool {
        self.api_base_url.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub clarification_window_turns: u32,
    pub clarification_ttl_secs: u64,
    pub status_check_ttl_secs: u64,
    pub status_check_delay_secs: u64,
}

impl RoutingConfig {
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            clarification_ttl: chrono::Duration::seconds(to_i64(self.clarification_ttl_secs)),
            status_check_ttl: chrono::Duration::seconds(to_i64(self.status_check_ttl_secs)),
        }
    }

    pub fn status_check_delay(&self) -> Duration {
        Duration::from_secs(self.status_check_delay_secs)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OntologySourceKind {
    File,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    Local,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub ontology_base: Option<String>,
    pub session_table: Option<String>,
    pub scheduler_mode: Option<SchedulerMode>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_MAX_ONTOLOGY_BYTES: usize = 8 * 1024 * 1024;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            ontology: OntologyConfig {
                source: OntologySourceKind::File,
                base: "data".to_string(),
                bucket: "concierge-ontology".to_string(),
                key: "ontology.json".to_string(),
                max_bytes: DEFAULT_MAX_ONTOLOGY_BYTES,
            },
            session: SessionConfig {
                table: "session_state".to_string(),
                store_timeout_ms: 2_000,
                max_turn_attempts: 3,
                batch_window_secs: 0,
            },
            scheduler: SchedulerConfig {
                mode: SchedulerMode::Local,
                target: "chat-scheduler".to_string(),
                endpoint: None,
                timeout_ms: 3_000,
            },
            channel: ChannelConfig {
                api_base_url: None,
                access_key: String::new().into(),
                access_secret: String::new().into(),
            },
            routing: RoutingConfig {
                clarification_window_turns: 3,
                clarification_ttl_secs: 600,
                status_check_ttl_secs: 900,
                status_check_delay_secs: 60,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl std::str::FromStr for OntologySourceKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported ontology source `{other}` (expected file|http)"
            ))),
        }
    }
}

impl std::str::FromStr for SchedulerMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported scheduler mode `{other}` (expected local|http)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(ontology) = patch.ontology {
            if let Some(source) = ontology.source {
                self.ontology.source = source;
            }
            if let Some(base) = ontology.base {
                self.ontology.base = base;
            }
            if let Some(bucket) = ontology.bucket {
                self.ontology.bucket = bucket;
            }
            if let Some(key) = ontology.key {
                self.ontology.key = key;
            }
            if let Some(max_bytes) = ontology.max_bytes {
                self.ontology.max_bytes = max_bytes;
            }
        }

        if let Some(session) = patch.session {
            if let Some(table) = session.table {
                self.session.table = table;
            }
            if let Some(store_timeout_ms) = session.store_timeout_ms {
                self.session.store_timeout_ms = store_timeout_ms;
            }
            if let Some(max_turn_attempts) = session.max_turn_attempts {
                self.session.max_turn_attempts = max_turn_attempts;
            }
            if let Some(batch_window_secs) = session.batch_window_secs {
                self.session.batch_window_secs = batch_window_secs;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(mode) = scheduler.mode {
                self.scheduler.mode = mode;
            }
            if let Some(target) = scheduler.target {
                self.scheduler.target = target;
            }
            if let Some(endpoint) = scheduler.endpoint {
                self.scheduler.endpoint = Some(endpoint);
            }
            if let Some(timeout_ms) = scheduler.timeout_ms {
                self.scheduler.timeout_ms = timeout_ms;
            }
        }

        if let Some(channel) = patch.channel {
            if let Some(api_base_url) = channel.api_base_url {
                self.channel.api_base_url = Some(api_base_url);
            }
            if let Some(access_key) = channel.access_key {
                self.channel.access_key = secret_value(access_key);
            }
            if let Some(access_secret) = channel.access_secret {
                self.channel.access_secret = secret_value(access_secret);
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(turns) = routing.clarification_window_turns {
                self.routing.clarification_window_turns = turns;
            }
            if let Some(secs) = routing.clarification_ttl_secs {
                self.routing.clarification_ttl_secs = secs;
            }
            if let Some(secs) = routing.status_check_ttl_secs {
                self.routing.status_check_ttl_secs = secs;
            }
            if let Some(secs) = routing.status_check_delay_secs {
                self.routing.status_check_delay_secs = secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_ONTOLOGY_SOURCE") {
            self.ontology.source = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_ONTOLOGY_BASE") {
            self.ontology.base = value;
        }
        if let Some(value) = read_env("CONCIERGE_ONTOLOGY_BUCKET") {
            self.ontology.bucket = value;
        }
        if let Some(value) = read_env("CONCIERGE_ONTOLOGY_KEY") {
            self.ontology.key = value;
        }
        if let Some(value) = read_env("CONCIERGE_ONTOLOGY_MAX_BYTES") {
            self.ontology.max_bytes = parse_usize("CONCIERGE_ONTOLOGY_MAX_BYTES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SESSION_TABLE") {
            self.session.table = value;
        }
        if let Some(value) = read_env("CONCIERGE_SESSION_STORE_TIMEOUT_MS") {
            self.session.store_timeout_ms =
                parse_u64("CONCIERGE_SESSION_STORE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SESSION_MAX_TURN_ATTEMPTS") {
            self.session.max_turn_attempts =
                parse_u32("CONCIERGE_SESSION_MAX_TURN_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SESSION_BATCH_WINDOW_SECS") {
            self.session.batch_window_secs =
                parse_u64("CONCIERGE_SESSION_BATCH_WINDOW_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SCHEDULER_MODE") {
            self.scheduler.mode = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_SCHEDULER_TARGET") {
            self.scheduler.target = value;
        }
        if let Some(value) = read_env("CONCIERGE_SCHEDULER_ENDPOINT") {
            self.scheduler.endpoint = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_SCHEDULER_TIMEOUT_MS") {
            self.scheduler.timeout_ms = parse_u64("CONCIERGE_SCHEDULER_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_CHANNEL_API_BASE_URL") {
            self.channel.api_base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_CHANNEL_ACCESS_KEY") {
            self.channel.access_key = secret_value(value);
        }
        if let Some(value) = read_env("CONCIERGE_CHANNEL_ACCESS_SECRET") {
            self.channel.access_secret = secret_value(value);
        }

        if let Some(value) = read_env("CONCIERGE_ROUTING_CLARIFICATION_WINDOW_TURNS") {
            self.routing.clarification_window_turns =
                parse_u32("CONCIERGE_ROUTING_CLARIFICATION_WINDOW_TURNS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_CLARIFICATION_TTL_SECS") {
            self.routing.clarification_ttl_secs =
                parse_u64("CONCIERGE_ROUTING_CLARIFICATION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_STATUS_CHECK_TTL_SECS") {
            self.routing.status_check_ttl_secs =
                parse_u64("CONCIERGE_ROUTING_STATUS_CHECK_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_STATUS_CHECK_DELAY_SECS") {
            self.routing.status_check_delay_secs =
                parse_u64("CONCIERGE_ROUTING_STATUS_CHECK_DELAY_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_PORT") {
            self.server.port = parse_u16("CONCIERGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(ontology_base) = overrides.ontology_base {
            self.ontology.base = ontology_base;
        }
        if let Some(session_table) = overrides.session_table {
            self.session.table = session_table;
        }
        if let Some(scheduler_mode) = overrides.scheduler_mode {
            self.scheduler.mode = scheduler_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_ontology(&self.ontology)?;
        validate_session(&self.session)?;
        validate_scheduler(&self.scheduler)?;
        validate_channel(&self.channel)?;
        validate_routing(&self.routing)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

/// Plain SQL identifier: ASCII letter or underscore first, then letters, digits, underscores.
pub fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    value.len() <= 63 && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_ontology(ontology: &OntologyConfig) -> Result<(), ConfigError> {
    if ontology.base.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ontology.base is required (a directory for `file`, a base URL for `http`)".to_string(),
        ));
    }
    if ontology.source == OntologySourceKind::Http && !is_http_url(&ontology.base) {
        return Err(ConfigError::Validation(
            "ontology.base must start with http:// or https:// when ontology.source = http"
                .to_string(),
        ));
    }
    if ontology.bucket.trim().is_empty() || ontology.key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ontology.bucket and ontology.key must both be set".to_string(),
        ));
    }
    if ontology.max_bytes == 0 {
        return Err(ConfigError::Validation(
            "ontology.max_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if !is_sql_identifier(&session.table) {
        return Err(ConfigError::Validation(format!(
            "session.table `{}` must be a plain identifier (letters, digits, underscores)",
            session.table
        )));
    }
    if session.store_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "session.store_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if session.max_turn_attempts == 0 || session.max_turn_attempts > 10 {
        return Err(ConfigError::Validation(
            "session.max_turn_attempts must be in range 1..=10".to_string(),
        ));
    }
    if session.batch_window_secs > 300 {
        return Err(ConfigError::Validation(
            "session.batch_window_secs must be in range 0..=300".to_string(),
        ));
    }
    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.target.trim().is_empty() {
        return Err(ConfigError::Validation("scheduler.target must not be empty".to_string()));
    }
    if scheduler.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "scheduler.timeout_ms must be greater than zero".to_string(),
        ));
    }
    if scheduler.mode == SchedulerMode::Http {
        match scheduler.endpoint.as_deref() {
            None => {
                return Err(ConfigError::Validation(
                    "scheduler.endpoint is required when scheduler.mode = http".to_string(),
                ))
            }
            Some(endpoint) if !is_http_url(endpoint) => {
                return Err(ConfigError::Validation(
                    "scheduler.endpoint must start with http:// or https://".to_string(),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn validate_channel(channel: &ChannelConfig) -> Result<(), ConfigError> {
    let Some(base_url) = &channel.api_base_url else {
        return Ok(());
    };
    if !is_http_url(base_url) {
        return Err(ConfigError::Validation(
            "channel.api_base_url must start with http:// or https://".to_string(),
        ));
    }
    if channel.access_key.expose_secret().trim().is_empty()
        || channel.access_secret.expose_secret().trim().is_empty()
    {
        return Err(ConfigError::Validation(
            "channel.access_key and channel.access_secret are required when channel.api_base_url is set".to_string(),
        ));
    }
    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    if routing.clarification_window_turns == 0 {
        return Err(ConfigError::Validation(
            "routing.clarification_window_turns must be greater than zero".to_string(),
        ));
    }
    if routing.clarification_ttl_secs == 0 || routing.status_check_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "routing ttl windows must be greater than zero".to_string(),
        ));
    }
    if routing.status_check_delay_secs == 0 {
        return Err(ConfigError::Validation(
            "routing.status_check_delay_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    ontology: Option<OntologyPatch>,
    session: Option<SessionPatch>,
    scheduler: Option<SchedulerPatch>,
    channel: Option<ChannelPatch>,
    routing: Option<RoutingPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OntologyPatch {
    source: Option<OntologySourceKind>,
    base: Option<String>,
    bucket: Option<String>,
    key: Option<String>,
    max_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    table: Option<String>,
    store_timeout_ms: Option<u64>,
    max_turn_attempts: Option<u32>,
    batch_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    mode: Option<SchedulerMode>,
    target: Option<String>,
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelPatch {
    api_base_url: Option<String>,
    access_key: Option<String>,
    access_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    clarification_window_turns: Option<u32>,
    clarification_ttl_secs: Option<u64>,
    status_check_ttl_secs: Option<u64>,
    status_check_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        is_sql_identifier, AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat,
        SchedulerMode,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_documented_values() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.session.table == "session_state", "default table")?;
        ensure(config.session.max_turn_attempts == 3, "default attempts")?;
        ensure(config.session.batch_window().is_none(), "batching off by default")?;
        ensure(config.routing.clarification_window_turns == 3, "default window")?;
        ensure(
            config.routing.status_check_delay() == Duration::from_secs(60),
            "default status check delay",
        )?;
        ensure(config.scheduler.target == "chat-scheduler", "default scheduler target")?;
        ensure(config.ontology.location().to_string() == "concierge-ontology/ontology.json", "location")?;
        ensure(!config.channel.egress_enabled(), "egress disabled by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CHANNEL_ACCESS_KEY", "key-from-env");
        env::set_var("TEST_CHANNEL_ACCESS_SECRET", "secret-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[channel]
api_base_url = "https://api.channel.example/open/v5"
access_key = "${TEST_CHANNEL_ACCESS_KEY}"
access_secret = "${TEST_CHANNEL_ACCESS_SECRET}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.channel.access_key.expose_secret() == "key-from-env",
                "access key should be loaded from environment",
            )?;
            ensure(
                config.channel.access_secret.expose_secret() == "secret-from-env",
                "access secret should be loaded from environment",
            )?;
            ensure(config.channel.egress_enabled(), "egress enabled once base url is set")
        })();

        clear_vars(&["TEST_CHANNEL_ACCESS_KEY", "TEST_CHANNEL_ACCESS_SECRET"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CONCIERGE_ROUTING_CLARIFICATION_WINDOW_TURNS", "5");
        env::set_var("CONCIERGE_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[routing]
clarification_window_turns = 2
status_check_delay_secs = 30

[session]
table = "file_sessions"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(matches!(config.logging.format, LogFormat::Json), "env log format")?;
            ensure(config.routing.clarification_window_turns == 5, "env window should beat file")?;
            ensure(config.routing.status_check_delay_secs == 30, "file delay should beat default")?;
            ensure(config.session.table == "file_sessions", "file table should beat default")
        })();

        clear_vars(&[
            "CONCIERGE_DATABASE_URL",
            "CONCIERGE_ROUTING_CLARIFICATION_WINDOW_TURNS",
            "CONCIERGE_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_SCHEDULER_MODE", "http");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("scheduler.endpoint")
            );
            ensure(has_message, "validation failure should mention scheduler.endpoint")
        })();

        clear_vars(&["CONCIERGE_SCHEDULER_MODE"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_SESSION_MAX_TURN_ATTEMPTS", "three");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "CONCIERGE_SESSION_MAX_TURN_ATTEMPTS",
                "error should name the variable",
            ),
            other => Err(format!("unexpected result: {other:?}")),
        };
        clear_vars(&["CONCIERGE_SESSION_MAX_TURN_ATTEMPTS"]);
        result
    }

    #[test]
    fn batch_window_comes_from_env_and_is_bounded() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_SESSION_BATCH_WINDOW_SECS", "5");
        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.session.batch_window() == Some(Duration::from_secs(5)),
                "batch window should be read from env",
            )?;

            env::set_var("CONCIERGE_SESSION_BATCH_WINDOW_SECS", "3600");
            let too_long = AppConfig::load(LoadOptions::default());
            ensure(
                matches!(too_long, Err(ConfigError::Validation(ref message)) if message.contains("batch_window_secs")),
                "an hour-long batch window should be rejected",
            )
        })();

        clear_vars(&["CONCIERGE_SESSION_BATCH_WINDOW_SECS"]);
        result
    }

    #[test]
    fn table_names_must_be_plain_identifiers() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        ensure(is_sql_identifier("session_state"), "plain name")?;
        ensure(is_sql_identifier("_t2"), "underscore prefix")?;
        ensure(!is_sql_identifier("2fast"), "digit prefix")?;
        ensure(!is_sql_identifier("sessions; DROP TABLE x"), "injection")?;

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                session_table: Some("bad-name".to_string()),
                scheduler_mode: Some(SchedulerMode::Local),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("session.table")),
            "invalid table should be rejected",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_CHANNEL_API_BASE_URL", "https://api.channel.example/open/v5");
        env::set_var("CONCIERGE_CHANNEL_ACCESS_KEY", "key-secret-value");
        env::set_var("CONCIERGE_CHANNEL_ACCESS_SECRET", "secret-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("key-secret-value"), "debug output should not contain key")?;
            ensure(
                !debug.contains("secret-secret-value"),
                "debug output should not contain secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&[
            "CONCIERGE_CHANNEL_API_BASE_URL",
            "CONCIERGE_CHANNEL_ACCESS_KEY",
            "CONCIERGE_CHANNEL_ACCESS_SECRET",
        ]);
        result
    }
}
