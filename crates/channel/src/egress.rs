use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use concierge_core::config::ChannelConfig;
use concierge_core::domain::message::{EgressReply, SessionId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Most messages one history request asks the channel for.
pub const MAX_HISTORY: usize = 200;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("channel client setup failed: {0}")]
    Setup(String),
    #[error("channel request failed: {0}")]
    Transport(String),
    #[error("channel rejected reply with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, reply: &EgressReply) -> Result<(), EgressError>;
}

/// One earlier chat message, as the channel reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub person_type: Option<String>,
    pub plain_text: String,
}

#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// Up to `limit` text messages before the newest one, oldest first.
    async fn recent(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EgressError>;
}

#[derive(Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<ChannelMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelMessage {
    person_type: Option<String>,
    plain_text: Option<String>,
}

/// Used when the channel API is not configured. Replies are logged and dropped.
#[derive(Clone, Debug, Default)]
pub struct NoopReplySink;

#[async_trait]
impl ReplySink for NoopReplySink {
    async fn send(&self, reply: &EgressReply) -> Result<(), EgressError> {
        info!(
            event_name = "egress.skipped",
            session_id = %reply.session_id,
            "channel api not configured; reply not delivered"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryReplySink {
    replies: Mutex<Vec<EgressReply>>,
}

impl InMemoryReplySink {
    pub async fn replies(&self) -> Vec<EgressReply> {
        self.replies.lock().await.clone()
    }
}

#[async_trait]
impl ReplySink for InMemoryReplySink {
    async fn send(&self, reply: &EgressReply) -> Result<(), EgressError> {
        self.replies.lock().await.push(reply.clone());
        Ok(())
    }
}

/// Posts replies to `{base}/user-chats/{chatId}/messages` as a single text block and reads the
/// chat's history from the same resource.
pub struct ChannelApiClient {
    client: Client,
    base_url: String,
    access_key: SecretString,
    access_secret: SecretString,
}

impl ChannelApiClient {
    pub fn new(
        base_url: impl Into<String>,
        access_key: SecretString,
        access_secret: SecretString,
    ) -> Result<Self, EgressError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| EgressError::Setup(error.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { client, base_url, access_key, access_secret })
    }

    pub fn messages_url(&self, session_id: &SessionId) -> String {
        format!("{}/user-chats/{}/messages", self.base_url, session_id)
    }
}

#[async_trait]
impl ChatHistory for ChannelApiClient {
    async fn recent(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EgressError> {
        let limit = limit.clamp(1, MAX_HISTORY);
        let url = format!("{}?sortOrder=desc&limit={limit}", self.messages_url(session_id));

        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .header("x-access-key", self.access_key.expose_secret())
            .header("x-access-secret", self.access_secret.expose_secret())
            .send()
            .await
            .map_err(|error| EgressError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "history.rejected",
                session_id = %session_id,
                status = status.as_u16(),
                "channel api rejected history request"
            );
            return Err(EgressError::Rejected { status: status.as_u16(), body });
        }

        let page: HistoryPage =
            response.json().await.map_err(|error| EgressError::Transport(error.to_string()))?;
        // Newest first on the wire; the newest is the message being answered.
        let mut history: Vec<HistoryEntry> = page
            .messages
            .into_iter()
            .filter_map(|message| {
                let plain_text = message.plain_text.filter(|text| !text.is_empty())?;
                Some(HistoryEntry { person_type: message.person_type, plain_text })
            })
            .collect();
        history.reverse();
        history.pop();

        info!(
            event_name = "history.fetched",
            session_id = %session_id,
            messages = history.len(),
            "chat history fetched"
        );
        Ok(history)
    }
}

#[async_trait]
impl ReplySink for ChannelApiClient {
    async fn send(&self, reply: &EgressReply) -> Result<(), EgressError> {
        let url = self.messages_url(&reply.session_id);
        let body = json!({"blocks": [{"type": "text", "value": reply.reply_text}]});

        let response = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .header("x-access-key", self.access_key.expose_secret())
            .header("x-access-secret", self.access_secret.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|error| EgressError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "egress.rejected",
                session_id = %reply.session_id,
                status = status.as_u16(),
                "channel api rejected reply"
            );
            return Err(EgressError::Rejected { status: status.as_u16(), body });
        }

        info!(event_name = "egress.delivered", session_id = %reply.session_id, "reply delivered");
        Ok(())
    }
}

/// Real client when `channel.api_base_url` is set, otherwise [`NoopReplySink`].
pub fn reply_sink_from_config(config: &ChannelConfig) -> Result<Arc<dyn ReplySink>, EgressError> {
    match &config.api_base_url {
        Some(base_url) => Ok(Arc::new(ChannelApiClient::new(
            base_url.clone(),
            config.access_key.clone(),
            config.access_secret.clone(),
        )?)),
        None => Ok(Arc::new(NoopReplySink)),
    }
}

/// History reader when `channel.api_base_url` is set.
pub fn chat_history_from_config(
    config: &ChannelConfig,
) -> Result<Option<Arc<dyn ChatHistory>>, EgressError> {
    match &config.api_base_url {
        Some(base_url) => Ok(Some(Arc::new(ChannelApiClient::new(
            base_url.clone(),
            config.access_key.clone(),
            config.access_secret.clone(),
        )?))),
        None => Ok(None),
    }
}
