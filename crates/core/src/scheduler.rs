//! Contract for delayed re-entry into the turn pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::message::SessionId;
use crate::domain::session::ContinuationId;

/// Saved context carried by a continuation instead of message text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContinuationPayload {
    DeliveryStatus {
        continuation_id: ContinuationId,
        order_ref: Option<String>,
        /// Filled in by the workflow when it looked up the external status.
        #[serde(default)]
        status: Option<String>,
    },
    /// Closes the batch window and answers everything buffered under `batch_id`.
    FlushBatch { batch_id: ContinuationId },
}

impl ContinuationPayload {
    pub fn continuation_id(&self) -> &ContinuationId {
        match self {
            Self::DeliveryStatus { continuation_id, .. } => continuation_id,
            Self::FlushBatch { batch_id } => batch_id,
        }
    }

    /// Workflow name that prefixes every execution submitted for this payload.
    pub fn workflow(&self) -> &'static str {
        match self {
            Self::DeliveryStatus { .. } => "chat-followup",
            Self::FlushBatch { .. } => "chat-processing",
        }
    }

    /// A newer submission replaces the running one of the same workflow for the same session.
    pub fn supersedes_earlier(&self) -> bool {
        matches!(self, Self::FlushBatch { .. })
    }
}

/// A continuation arriving back at the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationFire {
    #[serde(alias = "chat_id", alias = "chatId")]
    pub session_id: SessionId,
    pub payload: ContinuationPayload,
    #[serde(default = "Utc::now")]
    pub fired_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub name: String,
    pub target: String,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("scheduler rejected submission: {0}")]
    Rejected(String),
    #[error("scheduler transport failure: {0}")]
    Transport(String),
    #[error("scheduler is shut down")]
    Closed,
}

#[async_trait]
pub trait WorkflowScheduler: Send + Sync {
    async fn schedule(
        &self,
        session_id: &SessionId,
        delay: Duration,
        payload: ContinuationPayload,
    ) -> Result<ExecutionHandle, SchedulingError>;
}

/// Accepts every submission and never fires. Used when no follow-up transport is wired.
#[derive(Clone, Debug, Default)]
pub struct NoopWorkflowScheduler;

#[async_trait]
impl WorkflowScheduler for NoopWorkflowScheduler {
    async fn schedule(
        &self,
        session_id: &SessionId,
        delay: Duration,
        payload: ContinuationPayload,
    ) -> Result<ExecutionHandle, SchedulingError> {
        let now = Utc::now();
        Ok(ExecutionHandle {
            name: execution_name(session_id, &payload, now),
            target: "noop".to_owned(),
            scheduled_for: scheduled_for(now, delay),
        })
    }
}

/// `{workflow}-{chatId}`, shared by every execution of one workflow for one session.
pub fn execution_prefix(session_id: &SessionId, payload: &ContinuationPayload) -> String {
    let chat: String = session_id
        .as_str()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    format!("{}-{chat}", payload.workflow())
}

/// `{workflow}-{chatId}-{unix}-{suffix8}`. Execution names are unique per submission.
pub fn execution_name(
    session_id: &SessionId,
    payload: &ContinuationPayload,
    at: DateTime<Utc>,
) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}-{}-{suffix}", execution_prefix(session_id, payload), at.timestamp())
}

pub fn scheduled_for(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay).map(|delay| now + delay).unwrap_or(now)
}
