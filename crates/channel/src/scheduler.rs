use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use concierge_core::config::SchedulerConfig;
use concierge_core::domain::message::SessionId;
use concierge_core::scheduler::{
    execution_name, execution_prefix, scheduled_for, ContinuationFire, ContinuationPayload,
    ExecutionHandle, SchedulingError, WorkflowScheduler,
};

use crate::ingress::SCHEDULER_SOURCE;

/// Error recorded on executions stopped because a newer message arrived.
pub const SUPERSEDED_ERROR: &str = "NewMessageReceived";

/// Timers that a newer submission may cancel, keyed by execution prefix.
type SupersedableTimers = Arc<Mutex<HashMap<String, (String, AbortHandle)>>>;

/// In-process scheduler: each submission is a tokio timer that delivers the fire over a channel.
///
/// Pending timers do not survive a restart. Use [`HttpWorkflowScheduler`] when continuations must
/// outlive the process.
#[derive(Clone)]
pub struct LocalWorkflowScheduler {
    target: String,
    sender: mpsc::Sender<ContinuationFire>,
    supersedable: SupersedableTimers,
}

impl LocalWorkflowScheduler {
    pub fn new(
        target: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ContinuationFire>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let scheduler =
            Self { target: target.into(), sender, supersedable: SupersedableTimers::default() };
        (scheduler, receiver)
    }
}

#[async_trait]
impl WorkflowScheduler for LocalWorkflowScheduler {
    async fn schedule(
        &self,
        session_id: &SessionId,
        delay: Duration,
        payload: ContinuationPayload,
    ) -> Result<ExecutionHandle, SchedulingError> {
        if self.sender.is_closed() {
            return Err(SchedulingError::Closed);
        }

        let now = Utc::now();
        let handle = ExecutionHandle {
            name: execution_name(session_id, &payload, now),
            target: self.target.clone(),
            scheduled_for: scheduled_for(now, delay),
        };
        let prefix = execution_prefix(session_id, &payload);
        let supersedes = payload.supersedes_earlier();

        // Held across spawn and insert so a zero-delay timer cannot deregister before it is known.
        let mut timers = self.supersedable.lock().await;
        if supersedes {
            if let Some((previous, abort)) = timers.remove(&prefix) {
                abort.abort();
                info!(
                    event_name = "scheduler.local.superseded",
                    execution = %previous,
                    error = SUPERSEDED_ERROR,
                    "earlier timer cancelled"
                );
            }
        }

        let sender = self.sender.clone();
        let session_id = session_id.clone();
        let name = handle.name.clone();
        let registry = Arc::clone(&self.supersedable);
        let timer_prefix = prefix.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if supersedes {
                let mut timers = registry.lock().await;
                if timers.get(&timer_prefix).is_some_and(|(current, _)| *current == name) {
                    timers.remove(&timer_prefix);
                }
            }
            let fire = ContinuationFire { session_id, payload, fired_at: Utc::now() };
            if sender.send(fire).await.is_err() {
                warn!(
                    event_name = "scheduler.local.dropped",
                    execution = %name,
                    "continuation receiver closed before fire"
                );
            }
        });
        if supersedes {
            timers.insert(prefix, (handle.name.clone(), task.abort_handle()));
        }
        drop(timers);

        info!(
            event_name = "scheduler.local.submitted",
            execution = %handle.name,
            delay_secs = delay.as_secs(),
            "continuation timer armed"
        );
        Ok(handle)
    }
}

/// Submits executions to an external workflow service.
///
/// Body: `{target, name, delaySeconds, input}` where `input` is the event the workflow posts
/// back to the webhook when it fires. Batch flushes first ask `{endpoint}/stop` to stop the
/// running executions sharing their prefix; a failed stop is logged and the start goes ahead,
/// since the stale fire is rejected by the batch id anyway.
pub struct HttpWorkflowScheduler {
    client: Client,
    endpoint: String,
    target: String,
}

impl HttpWorkflowScheduler {
    pub fn new(
        endpoint: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SchedulingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| SchedulingError::Transport(error.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into(), target: target.into() })
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulingError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            SchedulingError::Rejected("scheduler.endpoint is required in http mode".to_owned())
        })?;
        Self::new(endpoint, config.target.clone(), config.timeout())
    }
}

#[async_trait]
impl WorkflowScheduler for HttpWorkflowScheduler {
    async fn schedule(
        &self,
        session_id: &SessionId,
        delay: Duration,
        payload: ContinuationPayload,
    ) -> Result<ExecutionHandle, SchedulingError> {
        if payload.supersedes_earlier() {
            self.stop_running(&execution_prefix(session_id, &payload)).await;
        }

        let now = Utc::now();
        let name = execution_name(session_id, &payload, now);
        let body = json!({
            "target": self.target,
            "name": name,
            "delaySeconds": delay.as_secs(),
            "input": {
                "source": SCHEDULER_SOURCE,
                "chat_id": session_id.as_str(),
                "payload": payload,
            },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| SchedulingError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SchedulingError::Rejected(format!("{status}: {detail}")));
        }

        info!(
            event_name = "scheduler.http.submitted",
            execution = %name,
            target = %self.target,
            delay_secs = delay.as_secs(),
            "workflow execution started"
        );
        Ok(ExecutionHandle { name, target: self.target.clone(), scheduled_for: scheduled_for(now, delay) })
    }
}

impl HttpWorkflowScheduler {
    async fn stop_running(&self, prefix: &str) {
        let body = json!({
            "target": self.target,
            "prefix": prefix,
            "error": SUPERSEDED_ERROR,
            "cause": "newer message buffered for this chat",
        });
        let url = format!("{}/stop", self.endpoint.trim_end_matches('/'));
        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    event_name = "scheduler.http.superseded",
                    prefix = %prefix,
                    "running executions stopped"
                );
            }
            Ok(response) => {
                warn!(
                    event_name = "scheduler.http.stop_failed",
                    prefix = %prefix,
                    status = %response.status(),
                    "could not stop running executions"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "scheduler.http.stop_failed",
                    prefix = %prefix,
                    error = %error,
                    "could not stop running executions"
                );
            }
        }
    }
}
