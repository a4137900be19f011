use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use concierge_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use concierge_core::config::AppConfig;
use concierge_core::domain::message::{Message, SenderType, SessionId};
use concierge_core::domain::session::{
    AgentKind, ContinuationId, ExpiryPolicy, MessageBatch, PendingAction, SessionState,
    VersionToken, VersionedSession,
};
use concierge_core::domain::turn::{
    AgentResult, PendingChange, PendingRelease, ScheduledContinuation,
};
use concierge_core::errors::{ApplicationError, DomainError, InterfaceError};
use concierge_core::flows::{PendingEvent, PendingFlow, PendingTransitionError};
use concierge_core::ontology::OntologyIndex;
use concierge_core::scheduler::{
    ContinuationFire, ContinuationPayload, ExecutionHandle, WorkflowScheduler,
};
use concierge_db::{RepositoryError, SessionStore};

use crate::agents::{AgentError, AgentSet, AgentSettings, TurnContext, TurnInput};
use crate::router::{ContinuationRouting, Router};

const ACTOR: &str = "turn-runtime";
const BASE_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 1_000;

/// Retry and timeout budget for one turn.
///
/// The default is the budget of [`AppConfig::default`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub store_timeout: Duration,
    pub scheduler_timeout: Duration,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl TurnPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.session.max_turn_attempts.max(1),
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            store_timeout: config.session.store_timeout(),
            scheduler_timeout: config.scheduler.timeout(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub expiry: ExpiryPolicy,
    pub agents: AgentSettings,
    pub turn: TurnPolicy,
    /// `Some` buffers user messages and answers them together once the window passes quietly.
    pub batch_window: Option<Duration>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            expiry: config.routing.expiry_policy(),
            agents: AgentSettings {
                clarification_window_turns: config.routing.clarification_window_turns,
                status_check_delay: config.routing.status_check_delay(),
            },
            turn: TurnPolicy::from_config(config),
            batch_window: config.session.batch_window(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("session kept changing underneath the turn; gave up after {attempts} attempts")]
    ConcurrentUpdate { attempts: u32 },
    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },
    #[error(transparent)]
    Store(#[from] RepositoryError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Transition(#[from] PendingTransitionError),
}

impl TurnError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Store(error) => error.is_conflict(),
            Self::ConcurrentUpdate { .. } | Self::Agent(_) | Self::Transition(_) => false,
        }
    }

    fn exhausted(self, attempts: u32) -> Self {
        match self {
            Self::Store(error) if error.is_conflict() => Self::ConcurrentUpdate { attempts },
            other => other,
        }
    }
}

impl From<TurnError> for ApplicationError {
    fn from(error: TurnError) -> Self {
        match error {
            TurnError::ConcurrentUpdate { attempts } => Self::ConcurrentUpdate { attempts },
            TurnError::Timeout { operation } => Self::Timeout { operation: operation.to_owned() },
            TurnError::Store(error) => Self::Persistence(error.to_string()),
            TurnError::Agent(error) => {
                Self::Domain(DomainError::InvariantViolation(error.to_string()))
            }
            TurnError::Transition(error) => Self::Domain(DomainError::PendingTransition(error)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied {
        session_id: SessionId,
        reply: String,
        agent: AgentKind,
        version: VersionToken,
        scheduled: Option<ExecutionHandle>,
    },
    /// Held in the session's batch until the flush continuation fires.
    Buffered {
        session_id: SessionId,
        version: VersionToken,
        buffered: usize,
        scheduled: Option<ExecutionHandle>,
    },
    /// Not a user turn; nothing was read or written.
    Ignored { reason: String },
    /// A continuation whose pending action is gone or was replaced.
    Stale { session_id: SessionId, reason: &'static str },
    /// State is untouched; the user gets the hold reply.
    Failed { error: InterfaceError },
}

impl TurnOutcome {
    /// Text to send back to the user, if any.
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Replied { reply, .. } => Some(reply),
            Self::Failed { error } => Some(error.user_message()),
            Self::Buffered { .. } | Self::Ignored { .. } | Self::Stale { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied { .. } => "replied",
            Self::Buffered { .. } => "buffered",
            Self::Ignored { .. } => "ignored",
            Self::Stale { .. } => "stale",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Work<'a> {
    Message(&'a Message),
    Buffer(&'a Message),
    Continuation(&'a ContinuationFire),
    ReleaseHandoff(&'a SessionId),
}

impl Work<'_> {
    fn session_id(&self) -> &SessionId {
        match self {
            Self::Message(message) | Self::Buffer(message) => &message.session_id,
            Self::Continuation(fire) => &fire.session_id,
            Self::ReleaseHandoff(session_id) => session_id,
        }
    }
}

struct Committed {
    state: SessionState,
    version: VersionToken,
    agent: AgentKind,
    reply: String,
    continuation: Option<ScheduledContinuation>,
}

enum Attempt {
    Committed(Committed),
    Buffered { batch_id: ContinuationId, buffered: usize, version: VersionToken },
    Released(VersionToken),
    Stale(&'static str),
}

/// Drives one turn: read the session, route, run the agent, write the whole next state with a
/// single conditional put.
///
/// Agents never touch the store. A conflicting or timed-out write is retried from a fresh read,
/// so two turns racing on one session serialize instead of interleaving.
pub struct TurnRuntime {
    store: Arc<dyn SessionStore>,
    ontology: Arc<OntologyIndex>,
    scheduler: Arc<dyn WorkflowScheduler>,
    audit: Arc<dyn AuditSink>,
    router: Router,
    agents: AgentSet,
    flow: PendingFlow,
    settings: RuntimeSettings,
}

impl TurnRuntime {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ontology: Arc<OntologyIndex>,
        scheduler: Arc<dyn WorkflowScheduler>,
        audit: Arc<dyn AuditSink>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            ontology,
            scheduler,
            audit,
            router: Router::new(settings.expiry),
            agents: AgentSet::new(),
            flow: PendingFlow,
            settings,
        }
    }

    pub fn ontology(&self) -> &Arc<OntologyIndex> {
        &self.ontology
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub async fn handle_message(&self, message: Message, correlation_id: &str) -> TurnOutcome {
        if !message.is_from_user() {
            info!(
                event_name = "turn.ignored",
                correlation_id = %correlation_id,
                session_id = %message.session_id,
                sender_type = message.sender_type.as_str(),
                "ignoring non-user message"
            );
            return TurnOutcome::Ignored {
                reason: format!("sender_{}", message.sender_type.as_str()),
            };
        }
        if message.text.trim().is_empty() {
            return TurnOutcome::Ignored { reason: "blank_text".to_owned() };
        }

        match self.settings.batch_window {
            Some(window) => self.buffer(&message, window, correlation_id).await,
            None => self.run(Work::Message(&message), correlation_id).await,
        }
    }

    pub async fn handle_continuation(
        &self,
        fire: ContinuationFire,
        correlation_id: &str,
    ) -> TurnOutcome {
        self.run(Work::Continuation(&fire), correlation_id).await
    }

    /// Clears a `HumanHandoff` once a human has finished with the session.
    pub async fn release_handoff(
        &self,
        session_id: &SessionId,
        correlation_id: &str,
    ) -> Result<VersionToken, TurnError> {
        let audit = AuditContext::new(Some(session_id.clone()), correlation_id, ACTOR);
        match self.commit(Work::ReleaseHandoff(session_id), &audit).await? {
            Attempt::Released(version) => {
                info!(
                    event_name = "handoff.released",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    version = %version,
                    "handoff released"
                );
                Ok(version)
            }
            Attempt::Committed(committed) => Ok(committed.version),
            Attempt::Buffered { version, .. } => Ok(version),
            Attempt::Stale(_) => Err(TurnError::Transition(PendingTransitionError::NotInHandoff {
                current: "none".to_owned(),
            })),
        }
    }

    /// Appends the message to the session's batch and (re)arms the flush.
    ///
    /// Every buffered message issues a new batch id, so only the flush scheduled by the latest
    /// message can answer. When the flush cannot be scheduled the batch is answered right away.
    async fn buffer(&self, message: &Message, window: Duration, correlation_id: &str) -> TurnOutcome {
        let session_id = message.session_id.clone();
        let audit = AuditContext::new(Some(session_id.clone()), correlation_id, ACTOR);

        let (batch_id, buffered, version) = match self.commit(Work::Buffer(message), &audit).await {
            Ok(Attempt::Buffered { batch_id, buffered, version }) => (batch_id, buffered, version),
            Ok(_) => return TurnOutcome::Ignored { reason: "not_buffered".to_owned() },
            Err(failure) => return self.fail(failure, &session_id, &audit),
        };
        info!(
            event_name = "turn.buffered",
            correlation_id = %correlation_id,
            session_id = %session_id,
            buffered,
            version = %version,
            "message buffered"
        );
        self.audit.emit(
            audit
                .event("turn.buffered", AuditCategory::Session, AuditOutcome::Success)
                .with_metadata("buffered", buffered.to_string())
                .with_metadata("batch_id", batch_id.to_string()),
        );

        let payload = ContinuationPayload::FlushBatch { batch_id };
        let submission = tokio::time::timeout(
            self.settings.turn.scheduler_timeout,
            self.scheduler.schedule(&session_id, window, payload.clone()),
        )
        .await;
        let reason = match submission {
            Ok(Ok(handle)) => {
                info!(
                    event_name = "continuation.scheduled",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    execution = %handle.name,
                    scheduled_for = %handle.scheduled_for,
                    "batch flush scheduled"
                );
                return TurnOutcome::Buffered {
                    session_id,
                    version,
                    buffered,
                    scheduled: Some(handle),
                };
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => "scheduler call timed out".to_owned(),
        };

        warn!(
            event_name = "continuation.schedule_failed",
            correlation_id = %correlation_id,
            session_id = %session_id,
            error = %reason,
            "batch flush not scheduled; answering now"
        );
        self.audit.emit(
            audit
                .event("continuation.schedule_failed", AuditCategory::Scheduling, AuditOutcome::Failed)
                .with_metadata("error", reason),
        );
        let fire = ContinuationFire { session_id, payload, fired_at: Utc::now() };
        self.run(Work::Continuation(&fire), correlation_id).await
    }

    async fn run(&self, work: Work<'_>, correlation_id: &str) -> TurnOutcome {
        let session_id = work.session_id().clone();
        let audit = AuditContext::new(Some(session_id.clone()), correlation_id, ACTOR);

        match self.commit(work, &audit).await {
            Ok(Attempt::Committed(committed)) => self.finish(committed, &audit).await,
            Ok(Attempt::Stale(reason)) => {
                info!(
                    event_name = "continuation.stale",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    reason,
                    "dropping continuation"
                );
                self.audit.emit(
                    audit
                        .event("continuation.stale", AuditCategory::Scheduling, AuditOutcome::Rejected)
                        .with_metadata("reason", reason),
                );
                TurnOutcome::Stale { session_id, reason }
            }
            Ok(Attempt::Buffered { buffered, version, .. }) => {
                TurnOutcome::Buffered { session_id, version, buffered, scheduled: None }
            }
            Ok(Attempt::Released(version)) => TurnOutcome::Replied {
                session_id,
                reply: String::new(),
                agent: AgentKind::General,
                version,
                scheduled: None,
            },
            Err(failure) => self.fail(failure, &session_id, &audit),
        }
    }

    fn fail(&self, failure: TurnError, session_id: &SessionId, audit: &AuditContext) -> TurnOutcome {
        error!(
            event_name = "turn.failed",
            correlation_id = %audit.correlation_id,
            session_id = %session_id,
            error = %failure,
            "turn failed; replying with hold message"
        );
        self.audit.emit(
            audit
                .event("turn.failed", AuditCategory::Agent, AuditOutcome::Failed)
                .with_metadata("error", failure.to_string()),
        );
        let error = ApplicationError::from(failure).into_interface(audit.correlation_id.as_str());
        TurnOutcome::Failed { error }
    }

    async fn commit(&self, work: Work<'_>, audit: &AuditContext) -> Result<Attempt, TurnError> {
        let policy = &self.settings.turn;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(work, audit).await {
                Err(failure) if failure.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt - 1);
                    warn!(
                        event_name = "turn.conflict_retry",
                        correlation_id = %audit.correlation_id,
                        session_id = %work.session_id(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %failure,
                        "retrying turn from a fresh read"
                    );
                    self.audit.emit(
                        audit
                            .event("turn.conflict_retry", AuditCategory::Session, AuditOutcome::Rejected)
                            .with_metadata("attempt", attempt.to_string())
                            .with_metadata("error", failure.to_string()),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) if failure.is_retryable() => return Err(failure.exhausted(attempt)),
                other => return other,
            }
        }
    }

    async fn attempt(&self, work: Work<'_>, audit: &AuditContext) -> Result<Attempt, TurnError> {
        let now = Utc::now();
        let session_id = work.session_id();
        let stored = self.store_call("session read", self.store.get(session_id)).await?;
        let (mut state, expected) = match stored {
            Some(VersionedSession { state, version }) => (state, Some(version)),
            None => (SessionState::new(session_id.clone(), now), None),
        };

        let flushed = match work {
            Work::Buffer(message) => {
                let batch = match state.batch.as_mut() {
                    Some(batch) => {
                        batch.push(message.text.as_str());
                        batch.clone()
                    }
                    None => state.batch.insert(MessageBatch::open(message.text.as_str(), now)).clone(),
                };
                state.last_updated = now;
                let version = self.store_call("session write", self.store.put(state, expected)).await?;
                return Ok(Attempt::Buffered {
                    batch_id: batch.batch_id,
                    buffered: batch.texts.len(),
                    version,
                });
            }
            Work::Continuation(ContinuationFire {
                payload: ContinuationPayload::FlushBatch { batch_id },
                ..
            }) => match take_batch(&mut state, batch_id) {
                Ok(text) => Some(Message::new(session_id.clone(), text, SenderType::User, now)),
                Err(reason) => return Ok(Attempt::Stale(reason)),
            },
            _ => None,
        };

        let (decision, input, turn) = match (work, flushed.as_ref()) {
            (_, Some(message)) | (Work::Message(message), None) => {
                let decision = self.router.route(message, &state, &self.ontology, now);
                let turn = state.next_turn();
                (decision, TurnInput::Message(message), turn)
            }
            (Work::Buffer(_), None) => return Ok(Attempt::Stale("nothing_buffered")),
            (Work::Continuation(fire), None) => match self.router.route_continuation(&fire.payload, &state) {
                ContinuationRouting::Resume(decision) => {
                    (decision, TurnInput::Continuation(&fire.payload), state.turn_count)
                }
                ContinuationRouting::Stale { reason } => return Ok(Attempt::Stale(reason)),
            },
            (Work::ReleaseHandoff(_), None) => {
                let outcome = self.flow.apply_with_audit(
                    state.pending_action.as_ref(),
                    &PendingEvent::HandoffReleased,
                    self.audit.as_ref(),
                    audit,
                )?;
                state.pending_action = outcome.to;
                state.last_updated = now;
                let version = self.store_call("session write", self.store.put(state, expected)).await?;
                return Ok(Attempt::Released(version));
            }
        };

        info!(
            event_name = "routing.decided",
            correlation_id = %audit.correlation_id,
            session_id = %session_id,
            target = decision.target.as_str(),
            reason = decision.reason.label(),
            "routed turn"
        );
        let mut routed = audit
            .event("routing.decided", AuditCategory::Routing, AuditOutcome::Success)
            .with_metadata("target", decision.target.as_str())
            .with_metadata("reason", decision.reason.label());
        if let Some(message) = &flushed {
            routed = routed.with_metadata("batched_text", message.text.clone());
        }
        self.audit.emit(routed);

        if let Some(release) = decision.release {
            let event = match release {
                PendingRelease::Expired => PendingEvent::Expired,
                PendingRelease::Superseded => PendingEvent::Superseded,
            };
            let outcome = self.flow.apply_with_audit(
                state.pending_action.as_ref(),
                &event,
                self.audit.as_ref(),
                audit,
            )?;
            state.pending_action = outcome.to;
        }

        let ctx = TurnContext {
            input,
            state: &state,
            decision: &decision,
            ontology: &self.ontology,
            settings: &self.settings.agents,
            turn,
            now,
        };
        let AgentResult { reply_text, mutation, continuation } =
            self.agents.handle(decision.target, &ctx)?;

        let event = match mutation.pending {
            PendingChange::Keep => None,
            PendingChange::Open(action) => Some(PendingEvent::Open(action)),
            PendingChange::Resolve => Some(PendingEvent::Resolved),
        };
        if let Some(event) = event {
            let outcome = self.flow.apply_with_audit(
                state.pending_action.as_ref(),
                &event,
                self.audit.as_ref(),
                audit,
            )?;
            state.pending_action = outcome.to;
        }
        for name in &mutation.clear_slots {
            state.slots.remove(name);
        }
        state.slots.extend(mutation.set_slots);
        state.current_agent = Some(decision.target);
        state.turn_count = turn;
        state.last_updated = now;

        let version =
            self.store_call("session write", self.store.put(state.clone(), expected)).await?;
        Ok(Attempt::Committed(Committed {
            state,
            version,
            agent: decision.target,
            reply: reply_text,
            continuation,
        }))
    }

    async fn finish(&self, committed: Committed, audit: &AuditContext) -> TurnOutcome {
        let Committed { state, mut version, agent, reply, continuation } = committed;
        info!(
            event_name = "turn.committed",
            correlation_id = %audit.correlation_id,
            session_id = %state.session_id,
            agent = agent.as_str(),
            turn_count = state.turn_count,
            version = %version,
            pending = state.pending_action.as_ref().map(PendingAction::label).unwrap_or("none"),
            "turn committed"
        );
        self.audit.emit(
            audit
                .event("turn.committed", AuditCategory::Session, AuditOutcome::Success)
                .with_metadata("agent", agent.as_str())
                .with_metadata("turn_count", state.turn_count.to_string())
                .with_metadata("version", version.to_string()),
        );

        let mut scheduled = None;
        if let Some(ScheduledContinuation { delay, payload }) = continuation {
            let submission = tokio::time::timeout(
                self.settings.turn.scheduler_timeout,
                self.scheduler.schedule(&state.session_id, delay, payload),
            )
            .await;
            let failure = match submission {
                Ok(Ok(handle)) => {
                    info!(
                        event_name = "continuation.scheduled",
                        correlation_id = %audit.correlation_id,
                        session_id = %state.session_id,
                        execution = %handle.name,
                        scheduled_for = %handle.scheduled_for,
                        "continuation scheduled"
                    );
                    self.audit.emit(
                        audit
                            .event(
                                "continuation.scheduled",
                                AuditCategory::Scheduling,
                                AuditOutcome::Success,
                            )
                            .with_metadata("execution", handle.name.clone())
                            .with_metadata("delay_secs", delay.as_secs().to_string()),
                    );
                    scheduled = Some(handle);
                    None
                }
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some("scheduler call timed out".to_owned()),
            };
            if let Some(reason) = failure {
                warn!(
                    event_name = "continuation.schedule_failed",
                    correlation_id = %audit.correlation_id,
                    session_id = %state.session_id,
                    error = %reason,
                    "continuation not scheduled; withdrawing status check"
                );
                self.audit.emit(
                    audit
                        .event(
                            "continuation.schedule_failed",
                            AuditCategory::Scheduling,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("error", reason),
                );
                if let Some(withdrawn) = self.withdraw_status_check(state.clone(), version, audit).await
                {
                    version = withdrawn;
                }
            }
        }

        TurnOutcome::Replied { session_id: state.session_id, reply, agent, version, scheduled }
    }

    /// Best effort: a status check nobody will ever fire must not pin the session.
    async fn withdraw_status_check(
        &self,
        mut state: SessionState,
        version: VersionToken,
        audit: &AuditContext,
    ) -> Option<VersionToken> {
        if !matches!(state.pending_action, Some(PendingAction::StatusCheck { .. })) {
            return None;
        }
        let outcome = self
            .flow
            .apply_with_audit(
                state.pending_action.as_ref(),
                &PendingEvent::Resolved,
                self.audit.as_ref(),
                audit,
            )
            .ok()?;
        state.pending_action = outcome.to;
        state.last_updated = Utc::now();

        match self.store_call("session write", self.store.put(state, Some(version))).await {
            Ok(version) => Some(version),
            Err(failure) => {
                warn!(
                    event_name = "continuation.withdraw_failed",
                    correlation_id = %audit.correlation_id,
                    error = %failure,
                    "orphaned status check left in place until it expires"
                );
                None
            }
        }
    }

    async fn store_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, TurnError> {
        match tokio::time::timeout(self.settings.turn.store_timeout, call).await {
            Ok(result) => result.map_err(TurnError::from),
            Err(_) => Err(TurnError::Timeout { operation }),
        }
    }
}

/// Takes the buffered text when `batch_id` is still the latest batch for the session.
fn take_batch(state: &mut SessionState, batch_id: &ContinuationId) -> Result<String, &'static str> {
    match state.batch.take() {
        Some(batch) if batch.batch_id == *batch_id => {
            let text = batch.joined();
            if text.is_empty() {
                Err("nothing_buffered")
            } else {
                Ok(text)
            }
        }
        Some(batch) => {
            state.batch = Some(batch);
            Err("batch_superseded")
        }
        None => Err("nothing_buffered"),
    }
}
