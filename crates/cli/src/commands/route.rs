use std::sync::Arc;

use concierge_agent::{RuntimeSettings, TurnOutcome, TurnRuntime};
use concierge_core::audit::InMemoryAuditSink;
use concierge_core::config::{AppConfig, LoadOptions};
use concierge_core::domain::message::Message;
use concierge_core::scheduler::NoopWorkflowScheduler;
use concierge_db::InMemorySessionStore;
use serde::Serialize;

use crate::commands::{current_thread_runtime, escape_json, load_ontology, CommandResult};

pub const DEFAULT_SESSION: &str = "cli-session";

#[derive(Debug, Serialize)]
struct RouteReport {
    command: &'static str,
    status: &'static str,
    session_id: String,
    turns: Vec<TurnReport>,
}

#[derive(Debug, Serialize)]
struct TurnReport {
    text: String,
    outcome: &'static str,
    agent: Option<&'static str>,
    reason: Option<String>,
    reply: Option<String>,
    scheduled: Option<String>,
}

/// Runs each text as one user turn against an in-memory session, in order.
///
/// Continuations are acknowledged but never fire, so a delivery lookup stops at its interim reply
/// and every text is answered on its own, whatever the configured batch window.
pub fn run(texts: &[String], session_id: &str) -> CommandResult {
    if texts.iter().all(|text| text.trim().is_empty()) {
        return CommandResult::failure("route", "invalid_input", "at least one --text is required", 2);
    }

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "route",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "route",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let ontology = load_ontology(&config).await.map_err(|error| error.to_string())?;
        let audit = Arc::new(InMemoryAuditSink::default());
        let turns = TurnRuntime::new(
            Arc::new(InMemorySessionStore::default()),
            Arc::new(ontology),
            Arc::new(NoopWorkflowScheduler),
            audit.clone(),
            RuntimeSettings { batch_window: None, ..RuntimeSettings::from_config(&config) },
        );

        let mut reports = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let correlation_id = format!("cli-{}", index + 1);
            let outcome =
                turns.handle_message(Message::from_user(session_id, text.as_str()), &correlation_id).await;
            let reason = audit
                .events()
                .into_iter()
                .rev()
                .find(|event| {
                    event.correlation_id == correlation_id && event.event_type == "routing.decided"
                })
                .and_then(|event| event.metadata.get("reason").cloned());
            reports.push(turn_report(text, &outcome, reason));
        }
        Ok::<_, String>(reports)
    });

    match result {
        Ok(turns) => {
            let report = RouteReport {
                command: "route",
                status: "ok",
                session_id: session_id.to_string(),
                turns,
            };
            let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
                format!(
                    "{{\"command\":\"route\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                    escape_json(&error.to_string())
                )
            });
            CommandResult { exit_code: 0, output }
        }
        Err(message) => CommandResult::failure("route", "ontology_load", message, 4),
    }
}

fn turn_report(text: &str, outcome: &TurnOutcome, reason: Option<String>) -> TurnReport {
    let (agent, scheduled) = match outcome {
        TurnOutcome::Replied { agent, scheduled, .. } => {
            (Some(agent.as_str()), scheduled.as_ref().map(|handle| handle.name.clone()))
        }
        _ => (None, None),
    };
    TurnReport {
        text: text.to_string(),
        outcome: outcome.label(),
        agent,
        reason,
        reply: outcome.reply().map(str::to_string),
        scheduled,
    }
}
