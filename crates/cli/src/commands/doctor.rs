use concierge_core::config::{AppConfig, LoadOptions, SchedulerMode};
use concierge_db::connect_with_settings;
use serde::Serialize;

use crate::commands::{current_thread_runtime, escape_json, load_ontology, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Exit code is 1 when any check failed; skipped checks do not count.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(check_runtime_dependencies(&config));
            checks.push(check_channel_egress(&config));
            checks.push(check_scheduler(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["ontology_load", "database_connectivity", "channel_egress", "scheduler"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_runtime_dependencies(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck {
                    name: "ontology_load",
                    status: CheckStatus::Fail,
                    details: details.clone(),
                },
                DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details },
            ];
        }
    };

    let ontology = runtime.block_on(load_ontology(config));
    let ontology_check = match ontology {
        Ok(index) => {
            let stats = index.stats();
            DoctorCheck {
                name: "ontology_load",
                status: CheckStatus::Pass,
                details: format!(
                    "loaded `{}`: {} products, {} policies",
                    config.ontology.location(),
                    stats.products,
                    stats.policies
                ),
            }
        }
        Err(error) => DoctorCheck {
            name: "ontology_load",
            status: CheckStatus::Fail,
            details: format!("server would refuse to start: {error}"),
        },
    };

    let database = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    });

    let database_check = match database {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    };

    vec![ontology_check, database_check]
}

fn check_channel_egress(config: &AppConfig) -> DoctorCheck {
    match &config.channel.api_base_url {
        Some(base_url) => DoctorCheck {
            name: "channel_egress",
            status: CheckStatus::Pass,
            details: format!("replies are posted to `{base_url}`"),
        },
        None => DoctorCheck {
            name: "channel_egress",
            status: CheckStatus::Skipped,
            details: "channel.api_base_url is unset; replies are logged and dropped".to_string(),
        },
    }
}

fn check_scheduler(config: &AppConfig) -> DoctorCheck {
    let details = match config.scheduler.mode {
        SchedulerMode::Local => {
            format!("in-process timers for `{}`; pending checks are lost on restart", config.scheduler.target)
        }
        SchedulerMode::Http => format!(
            "submitting `{}` executions to `{}`",
            config.scheduler.target,
            config.scheduler.endpoint.as_deref().unwrap_or("<unset>")
        ),
    };
    DoctorCheck { name: "scheduler", status: CheckStatus::Pass, details }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
