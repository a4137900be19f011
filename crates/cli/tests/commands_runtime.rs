use std::env;
use std::sync::{Mutex, OnceLock};

use concierge_cli::commands::{config, doctor, ontology, route};
use serde_json::Value;

const DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../data");

fn valid_env() -> Vec<(&'static str, &'static str)> {
    vec![("CONCIERGE_DATABASE_URL", "sqlite::memory:"), ("CONCIERGE_ONTOLOGY_BASE", DATA_DIR)]
}

#[test]
fn doctor_passes_with_valid_env() {
    with_env(&valid_env(), || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "unexpected doctor report: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let checks = payload["checks"].as_array().expect("checks array");
        let ontology = checks.iter().find(|check| check["name"] == "ontology_load").expect("check");
        assert_eq!(ontology["status"], "pass");
        let egress = checks.iter().find(|check| check["name"] == "channel_egress").expect("check");
        assert_eq!(egress["status"], "skipped");
    });
}

#[test]
fn doctor_fails_when_ontology_is_missing() {
    let missing = env::temp_dir().join("concierge-cli-missing-ontology");
    let missing = missing.to_string_lossy().into_owned();
    with_env(
        &[("CONCIERGE_DATABASE_URL", "sqlite::memory:"), ("CONCIERGE_ONTOLOGY_BASE", &missing)],
        || {
            let result = doctor::run(false);
            assert_eq!(result.exit_code, 1);
            assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
            assert!(result.output.contains("- [fail] ontology_load: server would refuse to start"));
        },
    );
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("CONCIERGE_SESSION_MAX_TURN_ATTEMPTS", "three")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        let checks = payload["checks"].as_array().expect("checks array");
        assert_eq!(checks[0]["status"], "fail");
        assert!(checks[1..].iter().all(|check| check["status"] == "skipped"));
    });
}

#[test]
fn config_reports_sources_and_redacts_channel_credentials() {
    with_env(
        &[
            ("CONCIERGE_DATABASE_URL", "sqlite::memory:"),
            ("CONCIERGE_CHANNEL_ACCESS_SECRET", "very-secret-value"),
        ],
        || {
            let output = config::run();
            assert!(output
                .contains("- database.url = sqlite::memory: (source: env (CONCIERGE_DATABASE_URL))"));
            assert!(output.contains("- session.table = session_state (source: default)"));
            assert!(output.contains(
                "- channel.access_secret = <redacted> (source: env (CONCIERGE_CHANNEL_ACCESS_SECRET))"
            ));
            assert!(output.contains("- channel.access_key = <empty> (source: default)"));
            assert!(!output.contains("very-secret-value"));
        },
    );
}

#[test]
fn ontology_prints_summary() {
    with_env(&valid_env(), || {
        let result = ontology::run();
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "ontology");
        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("products=4"));
        assert!(message.contains("policies=5"));
        assert!(message.contains("concierge-ontology/ontology.json"));
    });
}

#[test]
fn route_runs_turns_against_one_session() {
    with_env(&valid_env(), || {
        let texts = vec!["반팔 재고 있나요".to_string(), "1번이요".to_string()];
        let result = route::run(&texts, "chat-cli");
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["session_id"], "chat-cli");
        let turns = payload["turns"].as_array().expect("turns array");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["agent"], "product");
        assert_eq!(turns[1]["outcome"], "replied");
        assert_eq!(turns[1]["reason"], "continuation_resume");
        let reply = turns[1]["reply"].as_str().unwrap_or_default();
        assert!(reply.starts_with("'티셔츠' 상품의 재고 현황입니다."), "unexpected reply {reply}");
    });
}

#[test]
fn route_reports_interim_reply_for_status_lookup() {
    with_env(&valid_env(), || {
        let texts = vec!["주문번호 20260101-0001 배송조회".to_string()];
        let result = route::run(&texts, route::DEFAULT_SESSION);
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let turn = &payload["turns"][0];
        assert_eq!(turn["agent"], "delivery");
        assert!(turn["scheduled"].as_str().unwrap_or_default().starts_with("chat-followup-cli-session-"));
    });
}

#[test]
fn route_answers_each_text_even_with_a_batch_window() {
    let mut vars = valid_env();
    vars.push(("CONCIERGE_SESSION_BATCH_WINDOW_SECS", "5"));
    with_env(&vars, || {
        let texts = vec!["티셔츠 가격 얼마예요?".to_string(), "안녕하세요".to_string()];
        let result = route::run(&texts, route::DEFAULT_SESSION);
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        for turn in payload["turns"].as_array().expect("turns array") {
            assert_eq!(turn["outcome"], "replied");
        }
    });
}

#[test]
fn route_returns_config_failure_on_invalid_env() {
    with_env(&[("CONCIERGE_SESSION_MAX_TURN_ATTEMPTS", "three")], || {
        let result = route::run(&["안녕하세요".to_string()], route::DEFAULT_SESSION);
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "route");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "CONCIERGE_DATABASE_URL",
        "CONCIERGE_DATABASE_MAX_CONNECTIONS",
        "CONCIERGE_DATABASE_TIMEOUT_SECS",
        "CONCIERGE_ONTOLOGY_SOURCE",
        "CONCIERGE_ONTOLOGY_BASE",
        "CONCIERGE_ONTOLOGY_BUCKET",
        "CONCIERGE_ONTOLOGY_KEY",
        "CONCIERGE_SESSION_TABLE",
        "CONCIERGE_SESSION_MAX_TURN_ATTEMPTS",
        "CONCIERGE_SESSION_BATCH_WINDOW_SECS",
        "CONCIERGE_SCHEDULER_MODE",
        "CONCIERGE_SCHEDULER_ENDPOINT",
        "CONCIERGE_CHANNEL_API_BASE_URL",
        "CONCIERGE_CHANNEL_ACCESS_KEY",
        "CONCIERGE_CHANNEL_ACCESS_SECRET",
        "CONCIERGE_LOGGING_LEVEL",
        "CONCIERGE_LOGGING_FORMAT",
        "CONCIERGE_LOG_LEVEL",
        "CONCIERGE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
