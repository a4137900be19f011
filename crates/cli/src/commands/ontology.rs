use concierge_core::config::{AppConfig, LoadOptions};

use crate::commands::{current_thread_runtime, load_ontology, CommandResult};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ontology",
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
                "ontology",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(load_ontology(&config)) {
        Ok(index) => {
            let stats = index.stats();
            CommandResult::success(
                "ontology",
                format!(
                    "namespace={} categories={} products={} variants={} policies={} (source: {})",
                    stats.namespace.as_deref().unwrap_or("<none>"),
                    stats.categories,
                    stats.products,
                    stats.variants,
                    stats.policies,
                    config.ontology.location(),
                ),
            )
        }
        Err(error) => CommandResult::failure("ontology", "ontology_load", error.to_string(), 4),
    }
}
