use std::process::ExitCode;

use tracing::{error, info};

use popsubd::broker::Node;
use popsubd::config::load_config;
use popsubd::utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let node = match Node::new(settings) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to create node");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = node.load_metadata().await {
        error!(error = %e, "failed to load metadata");
        return ExitCode::FAILURE;
    }
    if let Err(e) = node.persist_metadata() {
        error!(error = %e, "failed to persist metadata");
        return ExitCode::FAILURE;
    }

    node.start();
    info!(health = %node.get_health(), "popsubd running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    node.exit().await;
    ExitCode::SUCCESS
}
