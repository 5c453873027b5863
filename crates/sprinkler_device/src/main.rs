mod config;

use crate::config::ServiceConfig;
use anyhow::Context;
use common::telemetry::{init_telemetry, TelemetryConfig};
use device_agent::transport::ExitReason;
use device_agent::{AgentDependencies, DeviceAgent, RunningAgent};
use sprinkler_runner::Runner;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        service_name: "sprinkler-device".to_string(),
        log_level: config.log_level.clone(),
        json: config.log_json,
    }) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        device_name = %config.device_name,
        endpoint = %config.endpoint,
        port = config.port,
        "Starting sprinkler device"
    );
    debug!("Configuration: {:?}", config);

    let agent = match start_agent(&config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = ?e, "Device failed to start");
            std::process::exit(1);
        }
    };

    let supervisor = agent.supervisor();
    let mut runner = Runner::new();
    for (name, process) in agent.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            supervisor.exit(ExitReason::Shutdown).await;
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(config.closer_timeout_secs))
        .run()
        .await;
}

/// Bootstrap, connect and subscribe before anything is scheduled
async fn start_agent(config: &ServiceConfig) -> anyhow::Result<RunningAgent> {
    let settings = config.agent_settings();
    let dependencies = AgentDependencies::production(&settings)
        .context("failed to initialize device dependencies")?;

    DeviceAgent::new(settings, dependencies)
        .start()
        .await
        .context("failed to start device session")
}
