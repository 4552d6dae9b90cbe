//! Recurring daily monitoring

use anyhow::{Context, Result};
use chrono::NaiveTime;
use forest_lib::health::components;
use forest_lib::scheduler::{ArmOutcome, LocalClock};
use forest_lib::{
    Coordinate, Credential, HealthRegistry, MonitorScheduler, PipelineMetrics, ScheduleEntry,
    StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::api;
use crate::config::AgentConfig;
use crate::AGENT_VERSION;

/// Arguments of `forest-agent monitor`
#[derive(Debug)]
pub struct MonitorArgs {
    pub sites: Vec<Coordinate>,
    pub fire_time: NaiveTime,
    pub credential: Credential,
}

/// Arm one entry per site and serve health and metrics until Ctrl-C
pub async fn run_monitor(config: &AgentConfig, args: MonitorArgs) -> Result<()> {
    let health = HealthRegistry::for_pipeline().await;
    let metrics = PipelineMetrics::new();
    let logger = StructuredLogger::new(config.instance_name.clone());

    let orchestrator = super::build_orchestrator(config, health.clone(), logger.clone())?;
    let model = orchestrator.classifier().model_name().to_string();

    let scheduler = MonitorScheduler::new(
        Arc::new(orchestrator),
        Arc::new(LocalClock),
        config.schedule,
    )
    .with_logger(logger.clone());

    for site in &args.sites {
        let entry = ScheduleEntry::new(*site, args.credential.clone(), args.fire_time);
        if scheduler.arm(entry).context("failed to arm schedule entry")? == ArmOutcome::Replaced {
            warn!(site = %site, "Site listed more than once");
        }
    }

    logger.log_startup(AGENT_VERSION, &model, scheduler.armed_count());
    health.set_ready(true).await;

    let app_state = Arc::new(api::AppState::new(health.clone(), metrics));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = stop_rx.await;
    }));

    let mut api_finished = false;
    let outcome: Result<&str> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal").map(|_| "SIGINT received")
        }
        served = &mut api_handle => {
            api_finished = true;
            match served {
                Ok(Ok(())) => Ok("API server stopped"),
                Ok(Err(err)) => Err(err.context("API server failed")),
                Err(err) => Err(anyhow::Error::new(err).context("API server task failed")),
            }
        }
    };

    let reason = match &outcome {
        Ok(reason) => *reason,
        Err(_) => "error",
    };
    logger.log_shutdown(reason);
    info!("Waiting for in-flight runs");

    health.set_ready(false).await;
    scheduler.shutdown().await;
    health.set_unhealthy(components::SCHEDULER, "stopped").await;

    let _ = stop_tx.send(());
    if !api_finished {
        if let Ok(Err(err)) = api_handle.await {
            warn!(error = %err, "API server exited with error");
        }
    }

    outcome.map(|_| ())
}
