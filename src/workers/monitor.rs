//! Monitoring worker for deployed instances

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::deploy::fsm::DeploymentState;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::ManagerError;
use crate::registry::ListFilter;
use crate::telemetry::MetricsSampler;

/// Monitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between monitoring sweeps
    pub interval: Duration,

    /// Initial delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Run the monitor worker
pub async fn run<S, F>(
    options: &Options,
    orchestrator: &Arc<Orchestrator>,
    sampler: &Arc<MetricsSampler>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Monitor worker starting...");

    sleep_fn(options.initial_delay).await;

    loop {
        // Check for shutdown
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Monitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with sweep
            }
        }

        poll_once(orchestrator, sampler).await;
    }
}

/// One monitoring sweep over every probe-worthy instance.
///
/// Instances are probed in independent tasks so one slow target cannot
/// delay health verdicts for the rest. Running, starting and stopping
/// instances with a handle are covered; crash reports on a stopping
/// instance resolve as no-ops in the state machine.
pub async fn poll_once(orchestrator: &Arc<Orchestrator>, sampler: &Arc<MetricsSampler>) {
    let watched: Vec<_> = orchestrator
        .registry()
        .list(&ListFilter::default())
        .await
        .into_iter()
        .filter(|instance| {
            instance.handle.is_some()
                && matches!(
                    instance.state,
                    DeploymentState::Running | DeploymentState::Starting | DeploymentState::Stopping
                )
        })
        .collect();

    if watched.is_empty() {
        return;
    }
    debug!("Monitoring {} deployment(s)", watched.len());

    let sweeps = watched.into_iter().map(|instance| {
        let orchestrator = Arc::clone(orchestrator);
        let sampler = Arc::clone(sampler);
        tokio::spawn(async move {
            check_instance(&orchestrator, &sampler, &instance.id).await;
        })
    });

    for result in join_all(sweeps).await {
        if let Err(e) = result {
            warn!("Monitor sweep task panicked: {}", e);
        }
    }
}

async fn check_instance(orchestrator: &Arc<Orchestrator>, sampler: &Arc<MetricsSampler>, id: &str) {
    match orchestrator.probe(id).await {
        Ok(status) if status.is_up() => {
            sample_metrics(orchestrator, sampler, id).await;
        }
        Ok(status) => {
            let cause = format!("Health probe reported {}", status);
            if let Err(e) = orchestrator.mark_crashed(id, cause).await {
                debug!("Crash mark for {} skipped: {}", id, e);
            }
        }
        Err(ManagerError::ProbeTimeout(timeout)) => {
            let cause = format!("Health probe timed out after {:?}", timeout);
            if let Err(e) = orchestrator.mark_crashed(id, cause).await {
                debug!("Crash mark for {} skipped: {}", id, e);
            }
        }
        Err(ManagerError::NotFound(_)) => {
            // Archived between the list and the probe
        }
        Err(e) => {
            warn!("Probe for {} failed: {}", id, e);
        }
    }
}

/// Refresh CPU/RAM for a process-backed instance. Container and cloud
/// targets have no local pid and keep their last sample.
async fn sample_metrics(
    orchestrator: &Arc<Orchestrator>,
    sampler: &Arc<MetricsSampler>,
    id: &str,
) {
    let pid = match orchestrator.registry().get(id).await {
        Some(instance) => instance.handle.and_then(|h| h.pid),
        None => return,
    };
    let Some(pid) = pid else {
        return;
    };

    if let Some(sample) = sampler.sample(pid) {
        let result = orchestrator
            .registry()
            .update(id, |instance| {
                instance.last_metrics = Some(sample);
            })
            .await;
        if let Err(e) = result {
            debug!("Metrics update for {} skipped: {}", id, e);
        }
    }
}
