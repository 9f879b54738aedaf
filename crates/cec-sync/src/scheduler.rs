use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::{CancellationFlag, Orchestrator, RunSelection};

/// Build a scheduler running every enabled category on `CEC_SYNC_CRON`, or
/// `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    orchestrator: &Orchestrator,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let orchestrator = orchestrator.clone();
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            match orchestrator
                .run_and_record(RunSelection::All, &CancellationFlag::new())
                .await
            {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    status = ?report.status,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
