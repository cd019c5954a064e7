use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{AggregationEngine, SyncConfig};

/// Builds a scheduler that re-aggregates every configured cycle on
/// `aggregate_cron`. Returns `None` when scheduling is disabled. The caller
/// starts the scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<AggregationEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cycles = config.cycles.clone();
    let cron = config.aggregate_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        let cycles = cycles.clone();
        Box::pin(async move {
            for cycle in cycles {
                match engine.aggregate(cycle).await {
                    Ok(summary) => info!(
                        cycle,
                        contributors = summary.contributors,
                        candidates = summary.candidates,
                        regions = summary.regions,
                        "scheduled aggregation complete"
                    ),
                    Err(err) => error!(cycle, error = %format!("{err:#}"), "scheduled aggregation failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating aggregation job for cron {cron}"))?;
    sched.add(job).await.context("adding aggregation job")?;
    Ok(Some(sched))
}
