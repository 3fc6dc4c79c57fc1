//! Incremental report orchestration: configuration, the run pipeline and its cron trigger.

mod config;
mod pipeline;
mod report;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use anyhow::{Context, Result};
use convfeed_core::{Environment, ReportType};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub use config::AppConfig;
pub use pipeline::{Clock, IncrementalPipeline, LocalClock, PipelineSettings, RunError, RunOutcome};
pub use report::{build_report, encode_report, Report, NO_CONVERSIONS_BODY};

pub const CRATE_NAME: &str = "convfeed-sync";

/// Cron-driven trigger that runs `report_type` against production on every tick.
pub async fn build_scheduler(
    pipeline: IncrementalPipeline,
    cron: &str,
    report_type: ReportType,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run(report_type, Environment::Production).await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    reported_records = outcome.reported_records,
                    "scheduled run finished"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &AppConfig,
    pipeline: &IncrementalPipeline,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline.clone(), &config.schedule_cron, config.scheduled_report)
        .await
        .map(Some)
}
