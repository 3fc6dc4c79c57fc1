use anyhow::Result;
use clap::{Parser, Subcommand};
use convfeed_core::{Environment, ReportType};
use convfeed_sync::{maybe_build_scheduler, AppConfig, IncrementalPipeline};
use convfeed_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "convfeed")]
#[command(about = "Incremental CRM conversions report feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental report and exit.
    Run {
        /// `uat` selects the UAT credential profile; anything else is production.
        #[arg(long, default_value = "prod")]
        env: String,
        #[arg(long, default_value = "googleSearchAdsConversions")]
        report_type: ReportType,
    },
    /// Serve the trigger endpoint, plus the cron trigger when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let pipeline = IncrementalPipeline::from_config(&config)?;

    match cli.command.unwrap_or(Commands::Run {
        env: "prod".to_string(),
        report_type: ReportType::GoogleSearchAdsConversions,
    }) {
        Commands::Run { env, report_type } => {
            let outcome = pipeline
                .run(report_type, Environment::from_selector(Some(env.as_str())))
                .await?;
            println!(
                "run complete: run_id={} report={} window=({}, {}) records={} delivered={} watermark_committed={}",
                outcome.run_id,
                outcome.report_type,
                outcome.window.lower,
                outcome.window.upper,
                outcome.reported_records,
                outcome.delivered,
                outcome.watermark_committed
            );
        }
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(&config, &pipeline).await?;
            if let Some(sched) = &scheduler {
                sched.start().await?;
                info!(cron = %config.schedule_cron, report = %config.scheduled_report, "scheduler started");
            }
            let state = AppState::new(config.api_key.clone(), pipeline);
            tokio::select! {
                res = convfeed_web::serve(config.web_port, state) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            if let Some(mut sched) = scheduler {
                sched.shutdown().await?;
            }
        }
    }

    Ok(())
}
