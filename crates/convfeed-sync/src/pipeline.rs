//! The incremental run: watermark window, query, post-process, notify, commit.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use convfeed_adapters::{CrmClient, CrmError, MailApiNotifier, Notifier, QueryService};
use convfeed_core::{Environment, ReportType, RunWindow, WatermarkPath};
use convfeed_storage::{build_http_client, load_history, RealtimeDbStore, StoreError, WatermarkStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::report::build_report;

/// Source of "today" for the upper bound.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub watermark_root: String,
    pub exclude_host_prefixes: Vec<String>,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            watermark_root: config.watermark_root.clone(),
            exclude_host_prefixes: config.exclude_host_prefixes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub report_type: ReportType,
    pub environment: Environment,
    pub window: RunWindow,
    pub fetched_records: usize,
    pub reported_records: usize,
    pub delivered: bool,
    pub watermark_committed: bool,
    /// Query service response body, first page as received.
    pub query_result: JsonValue,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("authentication failed: {0}")]
    Authentication(#[source] CrmError),
    #[error("report query failed: {0}")]
    Query(#[source] CrmError),
    #[error("watermark read failed: {0}")]
    WatermarkRead(#[source] StoreError),
    #[error("report encoding failed: {0}")]
    Encode(#[from] csv::Error),
}

impl RunError {
    /// HTTP status returned by the failing collaborator, when it got that far.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Authentication(err) | Self::Query(err) => err.status(),
            Self::WatermarkRead(err) => err.status(),
            Self::Encode(_) => None,
        }
    }

    /// Raw body returned by the failing collaborator.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Authentication(err) | Self::Query(err) => err.body(),
            Self::WatermarkRead(err) => err.body(),
            Self::Encode(_) => None,
        }
    }
}

/// Turns the stateless query API into an incremental feed. Clients are shared, never global.
#[derive(Clone)]
pub struct IncrementalPipeline {
    settings: PipelineSettings,
    crm: Arc<dyn QueryService>,
    store: Arc<dyn WatermarkStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl IncrementalPipeline {
    pub fn new(
        settings: PipelineSettings,
        crm: Arc<dyn QueryService>,
        store: Arc<dyn WatermarkStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            crm,
            store,
            notifier,
            clock: Arc::new(LocalClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wire the production collaborators over one shared HTTP client.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let http = build_http_client(&config.http_client_config())?;
        let crm = CrmClient::new(http.clone(), config.crm.clone(), config.crm_api_version.clone());
        let store = RealtimeDbStore::new(
            http.clone(),
            config.watermark_db_url.clone(),
            config.watermark_db_secret.clone(),
        );
        let notifier = MailApiNotifier::new(http, config.mail.clone());
        Ok(Self::new(
            PipelineSettings::from(config),
            Arc::new(crm),
            Arc::new(store),
            Arc::new(notifier),
        ))
    }

    pub fn watermark_path(&self, report_type: ReportType) -> WatermarkPath {
        WatermarkPath::for_report(&self.settings.watermark_root, report_type)
    }

    /// One invocation. Authentication, watermark read and query failures abort;
    /// notification and watermark write failures are logged and reflected in the outcome.
    pub async fn run(&self, report_type: ReportType, environment: Environment) -> Result<RunOutcome, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("incremental_run", %run_id, %report_type, %environment);
        self.run_inner(run_id, report_type, environment)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        report_type: ReportType,
        environment: Environment,
    ) -> Result<RunOutcome, RunError> {
        let token = self
            .crm
            .authenticate(environment)
            .await
            .map_err(RunError::Authentication)?;

        let path = self.watermark_path(report_type);
        let mut history = load_history(self.store.as_ref(), &path)
            .await
            .map_err(RunError::WatermarkRead)?;

        let window = RunWindow::compute(&history, self.clock.today());
        if window.is_degenerate() {
            warn!(lower = %window.lower, upper = %window.upper, "run window is empty; already ran today");
        }

        let response = self
            .crm
            .query(&token, &report_type.soql(&window))
            .await
            .map_err(RunError::Query)?;
        let fetched_records = response.records.len();

        let report = build_report(
            report_type,
            &window,
            response.records,
            &self.settings.exclude_host_prefixes,
        )?;

        let delivered = match self.notifier.send(&report.message).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    operation = "notify",
                    lower = %window.lower,
                    upper = %window.upper,
                    subject = %report.message.subject,
                    error = %err,
                    "report delivery failed; committing watermark anyway"
                );
                false
            }
        };

        history.append(window.upper.clone());
        let watermark_committed = match self.store.write(&path, history.entries()).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    operation = "watermark_write",
                    %path,
                    lower = %window.lower,
                    upper = %window.upper,
                    error = %err,
                    "watermark commit failed; next run will repeat this window"
                );
                false
            }
        };

        info!(
            fetched_records,
            reported_records = report.rows,
            delivered,
            watermark_committed,
            "incremental run complete"
        );

        Ok(RunOutcome {
            run_id,
            report_type,
            environment,
            window,
            fetched_records,
            reported_records: report.rows,
            delivered,
            watermark_committed,
            query_result: response.raw,
        })
    }
}
