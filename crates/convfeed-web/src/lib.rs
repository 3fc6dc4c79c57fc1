//! Axum trigger endpoint for incremental report runs.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use convfeed_core::{Environment, ReportType, RunWindow};
use convfeed_sync::{IncrementalPipeline, RunError, RunOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "convfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub api_key: String,
    pub pipeline: IncrementalPipeline,
}

impl AppState {
    pub fn new(api_key: impl Into<String>, pipeline: IncrementalPipeline) -> Self {
        Self {
            api_key: api_key.into(),
            pipeline,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunQuery {
    key: Option<String>,
    env: Option<String>,
    report_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSuccess<'a> {
    success: bool,
    run_id: String,
    report_type: ReportType,
    environment: Environment,
    window: &'a RunWindow,
    records: usize,
    delivered: bool,
    watermark_committed: bool,
    result: &'a JsonValue,
}

impl<'a> From<&'a RunOutcome> for RunSuccess<'a> {
    fn from(outcome: &'a RunOutcome) -> Self {
        Self {
            success: true,
            run_id: outcome.run_id.to_string(),
            report_type: outcome.report_type,
            environment: outcome.environment,
            window: &outcome.window,
            records: outcome.reported_records,
            delivered: outcome.delivered,
            watermark_committed: outcome.watermark_committed,
            result: &outcome.query_result,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/run", get(run_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn run_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunQuery>) -> Response {
    if query.key.as_deref() != Some(state.api_key.as_str()) {
        warn!("trigger rejected: bad key");
        return failure(StatusCode::FORBIDDEN, json!("forbidden"));
    }

    let report_type = match query.report_type.as_deref().unwrap_or_default().parse::<ReportType>() {
        Ok(report_type) => report_type,
        Err(err) => return failure(StatusCode::BAD_REQUEST, json!(err.to_string())),
    };
    let environment = Environment::from_selector(query.env.as_deref());

    match state.pipeline.run(report_type, environment).await {
        Ok(outcome) => (StatusCode::OK, Json(RunSuccess::from(&outcome))).into_response(),
        Err(err) => run_error(err),
    }
}

/// Upstream status (500 when there is none) with the upstream body, parsed as JSON when possible.
fn run_error(err: RunError) -> Response {
    let status = err
        .upstream_status()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .filter(|s| s.is_client_error() || s.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let detail = match err.body() {
        Some(body) => serde_json::from_str(body).unwrap_or_else(|_| json!(body)),
        None => json!(err.to_string()),
    };
    warn!(%status, error = %err, "run failed");
    failure(status, detail)
}

fn failure(status: StatusCode, error: JsonValue) -> Response {
    (status, Json(json!({"success": false, "error": error}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use convfeed_core::{WatermarkPath, DEFAULT_WATERMARK};
    use convfeed_storage::MemoryWatermarkStore;
    use convfeed_sync::testing::{FakeQueryService, FixedClock, RecordingNotifier};
    use convfeed_sync::PipelineSettings;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Harness {
        crm: Arc<FakeQueryService>,
        store: Arc<MemoryWatermarkStore>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new(crm: FakeQueryService) -> Self {
            Self {
                crm: Arc::new(crm),
                store: Arc::new(MemoryWatermarkStore::new()),
                notifier: Arc::new(RecordingNotifier::new()),
            }
        }

        fn app(&self) -> Router {
            let pipeline = IncrementalPipeline::new(
                PipelineSettings {
                    watermark_root: "lastRun".into(),
                    exclude_host_prefixes: vec!["getstarted.".into()],
                },
                self.crm.clone(),
                self.store.clone(),
                self.notifier.clone(),
            )
            .with_clock(Arc::new(FixedClock::ymd(2023, 3, 9)));
            app(AppState::new("trigger-key", pipeline))
        }

        async fn untouched(&self) -> bool {
            self.crm.calls() == Default::default()
                && self.store.reads().await == 0
                && self.store.writes().await == 0
                && self.notifier.sent().is_empty()
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden_without_side_effects() {
        let harness = Harness::new(FakeQueryService::returning(vec![]));
        let (status, body) = get(
            harness.app(),
            "/run?key=nope&reportType=googleSearchAdsConversions",
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
        assert!(harness.untouched().await);

        let (status, _) = get(harness.app(), "/run?reportType=googleSearchAdsConversions").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(harness.untouched().await);
    }

    #[tokio::test]
    async fn unsupported_report_type_is_rejected_explicitly() {
        let harness = Harness::new(FakeQueryService::returning(vec![]));
        let (status, body) = get(harness.app(), "/run?key=trigger-key&reportType=facebookLeads").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported report type: facebookLeads");
        assert!(harness.untouched().await);

        let (status, _) = get(harness.app(), "/run?key=trigger-key").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(harness.untouched().await);
    }

    #[tokio::test]
    async fn successful_run_returns_one_body_with_upstream_result() {
        let harness = Harness::new(FakeQueryService::returning(vec![]));
        let (status, body) = get(
            harness.app(),
            "/run?key=trigger-key&env=uat&reportType=googleSearchAdsConversions",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["reportType"], "googleSearchAdsConversions");
        assert_eq!(body["environment"], "uat");
        assert_eq!(body["window"]["lower"], DEFAULT_WATERMARK);
        assert_eq!(body["window"]["upper"], "2023-03-09T00:00:00.000Z");
        assert_eq!(body["records"], 0);
        assert_eq!(body["watermarkCommitted"], true);
        assert_eq!(body["result"]["totalSize"], 0);

        assert_eq!(harness.crm.calls().authentications, vec![Environment::Uat]);
        assert_eq!(harness.notifier.sent().len(), 1);
        assert_eq!(
            harness
                .store
                .get(&WatermarkPath::new("lastRun", "googleSearchAdsConversions"))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn upstream_failure_keeps_status_and_raw_body() {
        let harness = Harness::new(FakeQueryService::failing_query(
            400,
            r#"[{"errorCode":"MALFORMED_QUERY","message":"unexpected token"}]"#,
        ));
        let (status, body) = get(
            harness.app(),
            "/run?key=trigger-key&reportType=googleSearchAdsConversions",
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"][0]["errorCode"], "MALFORMED_QUERY");
        assert!(harness.notifier.sent().is_empty());
        assert_eq!(harness.store.writes().await, 0);
    }

    #[tokio::test]
    async fn non_json_upstream_body_is_wrapped_as_string() {
        let harness = Harness::new(FakeQueryService::failing_auth(503, "upstream unavailable"));
        let (status, body) = get(
            harness.app(),
            "/run?key=trigger-key&reportType=googleSearchAdsConversions",
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "upstream unavailable");
    }

    #[tokio::test]
    async fn health_check_responds() {
        let harness = Harness::new(FakeQueryService::default());
        let (status, body) = get(harness.app(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
