//! Recording fakes of the remote collaborators.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use convfeed_adapters::{AccessToken, CrmError, Notifier, NotifyError, QueryResponse, QueryService, ReportMessage};
use convfeed_core::{Environment, RawRecord};
use serde_json::{json, Value as JsonValue};

use crate::pipeline::Clock;

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl FixedClock {
    pub fn ymd(year: i32, month: u32, day: u32) -> Self {
        Self(NaiveDate::from_ymd_opt(year, month, day).expect("valid date"))
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeCalls {
    pub authentications: Vec<Environment>,
    pub queries: Vec<String>,
}

/// Query service returning canned records, or failing at a chosen step.
#[derive(Debug, Default)]
pub struct FakeQueryService {
    records: Vec<JsonValue>,
    auth_failure: Option<(u16, String)>,
    query_failure: Option<(u16, String)>,
    calls: Mutex<FakeCalls>,
}

impl FakeQueryService {
    pub fn returning(records: Vec<JsonValue>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn failing_auth(status: u16, body: &str) -> Self {
        Self {
            auth_failure: Some((status, body.to_string())),
            ..Self::default()
        }
    }

    pub fn failing_query(status: u16, body: &str) -> Self {
        Self {
            query_failure: Some((status, body.to_string())),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> FakeCalls {
        self.calls.lock().expect("fake state").clone()
    }
}

#[async_trait]
impl QueryService for FakeQueryService {
    async fn authenticate(&self, environment: Environment) -> Result<AccessToken, CrmError> {
        self.calls.lock().expect("fake state").authentications.push(environment);
        if let Some((status, body)) = &self.auth_failure {
            return Err(CrmError::Status {
                status: *status,
                body: body.clone(),
            });
        }
        Ok(AccessToken {
            access_token: format!("{environment}-token"),
            instance_url: format!("https://{environment}.crm.example.com"),
        })
    }

    async fn query(&self, _token: &AccessToken, soql: &str) -> Result<QueryResponse, CrmError> {
        self.calls.lock().expect("fake state").queries.push(soql.to_string());
        if let Some((status, body)) = &self.query_failure {
            return Err(CrmError::Status {
                status: *status,
                body: body.clone(),
            });
        }
        Ok(QueryResponse {
            total_size: self.records.len() as u64,
            done: true,
            records: self
                .records
                .iter()
                .cloned()
                .filter_map(RawRecord::from_value)
                .collect(),
            raw: json!({
                "totalSize": self.records.len(),
                "done": true,
                "records": self.records,
            }),
        })
    }
}

/// Notifier that keeps every message it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    fail_with: Option<u16>,
    sent: Mutex<Vec<ReportMessage>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(status: u16) -> Self {
        Self {
            fail_with: Some(status),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<ReportMessage> {
        self.sent.lock().expect("fake state").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError> {
        self.sent.lock().expect("fake state").push(message.clone());
        match self.fail_with {
            Some(status) => Err(NotifyError::Status {
                status,
                body: "delivery rejected".to_string(),
            }),
            None => Ok(()),
        }
    }
}
