use std::fmt;

use async_trait::async_trait;
use convfeed_core::{Environment, RawRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmCredentials {
    pub login_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

/// Credential sets keyed by environment selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmProfiles {
    pub production: CrmCredentials,
    pub uat: CrmCredentials,
}

impl CrmProfiles {
    pub fn for_env(&self, environment: Environment) -> &CrmCredentials {
        match environment {
            Environment::Production => &self.production,
            Environment::Uat => &self.uat,
        }
    }
}

/// Bearer credential returned by the token exchange. No expiry handling.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub instance_url: String,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub total_size: u64,
    pub done: bool,
    pub records: Vec<RawRecord>,
    /// First page exactly as the service returned it.
    pub raw: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    total_size: u64,
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default)]
    records: Vec<JsonValue>,
    #[serde(default)]
    next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("crm returned http status {status}")]
    Status { status: u16, body: String },
    #[error("crm response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl CrmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Authenticated query API of the CRM.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn authenticate(&self, environment: Environment) -> Result<AccessToken, CrmError>;

    async fn query(&self, token: &AccessToken, soql: &str) -> Result<QueryResponse, CrmError>;
}

#[derive(Debug, Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    profiles: CrmProfiles,
    api_version: String,
}

impl CrmClient {
    pub fn new(client: reqwest::Client, profiles: CrmProfiles, api_version: impl Into<String>) -> Self {
        Self {
            client,
            profiles,
            api_version: api_version.into(),
        }
    }

    async fn fetch_page(&self, token: &AccessToken, request: reqwest::RequestBuilder) -> Result<JsonValue, CrmError> {
        let resp = request.bearer_auth(&token.access_token).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CrmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl QueryService for CrmClient {
    async fn authenticate(&self, environment: Environment) -> Result<AccessToken, CrmError> {
        let creds = self.profiles.for_env(environment);
        let url = format!(
            "{}/services/oauth2/token",
            creds.login_url.trim_end_matches('/')
        );
        let span = info_span!("crm_authenticate", %environment);
        async {
            let resp = self
                .client
                .post(&url)
                .form(&[
                    ("grant_type", "password"),
                    ("client_id", creds.client_id.as_str()),
                    ("client_secret", creds.client_secret.as_str()),
                    ("username", creds.username.as_str()),
                    ("password", creds.password.as_str()),
                ])
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(CrmError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let token: AccessToken = serde_json::from_str(&body)?;
            debug!(instance_url = %token.instance_url, "crm token issued");
            Ok(token)
        }
        .instrument(span)
        .await
    }

    async fn query(&self, token: &AccessToken, soql: &str) -> Result<QueryResponse, CrmError> {
        let base = token.instance_url.trim_end_matches('/');
        let url = format!("{base}/services/data/{}/query", self.api_version);
        let span = info_span!("crm_query", api_version = %self.api_version);
        async {
            let raw = self
                .fetch_page(token, self.client.get(&url).query(&[("q", soql)]))
                .await?;
            let first: QueryPage = serde_json::from_value(raw.clone())?;

            let total_size = first.total_size;
            let mut done = first.done;
            let mut next = first.next_records_url;
            let mut values = first.records;

            while !done {
                let Some(next_url) = next.take() else { break };
                debug!(%next_url, fetched = values.len(), "following crm result page");
                let page: QueryPage = serde_json::from_value(
                    self.fetch_page(token, self.client.get(format!("{base}{next_url}")))
                        .await?,
                )?;
                values.extend(page.records);
                done = page.done;
                next = page.next_records_url;
            }

            Ok::<_, CrmError>(QueryResponse {
                total_size,
                done,
                records: values.into_iter().filter_map(RawRecord::from_value).collect(),
                raw,
            })
        }
        .instrument(span)
        .await
    }
}
