//! Watermark persistence and shared HTTP client construction.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use convfeed_core::{WatermarkHistory, WatermarkPath};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryWatermarkStore;

pub const CRATE_NAME: &str = "convfeed-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` leaves outbound calls without a deadline.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some(format!("convfeed/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Build the process-wide reqwest client shared by every collaborator.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watermark store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("watermark store returned http status {status} for {path}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },
    #[error("watermark value at {path} is not a list of timestamps: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Remote key-value document store holding watermark histories.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// `Ok(None)` when nothing has been written at `path` yet.
    async fn read(&self, path: &WatermarkPath) -> Result<Option<Vec<String>>, StoreError>;

    /// Replace the value at `path` with `history`.
    async fn write(&self, path: &WatermarkPath, history: &[String]) -> Result<(), StoreError>;
}

/// Read the history at `path`, seeding the default in memory when absent. Never writes.
pub async fn load_history(
    store: &dyn WatermarkStore,
    path: &WatermarkPath,
) -> Result<WatermarkHistory, StoreError> {
    let stored = store.read(path).await?;
    if stored.as_ref().map_or(true, Vec::is_empty) {
        debug!(%path, "no watermark history stored; using seed");
    }
    Ok(WatermarkHistory::from_stored(stored))
}

/// Firebase-style JSON REST document store: each path is a `.json` document.
#[derive(Debug, Clone)]
pub struct RealtimeDbStore {
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
}

impl RealtimeDbStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            secret,
        }
    }

    pub fn document_url(&self, path: &WatermarkPath) -> String {
        format!(
            "{}/{}/{}.json",
            self.base_url.trim_end_matches('/'),
            path.root.trim_matches('/'),
            path.child.trim_matches('/')
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => request.query(&[("auth", secret)]),
            None => request,
        }
    }
}

#[async_trait]
impl WatermarkStore for RealtimeDbStore {
    async fn read(&self, path: &WatermarkPath) -> Result<Option<Vec<String>>, StoreError> {
        let url = self.document_url(path);
        let span = info_span!("watermark_read", %path);
        async {
            let resp = self.authorize(self.client.get(&url)).send().await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    path: path.to_string(),
                    body,
                });
            }
            serde_json::from_str::<Option<Vec<String>>>(&body).map_err(|source| StoreError::Decode {
                path: path.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn write(&self, path: &WatermarkPath, history: &[String]) -> Result<(), StoreError> {
        let url = self.document_url(path);
        let span = info_span!("watermark_write", %path, entries = history.len());
        async {
            let resp = self.authorize(self.client.put(&url)).json(history).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    path: path.to_string(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}
