use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use convfeed_adapters::{CrmCredentials, CrmProfiles, MailSettings};
use convfeed_core::ReportType;
use convfeed_storage::HttpClientConfig;

/// Everything the process needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub crm: CrmProfiles,
    pub crm_api_version: String,
    pub watermark_db_url: String,
    pub watermark_db_secret: Option<String>,
    pub watermark_root: String,
    pub mail: MailSettings,
    pub exclude_host_prefixes: Vec<String>,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
    pub scheduled_report: ReportType,
    pub web_port: u16,
    /// `None` keeps the HTTP client's default user agent.
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| anyhow!("missing required setting {key}"));

        let production = CrmCredentials {
            login_url: get("CRM_LOGIN_URL").unwrap_or_else(|| "https://login.salesforce.com".to_string()),
            client_id: required("CRM_CLIENT_ID")?,
            client_secret: required("CRM_CLIENT_SECRET")?,
            username: required("CRM_USERNAME")?,
            password: required("CRM_PASSWORD")?,
        };
        let uat = CrmCredentials {
            login_url: get("UAT_CRM_LOGIN_URL").unwrap_or_else(|| "https://test.salesforce.com".to_string()),
            client_id: get("UAT_CRM_CLIENT_ID").unwrap_or_else(|| production.client_id.clone()),
            client_secret: get("UAT_CRM_CLIENT_SECRET")
                .unwrap_or_else(|| production.client_secret.clone()),
            username: get("UAT_CRM_USERNAME").unwrap_or_else(|| production.username.clone()),
            password: get("UAT_CRM_PASSWORD").unwrap_or_else(|| production.password.clone()),
        };

        let scheduled_report = match get("CONVFEED_SCHEDULED_REPORT") {
            Some(selector) => selector
                .parse::<ReportType>()
                .context("parsing CONVFEED_SCHEDULED_REPORT")?,
            None => ReportType::GoogleSearchAdsConversions,
        };

        Ok(Self {
            api_key: required("CONVFEED_API_KEY")?,
            crm: CrmProfiles { production, uat },
            crm_api_version: get("CRM_API_VERSION").unwrap_or_else(|| "v57.0".to_string()),
            watermark_db_url: required("WATERMARK_DB_URL")?,
            watermark_db_secret: get("WATERMARK_DB_SECRET"),
            watermark_root: get("WATERMARK_ROOT").unwrap_or_else(|| "lastRun".to_string()),
            mail: MailSettings {
                api_url: get("MAIL_API_URL")
                    .unwrap_or_else(|| "https://api.sendgrid.com/v3/mail/send".to_string()),
                api_key: required("MAIL_API_KEY")?,
                from: required("MAIL_FROM")?,
                to: required("MAIL_TO")?,
            },
            exclude_host_prefixes: get("REPORT_EXCLUDE_HOST_PREFIXES")
                .unwrap_or_else(|| "getstarted.".to_string())
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect(),
            scheduler_enabled: get("CONVFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schedule_cron: get("CONVFEED_SCHEDULE_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            scheduled_report,
            web_port: match get("CONVFEED_WEB_PORT") {
                Some(port) => port.parse().context("parsing CONVFEED_WEB_PORT")?,
                None => 8000,
            },
            user_agent: get("CONVFEED_USER_AGENT"),
            http_timeout_secs: match get("CONVFEED_HTTP_TIMEOUT_SECS") {
                Some(secs) => Some(secs.parse().context("parsing CONVFEED_HTTP_TIMEOUT_SECS")?),
                None => None,
            },
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: self.user_agent.clone().or(defaults.user_agent),
        }
    }
}
