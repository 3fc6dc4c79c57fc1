use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// One report delivery. The destination is fixed by the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMessage {
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail api returned http status {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
struct MailPayload<'a> {
    personalizations: [Personalization<'a>; 1],
    from: Address<'a>,
    subject: &'a str,
    content: [Content<'a>; 1],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<MailAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: [Address<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct MailAttachment<'a> {
    content: String,
    filename: &'a str,
    #[serde(rename = "type")]
    content_type: &'a str,
    disposition: &'static str,
}

/// Sends through a JSON mail API (SendGrid v3 shape) to one fixed recipient.
#[derive(Debug, Clone)]
pub struct MailApiNotifier {
    client: reqwest::Client,
    settings: MailSettings,
}

impl MailApiNotifier {
    pub fn new(client: reqwest::Client, settings: MailSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl Notifier for MailApiNotifier {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError> {
        let payload = MailPayload {
            personalizations: [Personalization {
                to: [Address {
                    email: &self.settings.to,
                }],
            }],
            from: Address {
                email: &self.settings.from,
            },
            subject: &message.subject,
            content: [Content {
                content_type: "text/plain",
                value: &message.body,
            }],
            attachments: message
                .attachment
                .iter()
                .map(|a| MailAttachment {
                    content: STANDARD.encode(&a.content),
                    filename: &a.filename,
                    content_type: &a.content_type,
                    disposition: "attachment",
                })
                .collect(),
        };

        let span = info_span!("mail_send", to = %self.settings.to, subject = %message.subject);
        async {
            let resp = self
                .client
                .post(&self.settings.api_url)
                .bearer_auth(&self.settings.api_key)
                .json(&payload)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}
