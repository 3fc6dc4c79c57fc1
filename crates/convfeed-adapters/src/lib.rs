//! Remote collaborators of the pipeline: the CRM query service and the report notifier.

mod crm;
mod mail;

pub use crm::{AccessToken, CrmClient, CrmCredentials, CrmError, CrmProfiles, QueryResponse, QueryService};
pub use mail::{Attachment, MailApiNotifier, MailSettings, Notifier, NotifyError, ReportMessage};

pub const CRATE_NAME: &str = "convfeed-adapters";
