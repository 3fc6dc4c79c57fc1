//! Delimited-text rendering of a report and the message that carries it.

use convfeed_adapters::{Attachment, ReportMessage};
use convfeed_core::{post_process, project, RawRecord, ReportType, RunWindow};

pub const NO_CONVERSIONS_BODY: &str = "No conversions for this run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Data rows written, header excluded.
    pub rows: usize,
    pub message: ReportMessage,
}

/// Header row plus one row per record, comma-separated with standard CSV quoting.
pub fn encode_report(report_type: ReportType, records: &[RawRecord]) -> Result<String, csv::Error> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(report_type.columns().iter().map(|c| c.header))?;
    for row in project(report_type, records) {
        writer.write_record(&row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Build the outgoing message for one run. An empty result set becomes the fixed "no conversions" body.
pub fn build_report(
    report_type: ReportType,
    window: &RunWindow,
    records: Vec<RawRecord>,
    exclude_host_prefixes: &[String],
) -> Result<Report, csv::Error> {
    let subject = report_type.subject(window);
    if records.is_empty() {
        return Ok(Report {
            rows: 0,
            message: ReportMessage {
                subject,
                body: NO_CONVERSIONS_BODY.to_string(),
                attachment: None,
            },
        });
    }

    let kept = post_process(report_type, records, exclude_host_prefixes);
    let csv_text = encode_report(report_type, &kept)?;
    let date = window.upper.get(..10).unwrap_or(window.upper.as_str());
    Ok(Report {
        rows: kept.len(),
        message: ReportMessage {
            subject,
            attachment: Some(Attachment {
                filename: format!("{}-{date}.csv", report_type.selector()),
                content_type: "text/csv".to_string(),
                content: csv_text.as_bytes().to_vec(),
            }),
            body: csv_text,
        },
    })
}
