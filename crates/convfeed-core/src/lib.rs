//! Core domain model for the conversions feed: report types, records, watermarks and run windows.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "convfeed-core";

/// Lower bound used when no watermark history has been persisted yet.
pub const DEFAULT_WATERMARK: &str = "2022-11-22T23:59:59.999Z";

/// Credential/endpoint profile selected by the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Uat,
}

impl Environment {
    /// Only an explicit `uat` selects the UAT profile; anything else is production.
    pub fn from_selector(selector: Option<&str>) -> Self {
        match selector {
            Some(s) if s.trim().eq_ignore_ascii_case("uat") => Self::Uat,
            _ => Self::Production,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Uat => "uat",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported report type: {0}")]
pub struct UnknownReportType(pub String);

/// One output column: dotted source path in the raw record plus the header it is written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub source_path: &'static str,
    pub header: &'static str,
}

const GOOGLE_SEARCH_ADS_COLUMNS: &[Column] = &[
    Column {
        source_path: "GCLID__c",
        header: "Google Click ID",
    },
    Column {
        source_path: "Opportunity__r.StageName",
        header: "Stage Name",
    },
    Column {
        source_path: "Opportunity__r.Application_Date__c",
        header: "Application Date",
    },
];

/// Closed set of reports the feed knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    #[serde(rename = "googleSearchAdsConversions")]
    GoogleSearchAdsConversions,
}

impl ReportType {
    pub const ALL: &'static [ReportType] = &[ReportType::GoogleSearchAdsConversions];

    pub fn selector(&self) -> &'static str {
        match self {
            Self::GoogleSearchAdsConversions => "googleSearchAdsConversions",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::GoogleSearchAdsConversions => "Google Search Ads conversions",
        }
    }

    /// Child key under the watermark root. One report type per key.
    pub fn watermark_key(&self) -> &'static str {
        self.selector()
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            Self::GoogleSearchAdsConversions => GOOGLE_SEARCH_ADS_COLUMNS,
        }
    }

    /// Field whose first occurrence wins during deduplication.
    pub fn dedup_key(&self) -> &'static str {
        match self {
            Self::GoogleSearchAdsConversions => "Opportunity__c",
        }
    }

    pub fn source_url_field(&self) -> &'static str {
        match self {
            Self::GoogleSearchAdsConversions => "Source_URL__c",
        }
    }

    /// Query selecting records created strictly inside `window`, newest application first.
    pub fn soql(&self, window: &RunWindow) -> String {
        match self {
            Self::GoogleSearchAdsConversions => format!(
                "SELECT GCLID__c, Opportunity__c, Source_URL__c, CreatedDate, \
                 Opportunity__r.StageName, Opportunity__r.Application_Date__c \
                 FROM Web_Tracking__c \
                 WHERE GCLID__c != null \
                 AND Opportunity__c != null \
                 AND Opportunity__r.Application_Date__c != null \
                 AND Opportunity__r.Name != 'Test Test' \
                 AND CreatedDate > {} \
                 AND CreatedDate < {} \
                 ORDER BY Opportunity__r.Application_Date__c DESC",
                window.lower, window.upper
            ),
        }
    }

    pub fn subject(&self, window: &RunWindow) -> String {
        format!("{} {} - {}", self.label(), window.lower, window.upper)
    }
}

impl FromStr for ReportType {
    type Err = UnknownReportType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.selector() == s.trim())
            .ok_or_else(|| UnknownReportType(s.to_string()))
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.selector())
    }
}

/// Location of a watermark history in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkPath {
    pub root: String,
    pub child: String,
}

impl WatermarkPath {
    pub fn new(root: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            child: child.into(),
        }
    }

    pub fn for_report(root: impl Into<String>, report_type: ReportType) -> Self {
        Self::new(root, report_type.watermark_key())
    }
}

impl fmt::Display for WatermarkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root, self.child)
    }
}

/// Append-only list of run upper bounds. Never empty; the last entry is the next lower bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WatermarkHistory(Vec<String>);

impl WatermarkHistory {
    pub fn seeded() -> Self {
        Self(vec![DEFAULT_WATERMARK.to_string()])
    }

    /// Absent or empty stored values fall back to the seed.
    pub fn from_stored(stored: Option<Vec<String>>) -> Self {
        match stored {
            Some(entries) if !entries.is_empty() => Self(entries),
            _ => Self::seeded(),
        }
    }

    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or(DEFAULT_WATERMARK)
    }

    pub fn append(&mut self, upper_bound: impl Into<String>) {
        self.0.push(upper_bound.into());
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exclusive `(lower, upper)` bounds for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub lower: String,
    pub upper: String,
}

impl RunWindow {
    /// `upper` is midnight of the local calendar date `today`, labelled `Z`.
    pub fn compute(history: &WatermarkHistory, today: NaiveDate) -> Self {
        Self {
            lower: history.last().to_string(),
            upper: upper_bound_for(today),
        }
    }

    /// True when the window cannot contain any record, e.g. a second run on the same day.
    pub fn is_degenerate(&self) -> bool {
        self.lower >= self.upper
    }
}

pub fn upper_bound_for(date: NaiveDate) -> String {
    format!("{}T00:00:00.000Z", date.format("%Y-%m-%d"))
}

/// Record returned by the query service, addressed with dotted paths (`Opportunity__r.StageName`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, JsonValue>);

impl RawRecord {
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Scalar value at `path` rendered as text; null, missing and nested values yield `None`.
    pub fn text(&self, path: &str) -> Option<String> {
        match self.get_path(path)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Keep the first record for each distinct value of `key_path`, preserving input order.
/// Records without a key value are kept untouched.
pub fn dedup_by_key(records: Vec<RawRecord>, key_path: &str) -> Vec<RawRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match record.text(key_path) {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

/// Drop records whose URL at `url_path` has a host starting with any of `prefixes`.
pub fn exclude_by_host_prefix(
    records: Vec<RawRecord>,
    url_path: &str,
    prefixes: &[String],
) -> Vec<RawRecord> {
    if prefixes.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| {
            record
                .text(url_path)
                .map(|url| !host_matches_prefix(&url, prefixes))
                .unwrap_or(true)
        })
        .collect()
}

pub fn host_matches_prefix(raw_url: &str, prefixes: &[String]) -> bool {
    let raw_url = raw_url.trim();
    let host = Url::parse(raw_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .or_else(|| authority_host(raw_url));
    let Some(host) = host else {
        return false;
    };
    prefixes
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| host.starts_with(&p))
}

/// Host of a value with no usable scheme, e.g. `getstarted.example.com:8080/foo` or `//host/path`.
fn authority_host(raw_url: &str) -> Option<String> {
    let authority = raw_url
        .trim_start_matches("//")
        .split(['/', '?', '#'])
        .next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Project records onto the report's columns; absent fields become empty strings.
pub fn project(report_type: ReportType, records: &[RawRecord]) -> Vec<Vec<String>> {
    records
        .iter()
        .map(|record| {
            report_type
                .columns()
                .iter()
                .map(|col| record.text(col.source_path).unwrap_or_default())
                .collect()
        })
        .collect()
}

/// Dedup then exclusion, in that order.
pub fn post_process(
    report_type: ReportType,
    records: Vec<RawRecord>,
    exclude_host_prefixes: &[String],
) -> Vec<RawRecord> {
    let deduped = dedup_by_key(records, report_type.dedup_key());
    exclude_by_host_prefix(deduped, report_type.source_url_field(), exclude_host_prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: JsonValue) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    fn tracking(opportunity: &str, url: &str) -> RawRecord {
        rec(json!({
            "attributes": {"type": "Web_Tracking__c"},
            "GCLID__c": format!("gclid-{opportunity}-{url}"),
            "Opportunity__c": opportunity,
            "Source_URL__c": url,
            "Opportunity__r": {"StageName": "Applied", "Application_Date__c": "2023-01-05"}
        }))
    }

    fn ids(records: &[RawRecord]) -> Vec<(String, String)> {
        records
            .iter()
            .map(|r| {
                (
                    r.text("Opportunity__c").unwrap(),
                    r.text("Source_URL__c").unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let input = vec![
            tracking("A", "http://x"),
            tracking("A", "http://y"),
            tracking("B", "http://z"),
        ];
        let out = dedup_by_key(input, "Opportunity__c");
        assert_eq!(
            ids(&out),
            vec![
                ("A".to_string(), "http://x".to_string()),
                ("B".to_string(), "http://z".to_string()),
            ]
        );
    }

    #[test]
    fn dedup_is_idempotent() {
        let input = vec![
            tracking("C", "http://1"),
            tracking("A", "http://2"),
            tracking("C", "http://3"),
            tracking("B", "http://4"),
            tracking("A", "http://5"),
        ];
        let once = dedup_by_key(input, "Opportunity__c");
        let twice = dedup_by_key(once.clone(), "Opportunity__c");
        assert_eq!(once, twice);
        assert_eq!(ids(&once).len(), 3);
    }

    #[test]
    fn records_without_key_are_not_collapsed() {
        let input = vec![rec(json!({"x": 1})), rec(json!({"x": 2}))];
        assert_eq!(dedup_by_key(input, "Opportunity__c").len(), 2);
    }

    #[test]
    fn exclusion_filter_matches_host_prefix_case_insensitively() {
        let prefixes = vec!["getstarted.".to_string()];
        assert!(host_matches_prefix("http://getstarted.example.com/foo", &prefixes));
        assert!(host_matches_prefix("https://GetStarted.Example.com/foo", &prefixes));
        assert!(host_matches_prefix("getstarted.example.com/foo", &prefixes));
        assert!(host_matches_prefix("getstarted.example.com:8080/foo", &prefixes));
        assert!(host_matches_prefix("//getstarted.example.com/foo", &prefixes));
        assert!(host_matches_prefix("GETSTARTED.example.com", &prefixes));
        assert!(!host_matches_prefix("apply.example.com:8080/getstarted.", &prefixes));
        assert!(!host_matches_prefix("//apply.example.com/foo", &prefixes));
        assert!(!host_matches_prefix("https://apply.example.com/foo", &prefixes));
        assert!(!host_matches_prefix("https://apply.example.com/getstarted.", &prefixes));

        let out = exclude_by_host_prefix(
            vec![
                tracking("A", "http://getstarted.example.com/foo"),
                tracking("B", "https://apply.example.com/foo"),
            ],
            "Source_URL__c",
            &prefixes,
        );
        assert_eq!(ids(&out), vec![("B".to_string(), "https://apply.example.com/foo".to_string())]);
    }

    #[test]
    fn post_process_dedups_before_excluding() {
        // The first A is excluded, so A disappears entirely rather than falling back to its second row.
        let out = post_process(
            ReportType::GoogleSearchAdsConversions,
            vec![
                tracking("A", "http://getstarted.example.com/a"),
                tracking("A", "https://apply.example.com/a"),
                tracking("B", "https://apply.example.com/b"),
            ],
            &["getstarted.".to_string()],
        );
        assert_eq!(ids(&out), vec![("B".to_string(), "https://apply.example.com/b".to_string())]);
    }

    #[test]
    fn projection_defaults_missing_fields_to_empty() {
        let rows = project(
            ReportType::GoogleSearchAdsConversions,
            &[
                rec(json!({"GCLID__c": "g1", "Opportunity__r": {"StageName": "Won"}})),
                rec(json!({"GCLID__c": "g2", "Opportunity__r": null})),
            ],
        );
        assert_eq!(rows[0], vec!["g1", "Won", ""]);
        assert_eq!(rows[1], vec!["g2", "", ""]);
    }

    #[test]
    fn missing_history_seeds_default_watermark() {
        let history = WatermarkHistory::from_stored(None);
        assert_eq!(history.entries(), &[DEFAULT_WATERMARK.to_string()]);
        assert_eq!(WatermarkHistory::from_stored(Some(vec![])), history);
    }

    #[test]
    fn window_uses_last_watermark_and_local_midnight() {
        let history = WatermarkHistory::from_stored(Some(vec![
            DEFAULT_WATERMARK.to_string(),
            "2023-03-01T00:00:00.000Z".to_string(),
        ]));
        let today = NaiveDate::from_ymd_opt(2023, 3, 9).unwrap();
        let window = RunWindow::compute(&history, today);
        assert_eq!(window.lower, "2023-03-01T00:00:00.000Z");
        assert_eq!(window.upper, "2023-03-09T00:00:00.000Z");
        assert!(!window.is_degenerate());
    }

    #[test]
    fn second_run_on_same_day_gets_zero_width_window() {
        let today = NaiveDate::from_ymd_opt(2023, 3, 9).unwrap();
        let mut history = WatermarkHistory::seeded();
        let first = RunWindow::compute(&history, today);
        history.append(first.upper.clone());
        assert_eq!(history.len(), 2);

        let second = RunWindow::compute(&history, today);
        assert_eq!(second.upper, first.upper);
        assert_eq!(second.lower, second.upper);
        assert!(second.is_degenerate());
    }

    #[test]
    fn report_type_selector_round_trips_and_rejects_unknown() {
        assert_eq!(
            "googleSearchAdsConversions".parse::<ReportType>(),
            Ok(ReportType::GoogleSearchAdsConversions)
        );
        assert_eq!(
            "facebookLeads".parse::<ReportType>(),
            Err(UnknownReportType("facebookLeads".to_string()))
        );
    }

    #[test]
    fn soql_embeds_exclusive_bounds() {
        let window = RunWindow {
            lower: "2023-01-01T00:00:00.000Z".into(),
            upper: "2023-01-02T00:00:00.000Z".into(),
        };
        let soql = ReportType::GoogleSearchAdsConversions.soql(&window);
        assert!(soql.contains("CreatedDate > 2023-01-01T00:00:00.000Z"));
        assert!(soql.contains("CreatedDate < 2023-01-02T00:00:00.000Z"));
        assert!(soql.ends_with("ORDER BY Opportunity__r.Application_Date__c DESC"));
    }

    #[test]
    fn environment_selector_defaults_to_production() {
        assert_eq!(Environment::from_selector(Some("uat")), Environment::Uat);
        assert_eq!(Environment::from_selector(Some("UAT")), Environment::Uat);
        assert_eq!(Environment::from_selector(Some("prod")), Environment::Production);
        assert_eq!(Environment::from_selector(None), Environment::Production);
    }
}
