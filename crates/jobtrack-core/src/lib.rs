//! Core domain model for the jobs tracker.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "jobtrack-core";

/// Source tag stamped on every normalized record.
pub const SOURCE_TAG: &str = "jobs.af";

/// Keys owned by [`JobRecord`]; anything else on a raw record is carried through as-is.
pub const JOB_RECORD_FIELDS: &[&str] = &[
    "url",
    "title",
    "company",
    "location",
    "closing_date",
    "closing_date_raw",
    "apply_url",
    "apply_method",
    "emails",
    "phones",
    "source",
    "description",
    "details",
    "is_new",
];

/// One listing exactly as the external scraper produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawJob(pub Map<String, Value>);

impl RawJob {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Textual view of a field. Scalars are stringified, everything else reads as empty.
    pub fn text(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Trimmed text, `None` when blank.
    pub fn trimmed(&self, key: &str) -> Option<String> {
        let value = self.text(key);
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    pub fn url(&self) -> Option<String> {
        self.trimmed("url")
    }

    /// Fields the normalized record does not model explicitly.
    pub fn extra_fields(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| !JOB_RECORD_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMethod {
    ApplyUrl,
    Email,
    #[default]
    Unknown,
}

impl ApplyMethod {
    /// Apply link wins over email; neither yields `Unknown`.
    pub fn derive(apply_url: Option<&str>, emails: &[String]) -> Self {
        if apply_url.is_some_and(|u| !u.trim().is_empty()) {
            ApplyMethod::ApplyUrl
        } else if !emails.is_empty() {
            ApplyMethod::Email
        } else {
            ApplyMethod::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyMethod::ApplyUrl => "apply_url",
            ApplyMethod::Email => "email",
            ApplyMethod::Unknown => "unknown",
        }
    }
}

/// Closing date relative to the run's reference date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingWindow {
    Expired,
    Today,
    Soon,
    Later,
    Unknown,
}

impl ClosingWindow {
    pub fn classify(closing_date: Option<NaiveDate>, today: NaiveDate) -> Self {
        let Some(closing) = closing_date else {
            return ClosingWindow::Unknown;
        };
        match (closing - today).num_days() {
            d if d < 0 => ClosingWindow::Expired,
            0 => ClosingWindow::Today,
            1..=2 => ClosingWindow::Soon,
            _ => ClosingWindow::Later,
        }
    }
}

/// Normalized listing keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub closing_date: Option<NaiveDate>,
    #[serde(default)]
    pub closing_date_raw: Option<String>,
    #[serde(default)]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub apply_method: ApplyMethod,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub is_new: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    pub fn closing_window(&self, today: NaiveDate) -> ClosingWindow {
        ClosingWindow::classify(self.closing_date, today)
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "Untitled"
        } else {
            &self.title
        }
    }
}

/// State carried from one successful run to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub seen_urls: Vec<String>,
    /// ISO-8601 local timestamp, seconds precision. Empty before the first run.
    #[serde(default)]
    pub last_run: String,
    #[serde(default)]
    pub last_new_urls: Vec<String>,
}

impl RunState {
    pub fn seen_set(&self) -> HashSet<String> {
        self.seen_urls.iter().cloned().collect()
    }

    /// State to persist after a run that emitted `jobs`.
    pub fn after_run(jobs: &[JobRecord], last_run: impl Into<String>) -> Self {
        Self {
            seen_urls: jobs.iter().map(|j| j.url.clone()).collect(),
            last_run: last_run.into(),
            last_new_urls: jobs.iter().filter(|j| j.is_new).map(|j| j.url.clone()).collect(),
        }
    }
}

/// Active-run marker: owning pid and acquisition epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: i64,
}

impl LockRecord {
    /// Parses `"<pid> <epoch>"`. A missing timestamp is tolerated; a missing pid is not.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let pid = tokens.next()?.parse().ok()?;
        let acquired_at = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        Some(Self { pid, acquired_at })
    }

    pub fn render(&self) -> String {
        format!("{} {}\n", self.pid, self.acquired_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn closing_window_boundaries() {
        let today = day(2024, 6, 1);
        assert_eq!(ClosingWindow::classify(Some(day(2024, 5, 31)), today), ClosingWindow::Expired);
        assert_eq!(ClosingWindow::classify(Some(today), today), ClosingWindow::Today);
        assert_eq!(ClosingWindow::classify(Some(day(2024, 6, 2)), today), ClosingWindow::Soon);
        assert_eq!(ClosingWindow::classify(Some(day(2024, 6, 3)), today), ClosingWindow::Soon);
        assert_eq!(ClosingWindow::classify(Some(day(2024, 6, 4)), today), ClosingWindow::Later);
        assert_eq!(ClosingWindow::classify(None, today), ClosingWindow::Unknown);
    }

    #[test]
    fn apply_method_priority() {
        let emails = vec!["a@b.io".to_string()];
        assert_eq!(ApplyMethod::derive(Some("https://x"), &emails), ApplyMethod::ApplyUrl);
        assert_eq!(ApplyMethod::derive(Some("  "), &emails), ApplyMethod::Email);
        assert_eq!(ApplyMethod::derive(None, &[]), ApplyMethod::Unknown);
    }

    #[test]
    fn raw_job_text_tolerates_non_string_values() {
        let raw: RawJob = serde_json::from_value(json!({
            "url": " https://jobs.af/1 ",
            "title": 42,
            "company": null,
            "tags": ["x"],
        }))
        .unwrap();
        assert_eq!(raw.url().as_deref(), Some("https://jobs.af/1"));
        assert_eq!(raw.text("title"), "42");
        assert_eq!(raw.text("company"), "");
        assert!(raw.trimmed("company").is_none());
        assert_eq!(raw.extra_fields().len(), 1);
    }

    #[test]
    fn job_record_keeps_extra_fields_flat() {
        let mut extra = Map::new();
        extra.insert("category".into(), json!("IT"));
        let job = JobRecord {
            url: "u".into(),
            title: String::new(),
            company: String::new(),
            location: String::new(),
            closing_date: Some(day(2024, 6, 3)),
            closing_date_raw: None,
            apply_url: None,
            apply_method: ApplyMethod::Unknown,
            emails: vec![],
            phones: vec![],
            source: SOURCE_TAG.into(),
            description: String::new(),
            details: String::new(),
            is_new: true,
            extra,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["category"], "IT");
        assert_eq!(value["closing_date"], "2024-06-03");
        assert_eq!(value["apply_method"], "unknown");
        assert_eq!(job.display_title(), "Untitled");
    }

    #[test]
    fn lock_record_parses_tokens() {
        assert_eq!(
            LockRecord::parse("1234 1700000000\n"),
            Some(LockRecord { pid: 1234, acquired_at: 1_700_000_000 })
        );
        assert_eq!(LockRecord::parse("77").map(|r| r.pid), Some(77));
        assert!(LockRecord::parse("").is_none());
        assert!(LockRecord::parse("abc 1").is_none());
    }

    #[test]
    fn run_state_defaults_missing_keys() {
        let state: RunState = serde_json::from_str(r#"{"seen_urls":["a"]}"#).unwrap();
        assert_eq!(state.last_run, "");
        assert!(state.last_new_urls.is_empty());
        assert!(state.seen_set().contains("a"));
    }

    #[test]
    fn run_state_after_run_tracks_new_urls() {
        let mk = |url: &str, is_new: bool| {
            serde_json::from_value::<JobRecord>(json!({ "url": url, "is_new": is_new })).unwrap()
        };
        let state = RunState::after_run(&[mk("a", false), mk("b", true)], "2024-06-01T08:00:00");
        assert_eq!(state.seen_urls, vec!["a", "b"]);
        assert_eq!(state.last_new_urls, vec!["b"]);
        assert_eq!(state.last_run, "2024-06-01T08:00:00");
    }
}
