//! Testrun and testcase records.
//!
//! A testrun is the immutable description of one test-suite execution. The
//! reserved fields below are typed; every other key is a *configuration
//! field* carried in the flattened `extra` map and restricted to scalar
//! values, since the full set of configuration fields is the equivalence
//! key analyses use to match runs across commits.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::BunsenError;
use crate::hash::ObjectHash;
use crate::model::canonical;
use crate::model::outcome::TestOutcome;

/// One element of a full testrun's `testcases` array.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub name: String,
    pub outcome: TestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtest: Option<String>,
    /// Cursor into the raw `.log`, when the parser found one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_log: Option<String>,
    /// Cursor into the `.sum` line(s) that produced this testcase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_sum: Option<String>,
}

impl Testcase {
    pub fn new(name: impl Into<String>, outcome: TestOutcome) -> Testcase {
        Testcase {
            name: name.into(),
            outcome,
            subtest: None,
            origin_log: None,
            origin_sum: None,
        }
    }
}

/// One test-suite execution. `summary()` strips `testcases`; everything
/// else is common to the summary and full forms.
#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Testrun {
    /// Engine version that produced the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunsen_version: Option<String>,
    /// Content-addressed id of the log bundle; filled by ingest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunsen_commit_id: Option<ObjectHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunsen_testlogs_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunsen_testruns_branch: Option<String>,
    /// ISO-8601; normalized to UTC seconds precision by ingest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// `YYYY-MM` of `timestamp`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_commit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_testruns_branches: Option<Vec<String>>,
    /// Diagnostics from the parser; a non-empty list marks the run as
    /// flagged and permits ingest of otherwise-incomplete records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problems: Option<Vec<String>>,
    /// Logical deletion mark; obsolete runs are excluded from queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obsolete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcases: Option<Vec<Testcase>>,
    /// Configuration fields: any other key, scalar-valued.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Testrun {
    /// The summary form: this record without `testcases`.
    pub fn summary(&self) -> Testrun {
        let mut summary = self.clone();
        summary.testcases = None;
        summary
    }

    /// Whether the parser delivered the required summary payload. Records
    /// failing this are ingestible only with non-empty `problems`.
    pub fn has_required_counts(&self) -> bool {
        self.pass_count.is_some() && self.fail_count.is_some()
    }

    /// Whether the run is flagged by its parser.
    pub fn has_problems(&self) -> bool {
        self.problems.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete == Some(true)
    }

    /// Shape validation: configuration fields must be scalar.
    pub fn validate(&self) -> Result<(), BunsenError> {
        for (key, value) in &self.extra {
            match value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
                _ => {
                    return Err(BunsenError::ValidationFailed(format!(
                        "configuration field `{key}` must be a string, number, or bool"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The record as a JSON value.
    pub fn to_value(&self) -> Result<Value, BunsenError> {
        serde_json::to_value(self)
            .map_err(|e| BunsenError::ValidationFailed(format!("testrun encoding: {e}")))
    }

    /// Parse a record from a JSON value.
    pub fn from_value(value: Value) -> Result<Testrun, BunsenError> {
        serde_json::from_value(value)
            .map_err(|e| BunsenError::ValidationFailed(format!("testrun decoding: {e}")))
    }

    /// Canonical bytes of the full record, id included.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, BunsenError> {
        canonical::to_bytes(&self.to_value()?)
    }

    /// Canonical bytes of the summary with `bunsen_commit_id` stripped.
    ///
    /// The id is the address of the record (the testlogs commit id itself),
    /// so the form that is hashed into that commit cannot contain it;
    /// cross-view equality is checked on this id-stripped form.
    pub fn canonical_summary_bytes(&self) -> Result<Vec<u8>, BunsenError> {
        let mut value = self.summary().to_value()?;
        if let Value::Object(map) = &mut value {
            map.remove("bunsen_commit_id");
        }
        canonical::to_bytes(&value)
    }

    /// The testlogs commit message: canonical id-stripped summary plus a
    /// trailing newline.
    pub fn commit_message(&self) -> Result<String, BunsenError> {
        let mut message = String::from_utf8(self.canonical_summary_bytes()?)
            .map_err(|e| BunsenError::ValidationFailed(format!("summary not UTF-8: {e}")))?;
        message.push('\n');
        Ok(message)
    }

    /// Recover the summary stored in a testlogs commit message, injecting
    /// the commit id it was stored under.
    pub fn from_commit_message(message: &str, id: ObjectHash) -> Result<Testrun, BunsenError> {
        let value = canonical::parse(message.trim_end().as_bytes())?;
        let mut run = Testrun::from_value(value)?;
        run.bunsen_commit_id = Some(id);
        Ok(run)
    }

    /// The run's timestamp as a UTC datetime, when present and parseable.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }
}

/// Parse the accepted timestamp spellings: RFC 3339, a naive
/// `YYYY-MM-DDTHH:MM:SS` (space separator also accepted, taken as UTC), or
/// a bare date (midnight UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Normalized timestamp text: RFC 3339 UTC, seconds precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `YYYY-MM` of a timestamp.
pub fn year_month_of(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}
