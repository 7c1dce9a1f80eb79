//! The built-in DejaGNU commit module.
//!
//! Parses `.sum` summary files: one testcase per outcome line
//! (`PASS: gdb.base/break.exp: break main`), with pass/fail totals, a
//! timestamp from the `Test run by ... on <date>` banner, and the
//! configuration triple from `Native configuration is ...`. Each testcase
//! carries an `origin_sum` cursor back to its line. Bundles without usable
//! outcomes are not rejected; they are flagged via `problems` so broken
//! uploads still get archived.

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use crate::errors::BunsenError;
use crate::model::cursor::Cursor;
use crate::model::outcome::TestOutcome;
use crate::model::testrun::{Testcase, Testrun, format_timestamp};
use crate::scripts::{CommitModule, FileMap, ParsedBundle};

pub struct DejagnuModule;

impl CommitModule for DejagnuModule {
    fn name(&self) -> &'static str {
        "dejagnu"
    }

    fn parse(&self, files: FileMap) -> Result<ParsedBundle, BunsenError> {
        let mut testrun = Testrun::default();
        let mut testcases = Vec::new();
        let mut problems = Vec::new();
        let mut pass_count = 0u64;
        let mut fail_count = 0u64;

        let sum_files: Vec<&String> = files.keys().filter(|name| name.ends_with(".sum")).collect();
        if sum_files.is_empty() {
            problems.push("no .sum file in bundle".to_string());
        }

        for name in &sum_files {
            let text = String::from_utf8_lossy(&files[*name]);
            for (lineno, line) in text.lines().enumerate() {
                if let Some(testcase) = parse_outcome_line(name, lineno as u32 + 1, line) {
                    if testcase.outcome.is_passing() {
                        pass_count += 1;
                    } else if testcase.outcome.is_failing() {
                        fail_count += 1;
                    }
                    testcases.push(testcase);
                } else if let Some(rest) = line.strip_prefix("Native configuration is ") {
                    testrun.arch = Some(rest.trim().to_string());
                } else if let Some((_, date)) = line
                    .strip_prefix("Test run by ")
                    .and_then(|rest| rest.split_once(" on "))
                {
                    if let Some(at) = parse_banner_date(date.trim()) {
                        testrun.timestamp = Some(at);
                    }
                } else if let Some(rest) = line.strip_prefix("Running target ") {
                    testrun
                        .extra
                        .insert("target_board".to_string(), Value::from(rest.trim()));
                }
            }
        }

        if !sum_files.is_empty() && testcases.is_empty() {
            problems.push("no test outcomes found in .sum".to_string());
        }
        debug!(
            testcases = testcases.len(),
            pass_count, fail_count, "parsed DejaGNU bundle"
        );

        if testcases.is_empty() {
            // Keep the counts absent so the flagged record is visibly
            // incomplete rather than zero-passing.
            testrun.problems = Some(problems);
        } else {
            testrun.pass_count = Some(pass_count);
            testrun.fail_count = Some(fail_count);
            testrun.testcases = Some(testcases);
            if !problems.is_empty() {
                testrun.problems = Some(problems);
            }
        }
        Ok(ParsedBundle {
            testrun,
            files,
            extra_label: None,
        })
    }
}

/// Parse one `OUTCOME: name[: subtest]` line into a testcase.
fn parse_outcome_line(file: &str, lineno: u32, line: &str) -> Option<Testcase> {
    let (keyword, rest) = line.split_once(": ")?;
    let outcome: TestOutcome = keyword.parse().ok()?;
    let (name, subtest) = match rest.split_once(": ") {
        Some((name, subtest)) => (name, Some(subtest.to_string())),
        None => (rest, None),
    };
    let cursor = Cursor::local(file, lineno, lineno).ok()?;
    Some(Testcase {
        name: name.to_string(),
        outcome,
        subtest,
        origin_log: None,
        origin_sum: Some(cursor.to_string()),
    })
}

/// The `Test run by` banner carries a ctime-style date, e.g.
/// `Tue Aug 27 14:03:00 2019`.
fn parse_banner_date(text: &str) -> Option<String> {
    let naive = NaiveDateTime::parse_from_str(text, "%a %b %e %H:%M:%S %Y").ok()?;
    Some(format_timestamp(Utc.from_utc_datetime(&naive)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const SUM: &str = "\
Test run by buildbot on Tue Aug 27 14:03:00 2019
Native configuration is x86_64-pc-linux-gnu

\t\t=== gdb tests ===

Running target unix
PASS: gdb.base/break.exp: break main
FAIL: gdb.base/break.exp: run to breakpoint
XFAIL: gdb.base/cond.exp: condition (timeout)
UNTESTED: gdb.base/skip.exp
# of expected passes\t\t1
";

    fn bundle(name: &str, content: &str) -> FileMap {
        let mut files = BTreeMap::new();
        files.insert(name.to_string(), content.as_bytes().to_vec());
        files
    }

    /// Outcome lines become testcases with cursors; counts bucket by
    /// outcome kind.
    #[test]
    fn test_parse_sum() {
        let parsed = DejagnuModule.parse(bundle("gdb.sum", SUM)).unwrap();
        let run = parsed.testrun;
        assert_eq!(run.pass_count, Some(2)); // PASS + XFAIL
        assert_eq!(run.fail_count, Some(1)); // FAIL
        assert_eq!(run.arch.as_deref(), Some("x86_64-pc-linux-gnu"));
        assert_eq!(run.timestamp.as_deref(), Some("2019-08-27T14:03:00Z"));
        assert_eq!(run.extra["target_board"], Value::from("unix"));

        let cases = run.testcases.unwrap();
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].name, "gdb.base/break.exp");
        assert_eq!(cases[0].subtest.as_deref(), Some("break main"));
        assert_eq!(cases[0].outcome, TestOutcome::Pass);
        assert_eq!(cases[0].origin_sum.as_deref(), Some("gdb.sum:7"));
        assert_eq!(cases[3].subtest, None);
        assert!(run.problems.is_none());
    }

    /// A bundle with no .sum is archived flagged, not rejected.
    #[test]
    fn test_no_sum_is_flagged() {
        let parsed = DejagnuModule
            .parse(bundle("gdb.log", "raw log text\n"))
            .unwrap();
        let run = parsed.testrun;
        assert!(run.has_problems());
        assert_eq!(run.pass_count, None);
        assert!(run.testcases.is_none());
    }

    /// A .sum without outcome lines is likewise flagged.
    #[test]
    fn test_empty_sum_is_flagged() {
        let parsed = DejagnuModule
            .parse(bundle("gdb.sum", "Test run by nobody on Mon Jan  6 00:00:00 2020\n"))
            .unwrap();
        assert!(parsed.testrun.has_problems());
        assert_eq!(parsed.testrun.timestamp.as_deref(), Some("2020-01-06T00:00:00Z"));
    }

    /// Lines whose keyword is not an outcome are ignored.
    #[test]
    fn test_non_outcome_lines_ignored() {
        assert!(parse_outcome_line("f.sum", 1, "WARNING: program timed out").is_none());
        assert!(parse_outcome_line("f.sum", 1, "# of expected passes 3").is_none());
        assert!(parse_outcome_line("f.sum", 1, "PASS:").is_none());
    }
}
