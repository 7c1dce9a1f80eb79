//! Testcase outcome codes.
//!
//! The ten DejaGNU outcome keywords, carried verbatim on the wire
//! (uppercase) and as the `outcome` field of stored testcases.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::BunsenError;

/// Outcome of a single testcase.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestOutcome {
    Pass,
    Fail,
    Xfail,
    Xpass,
    Kfail,
    Kpass,
    Untested,
    Unresolved,
    Unsupported,
    Error,
}

impl TestOutcome {
    /// The wire keyword, e.g. `XFAIL`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Pass => "PASS",
            TestOutcome::Fail => "FAIL",
            TestOutcome::Xfail => "XFAIL",
            TestOutcome::Xpass => "XPASS",
            TestOutcome::Kfail => "KFAIL",
            TestOutcome::Kpass => "KPASS",
            TestOutcome::Untested => "UNTESTED",
            TestOutcome::Unresolved => "UNRESOLVED",
            TestOutcome::Unsupported => "UNSUPPORTED",
            TestOutcome::Error => "ERROR",
        }
    }

    /// Whether the outcome counts toward `pass_count`. Expected failures
    /// count as passing for summary purposes.
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            TestOutcome::Pass | TestOutcome::Xfail | TestOutcome::Kfail
        )
    }

    /// Whether the outcome counts toward `fail_count`.
    pub fn is_failing(&self) -> bool {
        matches!(
            self,
            TestOutcome::Fail | TestOutcome::Xpass | TestOutcome::Kpass | TestOutcome::Error
        )
    }
}

impl Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestOutcome {
    type Err = BunsenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(TestOutcome::Pass),
            "FAIL" => Ok(TestOutcome::Fail),
            "XFAIL" => Ok(TestOutcome::Xfail),
            "XPASS" => Ok(TestOutcome::Xpass),
            "KFAIL" => Ok(TestOutcome::Kfail),
            "KPASS" => Ok(TestOutcome::Kpass),
            "UNTESTED" => Ok(TestOutcome::Untested),
            "UNRESOLVED" => Ok(TestOutcome::Unresolved),
            "UNSUPPORTED" => Ok(TestOutcome::Unsupported),
            "ERROR" => Ok(TestOutcome::Error),
            _ => Err(BunsenError::ValidationFailed(format!(
                "unknown outcome `{s}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every keyword round-trips through FromStr and Display.
    #[test]
    fn test_round_trip() {
        for s in [
            "PASS",
            "FAIL",
            "XFAIL",
            "XPASS",
            "KFAIL",
            "KPASS",
            "UNTESTED",
            "UNRESOLVED",
            "UNSUPPORTED",
            "ERROR",
        ] {
            let outcome: TestOutcome = s.parse().unwrap();
            assert_eq!(outcome.to_string(), s);
        }
        assert!("pass".parse::<TestOutcome>().is_err());
        assert!("WARN".parse::<TestOutcome>().is_err());
    }

    /// Serde uses the uppercase keywords.
    #[test]
    fn test_serde_keywords() {
        let json = serde_json::to_string(&TestOutcome::Xfail).unwrap();
        assert_eq!(json, "\"XFAIL\"");
        let back: TestOutcome = serde_json::from_str("\"UNSUPPORTED\"").unwrap();
        assert_eq!(back, TestOutcome::Unsupported);
    }

    /// Pass/fail bucketing follows DejaGNU conventions.
    #[test]
    fn test_buckets() {
        assert!(TestOutcome::Pass.is_passing());
        assert!(TestOutcome::Xfail.is_passing());
        assert!(TestOutcome::Xpass.is_failing());
        assert!(!TestOutcome::Untested.is_passing());
        assert!(!TestOutcome::Untested.is_failing());
    }
}
