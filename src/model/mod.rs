//! Testrun records, canonical serialization, and cursors.

pub mod canonical;
pub mod cursor;
pub mod outcome;
pub mod testrun;

pub use cursor::{Cursor, ResolvedCursor};
pub use outcome::TestOutcome;
pub use testrun::{Testcase, Testrun};

/// Whether `name` is usable as a project name: `[A-Za-z0-9_.+-]+`.
pub fn valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Project names follow the allowed character set.
    #[test]
    fn test_project_names() {
        assert!(valid_project_name("gdb"));
        assert!(valid_project_name("systemtap-incomplete"));
        assert!(valid_project_name("glibc_2.31+patches"));
        assert!(!valid_project_name(""));
        assert!(!valid_project_name("a/b"));
        assert!(!valid_project_name("white space"));
    }
}
