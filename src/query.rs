//! The query surface.
//!
//! Read-only operations over an opened repository: project and month
//! enumeration, summary streams, abbreviated-id resolution, log streaming,
//! and cursor resolution. Readers never take the write lock; calls that
//! read the index more than once re-read when the `index` tip moves
//! between reads.

use std::collections::{BTreeSet, VecDeque};
use std::str::FromStr;

use tracing::debug;

use crate::errors::BunsenError;
use crate::hash::{MIN_ABBREV, ObjectHash};
use crate::index::{FORMAT_FILE, INDEX_BRANCH, IndexMaintainer, index_file_name, read_summaries_at};
use crate::model::cursor::{Cursor, ResolvedCursor};
use crate::model::testrun::Testrun;
use crate::repo::{Repository, parse_testlogs_branch};

/// How often a read is retried when the index tip moves mid-call.
const REREAD_RETRIES: usize = 5;

/// Read-only view over one repository.
pub struct Query<'a> {
    repo: &'a Repository,
}

impl<'a> Query<'a> {
    pub fn new(repo: &'a Repository) -> Query<'a> {
        Query { repo }
    }

    /// All project names, from testlogs branch prefixes and index file
    /// names; the union wins.
    pub fn list_projects(&self) -> Result<BTreeSet<String>, BunsenError> {
        let mut projects = BTreeSet::new();
        for branch in self.repo.store.list_branches("")? {
            if let Some((project, _)) = parse_testlogs_branch(&branch) {
                projects.insert(project.to_string());
            }
        }
        for file_name in self.index_file_names()? {
            if let Some((project, _)) = parse_index_file_name(&file_name) {
                projects.insert(project);
            }
        }
        Ok(projects)
    }

    /// Months with data for a project, newest first.
    pub fn list_months(&self, project: &str) -> Result<Vec<String>, BunsenError> {
        let mut months = BTreeSet::new();
        for branch in self.repo.store.list_branches(&format!("{project}/"))? {
            if let Some((p, year_month)) = parse_testlogs_branch(&branch) {
                if p == project {
                    months.insert(year_month.to_string());
                }
            }
        }
        for file_name in self.index_file_names()? {
            if let Some((p, year_month)) = parse_index_file_name(&file_name) {
                if p == project {
                    months.insert(year_month);
                }
            }
        }
        Ok(months.into_iter().rev().collect())
    }

    /// Stream a project's summaries: months newest first, insertion order
    /// within a month. Obsolete runs are skipped unless requested.
    pub fn list_testruns(
        &self,
        project: &str,
        month: Option<&str>,
        include_obsolete: bool,
    ) -> Result<TestrunStream<'a>, BunsenError> {
        let months: VecDeque<String> = match month {
            Some(month) => VecDeque::from([month.to_string()]),
            None => self.list_months(project)?.into(),
        };
        Ok(TestrunStream {
            query: Query::new(self.repo),
            project: project.to_string(),
            months,
            current: Vec::new().into_iter(),
            include_obsolete,
        })
    }

    /// Resolve an id or unique prefix (≥ 4 hex chars) to a stored id.
    pub fn resolve_id(&self, prefix: &str) -> Result<ObjectHash, BunsenError> {
        if prefix.len() < MIN_ABBREV || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BunsenError::ValidationFailed(format!(
                "id prefix `{prefix}` must be at least {MIN_ABBREV} hex characters"
            )));
        }
        if prefix.len() == crate::hash::HASH_HEX_LEN {
            return ObjectHash::from_str(prefix);
        }
        let mut candidates = BTreeSet::new();
        for entry in self.all_summaries()? {
            if let Some(id) = entry.bunsen_commit_id {
                if id.matches_prefix(prefix) {
                    candidates.insert(id);
                }
            }
        }
        if candidates.is_empty() {
            // The index may lag a crashed ingest; fall back to the chains.
            for branch in self.repo.store.list_branches("")? {
                if parse_testlogs_branch(&branch).is_none() {
                    continue;
                }
                for commit in self.repo.store.walk(&branch)? {
                    let commit = commit?;
                    if commit.id.matches_prefix(prefix) {
                        candidates.insert(commit.id);
                    }
                }
            }
        }
        if candidates.len() > 1 {
            return Err(BunsenError::AmbiguousId(
                prefix.to_string(),
                candidates.iter().map(|id| id.to_string()).collect(),
            ));
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| BunsenError::NotFound(format!("no testrun matches `{prefix}`")))
    }

    /// The stored summary for an exact id.
    pub fn summary(&self, id: ObjectHash) -> Result<Testrun, BunsenError> {
        self.with_stable_index(|query| {
            query
                .all_summaries()?
                .into_iter()
                .find(|entry| entry.bunsen_commit_id == Some(id))
                .ok_or_else(|| BunsenError::NotFound(format!("summary for {id}")))
        })
    }

    /// The full testrun for an exact id, read from its testruns branch.
    pub fn get_testrun_by_id(&self, id: ObjectHash) -> Result<Testrun, BunsenError> {
        self.with_stable_index(|query| {
            let summary = query
                .all_summaries()?
                .into_iter()
                .find(|entry| entry.bunsen_commit_id == Some(id))
                .ok_or_else(|| BunsenError::NotFound(format!("testrun {id}")))?;
            let branch = summary.bunsen_testruns_branch.as_deref().ok_or_else(|| {
                BunsenError::ValidationFailed(format!("summary {id} names no testruns branch"))
            })?;
            let project = summary
                .bunsen_testlogs_branch
                .as_deref()
                .and_then(parse_testlogs_branch_project)
                .ok_or_else(|| {
                    BunsenError::ValidationFailed(format!("summary {id} names no testlogs branch"))
                })?;
            IndexMaintainer::new(&query.repo.store)
                .read_full_testrun(branch, &project, id)?
                .ok_or_else(|| BunsenError::NotFound(format!("full testrun file for {id}")))
        })
    }

    /// The full testrun for an id or unique prefix.
    pub fn get_testrun(&self, prefix: &str) -> Result<Testrun, BunsenError> {
        let id = self.resolve_id(prefix)?;
        self.get_testrun_by_id(id)
    }

    /// The verbatim bytes of one log file of a testrun.
    pub fn open_log(&self, prefix: &str, path: &str) -> Result<Vec<u8>, BunsenError> {
        let id = self.resolve_id(prefix)?;
        self.repo.store.read_path(id, path)
    }

    /// Names of the log files stored for a testrun.
    pub fn list_logs(&self, prefix: &str) -> Result<Vec<String>, BunsenError> {
        let id = self.resolve_id(prefix)?;
        let tree = self.repo.store.read_tree(id)?;
        Ok(tree.entries.into_iter().map(|e| e.name).collect())
    }

    /// Resolve a cursor. Fully qualified cursors carry their own commit;
    /// abbreviated cursors need none only if `context` supplies one.
    pub fn resolve_cursor(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<ResolvedCursor, BunsenError> {
        let cursor = Cursor::from_str(text)?;
        let fallback = match context {
            Some(prefix) => Some(self.resolve_id(prefix)?),
            None => None,
        };
        cursor.resolve(&self.repo.store, fallback)
    }

    /// Run `read` against a stable index tip, re-reading when the tip
    /// moves mid-call under a lock-free writer.
    fn with_stable_index<T>(
        &self,
        read: impl Fn(&Query<'a>) -> Result<T, BunsenError>,
    ) -> Result<T, BunsenError> {
        let mut last = None;
        for _ in 0..REREAD_RETRIES {
            let before = self.repo.store.resolve_ref(INDEX_BRANCH)?;
            let result = read(self);
            let after = self.repo.store.resolve_ref(INDEX_BRANCH)?;
            if before == after {
                return result;
            }
            debug!("index tip moved during read, retrying");
            last = Some(result);
        }
        last.unwrap_or_else(|| {
            Err(BunsenError::NotFound("index tip kept moving".to_string()))
        })
    }

    fn index_file_names(&self) -> Result<Vec<String>, BunsenError> {
        let Some(tip) = self.repo.store.resolve_ref(INDEX_BRANCH)? else {
            return Ok(Vec::new());
        };
        let tree = self.repo.store.read_tree(tip)?;
        Ok(tree
            .entries
            .into_iter()
            .map(|e| e.name)
            .filter(|name| name != FORMAT_FILE)
            .collect())
    }

    fn all_summaries(&self) -> Result<Vec<Testrun>, BunsenError> {
        let Some(tip) = self.repo.store.resolve_ref(INDEX_BRANCH)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for file_name in self.index_file_names()? {
            entries.extend(read_summaries_at(&self.repo.store, tip, &file_name)?);
        }
        Ok(entries)
    }
}

/// Lazy month-by-month summary stream.
pub struct TestrunStream<'a> {
    query: Query<'a>,
    project: String,
    months: VecDeque<String>,
    current: std::vec::IntoIter<Testrun>,
    include_obsolete: bool,
}

impl Iterator for TestrunStream<'_> {
    type Item = Result<Testrun, BunsenError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(run) = self.current.next() {
                if self.include_obsolete || !run.is_obsolete() {
                    return Some(Ok(run));
                }
                continue;
            }
            let month = self.months.pop_front()?;
            let file_name = index_file_name(&self.project, &month);
            let index = IndexMaintainer::new(&self.query.repo.store);
            match index.read_summaries(&file_name) {
                Ok(entries) => self.current = entries.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// `<project>-YYYY-MM.json` → (project, YYYY-MM). Projects may contain
/// `-`, so the month is taken from the fixed-width tail.
fn parse_index_file_name(name: &str) -> Option<(String, String)> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() < 9 {
        return None;
    }
    let (head, year_month) = stem.split_at(stem.len() - 7);
    let project = head.strip_suffix('-')?;
    let shaped = year_month.len() == 7
        && year_month.as_bytes()[4] == b'-'
        && year_month
            .chars()
            .enumerate()
            .all(|(i, c)| i == 4 || c.is_ascii_digit());
    if project.is_empty() || !shaped {
        return None;
    }
    Some((project.to_string(), year_month.to_string()))
}

fn parse_testlogs_branch_project(branch: &str) -> Option<String> {
    parse_testlogs_branch(branch).map(|(project, _)| project.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Index file names split into project and month, honoring `-` in
    /// project names.
    #[test]
    fn test_parse_index_file_name() {
        assert_eq!(
            parse_index_file_name("gdb-2019-08.json"),
            Some(("gdb".to_string(), "2019-08".to_string()))
        );
        assert_eq!(
            parse_index_file_name("systemtap-incomplete-2020-01.json"),
            Some(("systemtap-incomplete".to_string(), "2020-01".to_string()))
        );
        assert_eq!(parse_index_file_name("_bunsen_format"), None);
        assert_eq!(parse_index_file_name("x.json"), None);
        assert_eq!(parse_index_file_name("-2019-08.json"), None);
        assert_eq!(parse_index_file_name("gdb-19-08.json"), None);
    }
}
