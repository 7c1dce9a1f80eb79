//! The index maintainer.
//!
//! Two of the three views live here: per-month summary files
//! `<project>-YYYY-MM.json` on the single `index` branch, and one
//! `<project>-<bunsen_commit_id>.json` full-testrun file per run on the
//! `<project>/testruns-YYYY-MM[-extra]` branches. Every update is a
//! read-modify-write: load the file at the branch tip, change it in
//! memory, rebuild the tree with all sibling files carried over, commit on
//! top of the old tip, and compare-and-set the ref. Changes are
//! commutative by id, so a lost CAS is retried from a fresh read and
//! converges.

use tracing::debug;

use crate::errors::BunsenError;
use crate::hash::ObjectHash;
use crate::model::Testrun;
use crate::model::canonical;
use crate::store::LogStore;
use crate::store::object::{Signature, SignatureRole, TreeEntry};

/// The single summary-index branch.
pub const INDEX_BRANCH: &str = "index";
/// Layout-version file at the root of the index tree.
pub const FORMAT_FILE: &str = "_bunsen_format";

/// How often a lost compare-and-set is retried before surfacing.
const CAS_RETRIES: usize = 3;

/// Name of a project's per-month index file.
pub fn index_file_name(project: &str, year_month: &str) -> String {
    format!("{project}-{year_month}.json")
}

/// Name of a full-testrun file.
pub fn testrun_file_name(project: &str, id: ObjectHash) -> String {
    format!("{project}-{id}.json")
}

/// Writer for the index and testruns views of one store.
pub struct IndexMaintainer<'a> {
    store: &'a LogStore,
}

impl<'a> IndexMaintainer<'a> {
    pub fn new(store: &'a LogStore) -> IndexMaintainer<'a> {
        IndexMaintainer { store }
    }

    /// Summaries in one index file at the current `index` tip; empty when
    /// the file (or the branch) does not exist yet.
    pub fn read_summaries(&self, file_name: &str) -> Result<Vec<Testrun>, BunsenError> {
        match self.store.resolve_ref(INDEX_BRANCH)? {
            Some(tip) => read_summaries_at(self.store, tip, file_name),
            None => Ok(Vec::new()),
        }
    }

    /// Append a summary, or replace the entry with the same
    /// `bunsen_commit_id` in place. The file keeps insertion order.
    pub fn upsert_summary(&self, summary: &Testrun) -> Result<(), BunsenError> {
        let id = required_id(summary)?;
        let year_month = summary.year_month.as_deref().ok_or_else(|| {
            BunsenError::ValidationFailed(format!("summary {id} has no year_month"))
        })?;
        let project = project_of(summary)?;
        let file_name = index_file_name(&project, year_month);
        let entry_bytes = canonical::to_bytes(&summary.summary().to_value()?)?;
        let message = format!("update {file_name} for {id}\n");
        let id_hex = id.to_string();

        self.commit_file(INDEX_BRANCH, &file_name, &message, |existing| {
            let mut entries: Vec<serde_json::Value> = match existing {
                Some(bytes) => serde_json::from_slice(bytes).map_err(|e| {
                    BunsenError::ValidationFailed(format!("index file {file_name}: {e}"))
                })?,
                None => Vec::new(),
            };
            let new_entry = canonical::parse(&entry_bytes)?;
            let slot = entries
                .iter()
                .position(|entry| entry_id(entry).as_deref() == Some(id_hex.as_str()));
            match slot {
                Some(i) => entries[i] = new_entry,
                None => entries.push(new_entry),
            }
            canonical_array_bytes(&entries)
        })
    }

    /// Write (or replace) the full-testrun file for `run` on `branch`.
    pub fn write_full_testrun(&self, branch: &str, run: &Testrun) -> Result<(), BunsenError> {
        let id = required_id(run)?;
        let project = project_of(run)?;
        let file_name = testrun_file_name(&project, id);
        let bytes = run.canonical_bytes()?;
        let message = format!("store {file_name}\n");
        self.commit_file(branch, &file_name, &message, move |_| Ok(bytes.clone()))
    }

    /// Read the full-testrun file for `id` from `branch`, when present.
    pub fn read_full_testrun(
        &self,
        branch: &str,
        project: &str,
        id: ObjectHash,
    ) -> Result<Option<Testrun>, BunsenError> {
        let Some(tip) = self.store.resolve_ref(branch)? else {
            return Ok(None);
        };
        let file_name = testrun_file_name(project, id);
        match self.store.read_path(tip, &file_name) {
            Ok(bytes) => Ok(Some(Testrun::from_value(canonical::parse(&bytes)?)?)),
            Err(BunsenError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write one file on a branch under CAS, carrying sibling
    /// entries over unchanged. `rewrite` maps the current file content (or
    /// `None`) to the new content; returning content equal to the current
    /// bytes skips the commit entirely.
    fn commit_file(
        &self,
        branch: &str,
        file_name: &str,
        message: &str,
        rewrite: impl Fn(Option<&[u8]>) -> Result<Vec<u8>, BunsenError>,
    ) -> Result<(), BunsenError> {
        let mut attempt = 0;
        loop {
            let tip = self.store.resolve_ref(branch)?;
            let mut entries = match tip {
                Some(tip) => self.store.read_tree(tip)?.entries,
                None => Vec::new(),
            };
            let existing = match entries.iter().find(|e| e.name == file_name) {
                Some(entry) => Some(self.store.read_blob(entry.id)?),
                None => None,
            };
            let new_bytes = rewrite(existing.as_deref())?;
            if existing.as_deref() == Some(new_bytes.as_slice()) {
                debug!(branch, file_name, "content unchanged, skipping commit");
                return Ok(());
            }

            let blob = self.store.put_blob(&new_bytes)?;
            entries.retain(|e| e.name != file_name);
            entries.push(TreeEntry::file(file_name, blob));
            let tree = self.store.put_tree(entries)?;
            let seconds = chrono::Utc::now().timestamp();
            let commit = self.store.make_commit(
                tree,
                tip.into_iter().collect(),
                Signature::engine(SignatureRole::Author, seconds),
                Signature::engine(SignatureRole::Committer, seconds),
                message,
            )?;
            match self.store.update_ref(branch, tip, commit) {
                Ok(()) => return Ok(()),
                Err(BunsenError::RefConflict { .. }) if attempt < CAS_RETRIES => {
                    attempt += 1;
                    debug!(branch, attempt, "ref moved, retrying from fresh tip");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Summaries in one index file under a specific `index` tip.
pub fn read_summaries_at(
    store: &LogStore,
    tip: ObjectHash,
    file_name: &str,
) -> Result<Vec<Testrun>, BunsenError> {
    let bytes = match store.read_path(tip, file_name) {
        Ok(bytes) => bytes,
        Err(BunsenError::NotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
        .map_err(|e| BunsenError::ValidationFailed(format!("index file {file_name}: {e}")))?;
    entries.into_iter().map(Testrun::from_value).collect()
}

fn canonical_array_bytes(entries: &[serde_json::Value]) -> Result<Vec<u8>, BunsenError> {
    canonical::to_bytes(&serde_json::Value::Array(entries.to_vec()))
}

fn entry_id(entry: &serde_json::Value) -> Option<String> {
    entry
        .get("bunsen_commit_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn required_id(run: &Testrun) -> Result<ObjectHash, BunsenError> {
    run.bunsen_commit_id
        .ok_or_else(|| BunsenError::ValidationFailed("testrun has no bunsen_commit_id".to_string()))
}

/// The project a stored record belongs to, recovered from its testlogs
/// branch name (`<project>/testlogs-...`).
fn project_of(run: &Testrun) -> Result<String, BunsenError> {
    let branch = run.bunsen_testlogs_branch.as_deref().ok_or_else(|| {
        BunsenError::ValidationFailed("testrun has no bunsen_testlogs_branch".to_string())
    })?;
    branch
        .split_once('/')
        .map(|(project, _)| project.to_string())
        .ok_or_else(|| {
            BunsenError::ValidationFailed(format!("malformed testlogs branch `{branch}`"))
        })
}
