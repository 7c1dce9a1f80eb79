//! The ingest engine.
//!
//! One call takes `{project, file map, parsed testrun}` and drives the
//! three-view update: the verbatim log tree committed onto
//! `<project>/testlogs-YYYY-MM`, the full-testrun file on
//! `<project>/testruns-YYYY-MM[-extra]`, and the summary entry in the
//! month's index file. The testlogs commit id is the `bunsen_commit_id`.
//!
//! Dedup is by tree id: the testlogs chain is walked for a commit whose
//! tree matches the submitted bundle, so a byte-identical bundle resolves
//! to its existing id no matter how far the branch has advanced since.
//! Ref order is fixed (testlogs, then testruns, then index); a failure
//! after the first ref advanced surfaces as `IncompleteIngest`, which
//! `repair` or a re-ingest of the same bundle heals.

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::BunsenError;
use crate::hash::ObjectHash;
use crate::index::{IndexMaintainer, index_file_name};
use crate::model::testrun::{Testrun, format_timestamp, parse_timestamp, year_month_of};
use crate::model::valid_project_name;
use crate::repo::{Repository, testlogs_branch_name, testruns_branch_name};
use crate::scripts::FileMap;
use crate::store::loose::LooseStore;
use crate::store::object::{Blob, Commit, Signature, SignatureRole, Tree, TreeEntry};

/// How often a lost testlogs compare-and-set is retried with fresh reads.
const CAS_RETRIES: usize = 3;
/// Budget for the source-repo timestamp fallback.
const SOURCE_REPO_BUDGET: Duration = Duration::from_secs(5);

/// One ingest submission.
pub struct IngestRequest {
    pub project: String,
    pub files: FileMap,
    pub testrun: Testrun,
    /// Testruns-branch suffix; the parser's choice or the submitter's.
    pub extra_label: Option<String>,
}

/// Which of the four ingest cases ran.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum IngestCase {
    /// New logs: all three views written.
    Created,
    /// Logs already stored; the run views were missing and were completed.
    Completed,
    /// Logs already stored; run record replaced in place.
    Updated,
    /// Byte-identical resubmission; nothing changed.
    Unchanged,
}

/// Result of a successful ingest.
#[derive(Debug)]
pub struct IngestOutcome {
    pub id: ObjectHash,
    pub case: IngestCase,
}

/// Run one ingest under the repository write lock (held by the caller).
pub fn ingest_bundle(
    repo: &Repository,
    mut request: IngestRequest,
) -> Result<IngestOutcome, BunsenError> {
    if !valid_project_name(&request.project) {
        return Err(BunsenError::ValidationFailed(format!(
            "invalid project name `{}`",
            request.project
        )));
    }
    request.testrun.validate()?;
    if !request.testrun.has_required_counts() && !request.testrun.has_problems() {
        return Err(BunsenError::ParseRejected(
            "testrun lacks pass_count/fail_count and carries no problems".to_string(),
        ));
    }

    filter_manifest(repo, &mut request)?;
    normalize(repo, &mut request)?;

    let year_month = request
        .testrun
        .year_month
        .clone()
        .ok_or_else(|| BunsenError::ValidationFailed("no year_month after normalize".into()))?;
    let testlogs_branch = testlogs_branch_name(&request.project, &year_month);
    let extra_label = request
        .extra_label
        .clone()
        .or_else(|| label_from_config(repo, &request.testrun));
    let testruns_branch =
        testruns_branch_name(&request.project, &year_month, extra_label.as_deref());
    request.testrun.bunsen_testlogs_branch = Some(testlogs_branch.clone());
    request.testrun.bunsen_testruns_branch = Some(testruns_branch);

    // Pure tree build: ids only, nothing written until the case is known.
    let entries: Vec<TreeEntry> = request
        .files
        .iter()
        .map(|(name, data)| TreeEntry::file(name, Blob::new(data.clone()).id))
        .collect();
    let tree = Tree::from_entries(entries)?;

    repo.check_writable()?;
    let mut attempt = 0;
    loop {
        match dispatch(repo, &request, &tree, &testlogs_branch) {
            Err(BunsenError::RefConflict { branch, .. }) if attempt < CAS_RETRIES => {
                attempt += 1;
                debug!(branch, attempt, "testlogs ref moved, retrying dispatch");
            }
            other => return other,
        }
    }
}

/// The case dispatch: decide against the current testlogs chain and the
/// stored index entry, then write whatever views are missing or stale.
fn dispatch(
    repo: &Repository,
    request: &IngestRequest,
    tree: &Tree,
    testlogs_branch: &str,
) -> Result<IngestOutcome, BunsenError> {
    let store = &repo.store;
    let index = IndexMaintainer::new(store);
    let tip = store.resolve_ref(testlogs_branch)?;

    let mut existing: Option<Commit> = None;
    if tip.is_some() {
        for commit in store.walk(testlogs_branch)? {
            let commit = commit?;
            if commit.tree_id == tree.id {
                existing = Some(commit);
                break;
            }
        }
    }

    let Some(existing) = existing else {
        // Case 1: new logs.
        let mut run = request.testrun.clone();
        run.bunsen_commit_id = None;
        for data in request.files.values() {
            store.put_blob(data)?;
        }
        let tree_id = store.put_tree(tree.entries.clone())?;
        let seconds = run.timestamp_utc().map(|at| at.timestamp()).unwrap_or(0);
        let message = run.commit_message()?;
        let id = store.make_commit(
            tree_id,
            tip.into_iter().collect(),
            Signature::engine(SignatureRole::Author, seconds),
            Signature::engine(SignatureRole::Committer, seconds),
            &message,
        )?;
        store.update_ref(testlogs_branch, tip, id)?;
        run.bunsen_commit_id = Some(id);
        debug!(%id, branch = testlogs_branch, "created testlogs commit");
        write_run_views(&index, &run)?;
        return Ok(IngestOutcome {
            id,
            case: IngestCase::Created,
        });
    };

    // Identical logs already stored. Decide between completing missing
    // views, updating the run record, or doing nothing.
    let id = existing.id;
    let mut run = request.testrun.clone();
    run.bunsen_commit_id = Some(id);

    let stored_entry = find_index_entry(&index, &run, &existing, id)?;
    match stored_entry {
        None => {
            // Case 2: dup logs, missing run views (also the crash-recovery
            // resume path).
            write_run_views(&index, &run)?;
            Ok(IngestOutcome {
                id,
                case: IngestCase::Completed,
            })
        }
        Some(stored) => {
            // Pin the stored branch assignments: logs and record stay
            // where they were first filed, whatever the resubmitted
            // timestamp now derives.
            run.bunsen_testlogs_branch = stored.bunsen_testlogs_branch.clone();
            run.bunsen_testruns_branch = stored.bunsen_testruns_branch.clone();
            run.year_month = stored.year_month.clone();

            let runs_branch = run.bunsen_testruns_branch.clone().ok_or_else(|| {
                BunsenError::ValidationFailed(format!("stored entry {id} has no testruns branch"))
            })?;
            let stored_full = index.read_full_testrun(&runs_branch, &request.project, id)?;
            let unchanged = match &stored_full {
                Some(full) => full.canonical_bytes()? == run.canonical_bytes()?,
                None => false,
            };
            if unchanged && stored.canonical_bytes()? == run.summary().canonical_bytes()? {
                // Case 4: byte-identical resubmission.
                debug!(%id, "ingest is a no-op");
                return Ok(IngestOutcome {
                    id,
                    case: IngestCase::Unchanged,
                });
            }
            // Case 3: replace the run record in place.
            write_run_views(&index, &run)?;
            Ok(IngestOutcome {
                id,
                case: IngestCase::Updated,
            })
        }
    }
}

/// Write the testruns and index views, in that order. The testlogs ref has
/// already advanced, so failures here surface as `IncompleteIngest`.
fn write_run_views(index: &IndexMaintainer, run: &Testrun) -> Result<(), BunsenError> {
    let id = run
        .bunsen_commit_id
        .ok_or_else(|| BunsenError::ValidationFailed("run has no id".into()))?;
    let runs_branch = run
        .bunsen_testruns_branch
        .as_deref()
        .ok_or_else(|| BunsenError::ValidationFailed("run has no testruns branch".into()))?;
    index
        .write_full_testrun(runs_branch, run)
        .map_err(|e| incomplete(id, &["testruns", "index"], e))?;
    index
        .upsert_summary(run)
        .map_err(|e| incomplete(id, &["index"], e))?;
    Ok(())
}

fn incomplete(id: ObjectHash, missing: &[&str], cause: BunsenError) -> BunsenError {
    warn!(%id, ?missing, %cause, "ingest left views incomplete");
    BunsenError::IncompleteIngest {
        id: id.to_string(),
        missing: missing.iter().map(|s| s.to_string()).collect(),
    }
}

/// Look up the index entry for an existing testlogs commit. The month to
/// consult comes from the summary stored in the commit message, falling
/// back to the resubmitted record's month.
fn find_index_entry(
    index: &IndexMaintainer,
    run: &Testrun,
    existing: &Commit,
    id: ObjectHash,
) -> Result<Option<Testrun>, BunsenError> {
    let message_summary = Testrun::from_commit_message(&existing.message, id).ok();
    let year_month = message_summary
        .as_ref()
        .and_then(|s| s.year_month.clone())
        .or_else(|| run.year_month.clone());
    let project = run
        .bunsen_testlogs_branch
        .as_deref()
        .and_then(|b| b.split_once('/'))
        .map(|(p, _)| p.to_string())
        .unwrap_or_default();
    let Some(year_month) = year_month else {
        return Ok(None);
    };
    let file_name = index_file_name(&project, &year_month);
    let entries = index.read_summaries(&file_name)?;
    Ok(entries
        .into_iter()
        .find(|entry| entry.bunsen_commit_id == Some(id)))
}

/// Drop files the configured manifest does not whitelist.
fn filter_manifest(repo: &Repository, request: &mut IngestRequest) -> Result<(), BunsenError> {
    let Some(globs) = repo.config.manifest_globs()? else {
        return Ok(());
    };
    request.files.retain(|name, _| {
        let keep = globs.is_match(name);
        if !keep {
            warn!(file = %name, "dropping file not in manifest");
        }
        keep
    });
    if request.files.is_empty() {
        return Err(BunsenError::ParseRejected(
            "no files left after manifest filtering".to_string(),
        ));
    }
    Ok(())
}

/// Fill `bunsen_version`, `timestamp`, and `year_month`.
///
/// Timestamp priority: the parsed timestamp; the author date of
/// `source_commit_id` in the configured source repository; the ingest
/// wall clock. A present-but-unparseable timestamp is a validation error
/// rather than silently rewritten.
fn normalize(repo: &Repository, request: &mut IngestRequest) -> Result<(), BunsenError> {
    let run = &mut request.testrun;
    run.bunsen_version = Some(env!("CARGO_PKG_VERSION").to_string());
    let at = match run.timestamp.as_deref() {
        Some(text) => parse_timestamp(text).ok_or_else(|| {
            BunsenError::ValidationFailed(format!("unparseable timestamp `{text}`"))
        })?,
        None => source_commit_timestamp(repo, &request.project, run).unwrap_or_else(|| {
            debug!("timestamp fallback: ingest wall clock");
            Utc::now()
        }),
    };
    let run = &mut request.testrun;
    run.timestamp = Some(format_timestamp(at));
    run.year_month = Some(year_month_of(at));
    Ok(())
}

/// Author date of the run's `source_commit_id` in the project's configured
/// source repository. Best-effort with a hard time budget: any miss
/// (unconfigured repo, packed or absent object, overrun) falls through.
fn source_commit_timestamp(
    repo: &Repository,
    project: &str,
    run: &Testrun,
) -> Option<DateTime<Utc>> {
    let started = Instant::now();
    let source_repo = repo.config.project(project)?.source_repo.as_ref()?;
    let commit_id: ObjectHash = run.source_commit_id.as_deref()?.parse().ok()?;

    let objects = [source_repo.join("objects"), source_repo.join(".git/objects")]
        .into_iter()
        .find(|p| p.is_dir())?;
    let loose = LooseStore::new(objects);
    let (_, payload) = loose.read(commit_id).ok()?;
    let commit = Commit::from_bytes(&payload, commit_id).ok()?;
    if started.elapsed() > SOURCE_REPO_BUDGET {
        warn!(%commit_id, "source repo read exceeded budget, ignoring");
        return None;
    }
    let at = Utc.timestamp_opt(commit.author.seconds, 0).single()?;
    debug!(%commit_id, %at, "timestamp fallback: source commit author date");
    Some(at)
}

/// Join the configured `extra_label_fields` values into a branch suffix.
fn label_from_config(repo: &Repository, run: &Testrun) -> Option<String> {
    let fields = &repo.config.upload.extra_label_fields;
    if fields.is_empty() {
        return None;
    }
    let value = run.to_value().ok()?;
    let parts: Vec<String> = fields
        .iter()
        .filter_map(|field| match value.get(field) {
            Some(Value::String(s)) => Some(sanitize_label(s)),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("-"))
    }
}

/// Branch segments admit `[A-Za-z0-9_.+-]`; anything else becomes `_`.
fn sanitize_label(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Label sanitization keeps branch names valid.
    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("Fedora 30"), "Fedora_30");
        assert_eq!(sanitize_label("x86_64/-m64"), "x86_64_-m64");
        assert_eq!(sanitize_label("plain"), "plain");
    }
}
