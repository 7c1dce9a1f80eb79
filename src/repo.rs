//! Repository lifecycle: layout, initialization, the write lock, the
//! format-version gate, and maintenance operations.
//!
//! On disk a repository is:
//!
//! ```text
//! <repo>/config        INI configuration
//! <repo>/bunsen.git/   bare content-addressed store
//! <repo>/bunsen.lock   advisory write lock (exists while held)
//! <repo>/scripts*/     commit-module source roots
//! <repo>/cache/        owned by analysis scripts, ignored here
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, warn};

use crate::config::{CONFIG_FILE, RepoConfig};
use crate::errors::BunsenError;
use crate::hash::ObjectHash;
use crate::index::{FORMAT_FILE, INDEX_BRANCH, IndexMaintainer, index_file_name};
use crate::ingest::{IngestOutcome, IngestRequest, ingest_bundle};
use crate::lock::{LOCK_FILE, WriteLock};
use crate::model::canonical;
use crate::model::testrun::Testrun;
use crate::query::Query;
use crate::scripts::{FileMap, ScriptRegistry};
use crate::store::{LogStore, STORE_DIR};
use crate::store::object::{Signature, SignatureRole, TreeEntry};

/// Highest index-layout version this engine writes.
pub const FORMAT_VERSION: u64 = 1;

/// Name of a project's testlogs branch for one month.
pub fn testlogs_branch_name(project: &str, year_month: &str) -> String {
    format!("{project}/testlogs-{year_month}")
}

/// Name of a project's testruns branch for one month, with an optional
/// extra label suffix.
pub fn testruns_branch_name(project: &str, year_month: &str, extra: Option<&str>) -> String {
    match extra {
        Some(extra) if !extra.is_empty() => {
            format!("{project}/testruns-{year_month}-{extra}")
        }
        _ => format!("{project}/testruns-{year_month}"),
    }
}

/// Split `<project>/testlogs-YYYY-MM` into its project and month.
pub fn parse_testlogs_branch(branch: &str) -> Option<(&str, &str)> {
    let (project, rest) = branch.split_once('/')?;
    let year_month = rest.strip_prefix("testlogs-")?;
    if year_month.len() == 7
        && year_month.as_bytes()[4] == b'-'
        && year_month
            .chars()
            .enumerate()
            .all(|(i, c)| i == 4 || c.is_ascii_digit())
    {
        Some((project, year_month))
    } else {
        None
    }
}

/// What `repair` did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Testlogs commits scanned.
    pub scanned: usize,
    /// Full-testrun files rebuilt from commit-message summaries.
    pub rebuilt_testruns: usize,
    /// Index entries appended for commits that had none.
    pub appended_index: usize,
}

/// An opened repository.
pub struct Repository {
    root: PathBuf,
    pub store: LogStore,
    pub config: RepoConfig,
    registry: ScriptRegistry,
}

impl Repository {
    /// Create a repository at `dir`: the bare store, an empty config, and
    /// the initial `index` commit carrying the layout-version file.
    pub fn init(dir: &Path) -> Result<Repository, BunsenError> {
        fs::create_dir_all(dir)?;
        let store = LogStore::init(&dir.join(STORE_DIR))?;
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            fs::write(&config_path, "")?;
        }

        if store.resolve_ref(INDEX_BRANCH)?.is_none() {
            let format = canonical::to_bytes(&json!({ "version": FORMAT_VERSION }))?;
            let blob = store.put_blob(&format)?;
            let tree = store.put_tree(vec![TreeEntry::file(FORMAT_FILE, blob)])?;
            let commit = store.make_commit(
                tree,
                vec![],
                Signature::engine(SignatureRole::Author, 0),
                Signature::engine(SignatureRole::Committer, 0),
                "initialize index\n",
            )?;
            store.update_ref(INDEX_BRANCH, None, commit)?;
        }
        info!(dir = %dir.display(), "initialized repository");
        Repository::open(dir)
    }

    /// Open an existing repository, loading config and scanning scripts
    /// directories. The write lock is only taken when mutation starts.
    pub fn open(dir: &Path) -> Result<Repository, BunsenError> {
        let store = LogStore::open(&dir.join(STORE_DIR))?;
        let config = RepoConfig::load(&dir.join(CONFIG_FILE))?;
        let registry = ScriptRegistry::discover(dir)?;
        Ok(Repository {
            root: dir.to_path_buf(),
            store,
            config,
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// The query surface over this repository.
    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    /// Acquire the write lock, blocking on another holder.
    pub fn lock(&self) -> Result<WriteLock, BunsenError> {
        WriteLock::acquire(&self.root.join(LOCK_FILE))
    }

    /// Acquire the write lock without blocking.
    pub fn try_lock(&self) -> Result<WriteLock, BunsenError> {
        WriteLock::try_acquire(&self.root.join(LOCK_FILE))
    }

    /// Refuse mutation when the index layout is newer than this engine.
    pub fn check_writable(&self) -> Result<(), BunsenError> {
        let tip = self.store.resolve_ref(INDEX_BRANCH)?.ok_or_else(|| {
            BunsenError::BadConfig("repository has no index branch; run init".to_string())
        })?;
        let bytes = match self.store.read_path(tip, FORMAT_FILE) {
            Ok(bytes) => bytes,
            // Pre-versioning repositories are treated as version 1.
            Err(BunsenError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let value = canonical::parse(&bytes)?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version > FORMAT_VERSION {
            return Err(BunsenError::BadConfig(format!(
                "index layout version {version} is newer than supported {FORMAT_VERSION}"
            )));
        }
        Ok(())
    }

    /// Ingest an already-parsed bundle under the write lock.
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, BunsenError> {
        let _lock = self.lock()?;
        ingest_bundle(self, request)
    }

    /// Front-door ingest: run the configured commit module over a file
    /// map, then store the result.
    pub fn ingest_files(
        &self,
        project: Option<&str>,
        files: FileMap,
        extra_label: Option<String>,
    ) -> Result<IngestOutcome, BunsenError> {
        let project = project
            .map(|p| p.to_string())
            .or_else(|| self.config.default_project.clone())
            .ok_or_else(|| {
                BunsenError::BadConfig("no project given and no [core] project configured".into())
            })?;
        let module = self
            .registry
            .resolve(self.config.upload.commit_module.as_deref())?;
        let parsed = module.parse(files)?;
        self.ingest(IngestRequest {
            project,
            files: parsed.files,
            testrun: parsed.testrun,
            extra_label: extra_label.or(parsed.extra_label),
        })
    }

    /// Front-door ingest from a tar archive.
    pub fn ingest_tar(
        &self,
        project: Option<&str>,
        reader: impl Read,
        extra_label: Option<String>,
    ) -> Result<IngestOutcome, BunsenError> {
        let files = read_tar_bundle(reader)?;
        self.ingest_files(project, files, extra_label)
    }

    /// Scan every testlogs commit and rebuild whatever views are missing:
    /// a full-testrun file is reconstructed from the commit-message
    /// summary, and an absent index entry is appended. Existing entries
    /// are never replaced, so a repaired Case-3 update keeps its
    /// corrected record.
    pub fn repair(&self) -> Result<RepairReport, BunsenError> {
        let _lock = self.lock()?;
        self.check_writable()?;
        let index = IndexMaintainer::new(&self.store);
        let mut report = RepairReport::default();

        for branch in self.store.list_branches("")? {
            let Some((project, _)) = parse_testlogs_branch(&branch) else {
                continue;
            };
            let project = project.to_string();
            for commit in self.store.walk(&branch)? {
                let commit = commit?;
                report.scanned += 1;
                let run = match Testrun::from_commit_message(&commit.message, commit.id) {
                    Ok(run) => run,
                    Err(e) => {
                        warn!(id = %commit.id, %e, "unparsable summary in commit message");
                        continue;
                    }
                };
                let Some(runs_branch) = run.bunsen_testruns_branch.clone() else {
                    warn!(id = %commit.id, "summary names no testruns branch");
                    continue;
                };
                let Some(year_month) = run.year_month.clone() else {
                    warn!(id = %commit.id, "summary names no year_month");
                    continue;
                };

                if index
                    .read_full_testrun(&runs_branch, &project, commit.id)?
                    .is_none()
                {
                    index.write_full_testrun(&runs_branch, &run)?;
                    report.rebuilt_testruns += 1;
                    info!(id = %commit.id, branch = %runs_branch, "rebuilt full-testrun file");
                }

                let file_name = index_file_name(&project, &year_month);
                let present = index
                    .read_summaries(&file_name)?
                    .iter()
                    .any(|entry| entry.bunsen_commit_id == Some(commit.id));
                if !present {
                    index.upsert_summary(&run)?;
                    report.appended_index += 1;
                    info!(id = %commit.id, file = %file_name, "appended missing index entry");
                }
            }
        }
        Ok(report)
    }

    /// Mark a testrun obsolete, excluding it from queries. The log commits
    /// themselves are never rewritten. The stored record is read under the
    /// write lock, so a concurrent writer's update cannot land between the
    /// read and the rewrite and be clobbered.
    pub fn mark_obsolete(&self, id_prefix: &str) -> Result<ObjectHash, BunsenError> {
        let _lock = self.lock()?;
        self.check_writable()?;
        let query = self.query();
        let id = query.resolve_id(id_prefix)?;
        let mut summary = query.summary(id)?;
        let mut full = query.get_testrun_by_id(id)?;
        let index = IndexMaintainer::new(&self.store);
        summary.obsolete = Some(true);
        full.obsolete = Some(true);
        let runs_branch = full.bunsen_testruns_branch.clone().ok_or_else(|| {
            BunsenError::ValidationFailed("stored run names no testruns branch".into())
        })?;
        index.write_full_testrun(&runs_branch, &full)?;
        index.upsert_summary(&summary)?;
        info!(%id, "marked testrun obsolete");
        Ok(id)
    }
}

/// Decode a tar archive into a file map. A single shared top-level
/// directory (the usual tarball layout) is stripped from every path.
fn read_tar_bundle(reader: impl Read) -> Result<FileMap, BunsenError> {
    let mut archive = tar::Archive::new(reader);
    let mut files = FileMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let name = path.to_string_lossy().trim_start_matches("./").to_string();
        if name.is_empty() {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }
    if files.is_empty() {
        return Err(BunsenError::ParseRejected("empty tar bundle".to_string()));
    }

    let first_component = |name: &str| name.split('/').next().map(|s| s.to_string());
    let shared = files
        .keys()
        .filter_map(|name| first_component(name))
        .collect::<std::collections::BTreeSet<_>>();
    if shared.len() == 1 && files.keys().all(|name| name.contains('/')) {
        let prefix_len = shared.iter().next().map(|p| p.len() + 1).unwrap_or(0);
        files = files
            .into_iter()
            .map(|(name, data)| (name[prefix_len..].to_string(), data))
            .collect();
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Branch names format and parse back.
    #[test]
    fn test_branch_names() {
        assert_eq!(testlogs_branch_name("gdb", "2019-08"), "gdb/testlogs-2019-08");
        assert_eq!(
            testruns_branch_name("gdb", "2019-08", Some("Fedora-x86_64-m64")),
            "gdb/testruns-2019-08-Fedora-x86_64-m64"
        );
        assert_eq!(
            testruns_branch_name("gdb", "2019-08", None),
            "gdb/testruns-2019-08"
        );
        assert_eq!(
            parse_testlogs_branch("gdb/testlogs-2019-08"),
            Some(("gdb", "2019-08"))
        );
        assert_eq!(parse_testlogs_branch("gdb/testruns-2019-08"), None);
        assert_eq!(parse_testlogs_branch("index"), None);
        assert_eq!(parse_testlogs_branch("gdb/testlogs-19-08"), None);
    }

    /// init creates config, store, and the format-versioned index.
    #[test]
    fn test_init_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert!(dir.path().join(STORE_DIR).is_dir());
        let tip = repo.store.resolve_ref(INDEX_BRANCH).unwrap().unwrap();
        let format = repo.store.read_path(tip, FORMAT_FILE).unwrap();
        assert_eq!(format, b"{\"version\":1}");
        repo.check_writable().unwrap();
        // init is idempotent.
        Repository::init(dir.path()).unwrap();
    }

    /// A higher layout version refuses mutation.
    #[test]
    fn test_format_gate() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        // Simulate a newer engine bumping the version file.
        let tip = repo.store.resolve_ref(INDEX_BRANCH).unwrap().unwrap();
        let mut entries = repo.store.read_tree(tip).unwrap().entries;
        let blob = repo.store.put_blob(b"{\"version\":2}").unwrap();
        entries.retain(|e| e.name != FORMAT_FILE);
        entries.push(TreeEntry::file(FORMAT_FILE, blob));
        let tree = repo.store.put_tree(entries).unwrap();
        let commit = repo
            .store
            .make_commit(
                tree,
                vec![tip],
                Signature::engine(SignatureRole::Author, 0),
                Signature::engine(SignatureRole::Committer, 0),
                "bump format\n",
            )
            .unwrap();
        repo.store.update_ref(INDEX_BRANCH, Some(tip), commit).unwrap();

        let err = repo.check_writable().unwrap_err();
        assert_eq!(err.kind(), "BadConfig");
    }

    /// Tar bundles decode with the shared top-level directory stripped.
    #[test]
    fn test_read_tar_bundle() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut add = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        };
        add("run-2019/gdb.sum", b"PASS: t\n");
        add("run-2019/gdb.log", b"log\n");
        let bytes = builder.into_inner().unwrap();

        let files = read_tar_bundle(bytes.as_slice()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("gdb.sum"));
        assert_eq!(files["gdb.log"], b"log\n");
    }
}
