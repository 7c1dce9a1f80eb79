//! Branch refs with compare-and-set updates.
//!
//! Each branch is a file under `refs/heads/` holding a 40-hex id and a
//! newline; branch names may contain `/` and map to subdirectories. Updates
//! are compare-and-set: the caller states the id it last observed, and a
//! mismatch surfaces as `RefConflict` instead of clobbering another
//! writer's advance. The new value lands via temp-file rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::BunsenError;
use crate::hash::ObjectHash;

/// Read/write access to one `refs/heads/` directory.
pub struct RefStore {
    heads_dir: PathBuf,
}

impl RefStore {
    pub fn new(heads_dir: impl Into<PathBuf>) -> RefStore {
        RefStore {
            heads_dir: heads_dir.into(),
        }
    }

    /// Reject branch names that would escape `refs/heads/` or collide with
    /// the ref file layout.
    fn checked_path(&self, branch: &str) -> Result<PathBuf, BunsenError> {
        let ok = !branch.is_empty()
            && !branch.starts_with('/')
            && !branch.ends_with('/')
            && !branch.contains("//")
            && branch.split('/').all(|seg| {
                !seg.is_empty()
                    && seg != "."
                    && seg != ".."
                    && seg.chars().all(|c| {
                        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-')
                    })
            });
        if !ok {
            return Err(BunsenError::BadConfig(format!(
                "invalid branch name `{branch}`"
            )));
        }
        Ok(self.heads_dir.join(branch))
    }

    /// Current tip of a branch, or `None` when the branch does not exist.
    pub fn resolve(&self, branch: &str) -> Result<Option<ObjectHash>, BunsenError> {
        let path = self.checked_path(branch)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BunsenError::StoreIo(e)),
        };
        let id = ObjectHash::from_str(text.trim())
            .map_err(|_| BunsenError::InvalidObject(format!("ref `{branch}` holds `{}`", text.trim())))?;
        Ok(Some(id))
    }

    /// Compare-and-set update. `old` is the tip the caller last observed
    /// (`None` for "branch must not exist yet").
    pub fn update(
        &self,
        branch: &str,
        old: Option<ObjectHash>,
        new: ObjectHash,
    ) -> Result<(), BunsenError> {
        let path = self.checked_path(branch)?;
        let current = self.resolve(branch)?;
        if current != old {
            let fmt = |v: Option<ObjectHash>| {
                v.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
            };
            return Err(BunsenError::RefConflict {
                branch: branch.to_string(),
                expected: fmt(old),
                found: fmt(current),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&self.heads_dir)?;
        use std::io::Write;
        writeln!(tmp, "{new}")?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// All branch names under an optional `prefix` (e.g. `gdb/`), sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, BunsenError> {
        let mut branches = Vec::new();
        if self.heads_dir.is_dir() {
            collect_refs(&self.heads_dir, &self.heads_dir, &mut branches)?;
        }
        branches.retain(|name| name.starts_with(prefix));
        branches.sort();
        Ok(branches)
    }
}

fn collect_refs(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), BunsenError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_refs(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            if let Some(name) = rel.to_str() {
                out.push(name.replace('\\', "/"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> (tempfile::TempDir, RefStore, ObjectHash, ObjectHash) {
        let dir = tempfile::tempdir().unwrap();
        let heads = dir.path().join("refs/heads");
        fs::create_dir_all(&heads).unwrap();
        let a = "943a702d06f34599aee1f8da8ef9f7296031d699".parse().unwrap();
        let b = "8ab686eafeb1f44702738c8b0f24f2567c36da6d".parse().unwrap();
        (dir, RefStore::new(heads), a, b)
    }

    /// A fresh branch resolves to None, then to the value set.
    #[test]
    fn test_resolve_and_update() {
        let (_dir, refs, a, b) = refs();
        assert_eq!(refs.resolve("index").unwrap(), None);
        refs.update("index", None, a).unwrap();
        assert_eq!(refs.resolve("index").unwrap(), Some(a));
        refs.update("index", Some(a), b).unwrap();
        assert_eq!(refs.resolve("index").unwrap(), Some(b));
    }

    /// A stale expected value fails with RefConflict and leaves the ref.
    #[test]
    fn test_cas_conflict() {
        let (_dir, refs, a, b) = refs();
        refs.update("gdb/testlogs-2019-08", None, a).unwrap();
        let err = refs.update("gdb/testlogs-2019-08", None, b).unwrap_err();
        assert_eq!(err.kind(), "RefConflict");
        assert_eq!(refs.resolve("gdb/testlogs-2019-08").unwrap(), Some(a));
    }

    /// Branch names with `/` map to nested files and list back out.
    #[test]
    fn test_list_with_prefix() {
        let (_dir, refs, a, _b) = refs();
        refs.update("index", None, a).unwrap();
        refs.update("gdb/testlogs-2019-08", None, a).unwrap();
        refs.update("gdb/testruns-2019-08", None, a).unwrap();
        refs.update("systemtap/testlogs-2019-09", None, a).unwrap();
        assert_eq!(
            refs.list("gdb/").unwrap(),
            vec!["gdb/testlogs-2019-08", "gdb/testruns-2019-08"]
        );
        assert_eq!(refs.list("").unwrap().len(), 4);
    }

    /// Escaping names are rejected.
    #[test]
    fn test_invalid_branch_names() {
        let (_dir, refs, a, _b) = refs();
        for bad in ["", "/abs", "trail/", "a//b", "../escape", "a/./b", "sp ace"] {
            assert!(refs.update(bad, None, a).is_err(), "accepted `{bad}`");
        }
    }
}
