//! Cursors: stable references into stored log files.
//!
//! A cursor names `(log blob, line range)` by way of the testlogs commit
//! that holds the blob: `<branch>:<bunsen_commit_id>:<path>:<start>-<end>`,
//! or the abbreviated `<path>:<start>-<end>` when the surrounding record
//! supplies branch and commit. Lines are 1-indexed and inclusive. A cursor
//! stays valid as long as the referenced commit is reachable; resolution
//! clamps out-of-range lines rather than failing.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::errors::BunsenError;
use crate::hash::{HASH_HEX_LEN, ObjectHash};
use crate::store::LogStore;

/// A reference to a line range inside a stored log file.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Cursor {
    /// Testlogs branch, when the cursor is fully qualified.
    pub branch: Option<String>,
    /// Testlogs commit holding the blob, when fully qualified.
    pub commit: Option<ObjectHash>,
    /// File path inside the commit's tree.
    pub path: String,
    /// First line, 1-indexed.
    pub start: u32,
    /// Last line, inclusive; `start <= end`.
    pub end: u32,
}

/// The text a cursor resolves to.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ResolvedCursor {
    pub lines: Vec<String>,
    /// Set when the requested range was clamped to the file.
    pub truncated: bool,
}

impl Cursor {
    /// An abbreviated cursor, to be qualified by its surrounding record.
    pub fn local(path: impl Into<String>, start: u32, end: u32) -> Result<Cursor, BunsenError> {
        let path = path.into();
        if start == 0 || end < start {
            return Err(BunsenError::InvalidCursor(format!(
                "{path}:{start}-{end}"
            )));
        }
        Ok(Cursor {
            branch: None,
            commit: None,
            path,
            start,
            end,
        })
    }

    /// Qualify an abbreviated cursor with its branch and commit context.
    pub fn qualified(mut self, branch: impl Into<String>, commit: ObjectHash) -> Cursor {
        self.branch = Some(branch.into());
        self.commit = Some(commit);
        self
    }

    /// Whether the cursor carries its own commit context.
    pub fn is_qualified(&self) -> bool {
        self.commit.is_some()
    }

    /// Read the referenced lines from the store. `fallback` supplies the
    /// commit for abbreviated cursors; a qualified cursor's own commit
    /// wins.
    pub fn resolve(
        &self,
        store: &LogStore,
        fallback: Option<ObjectHash>,
    ) -> Result<ResolvedCursor, BunsenError> {
        let commit = self.commit.or(fallback).ok_or_else(|| {
            BunsenError::InvalidCursor(format!("{self} has no commit context"))
        })?;
        let bytes = store.read_path(commit, &self.path)?;
        let text = String::from_utf8_lossy(&bytes);
        let mut lines: Vec<&str> = text.split('\n').collect();
        // A trailing newline produces one empty trailing element; drop it.
        if lines.last() == Some(&"") {
            lines.pop();
        }
        let total = lines.len() as u32;
        if self.start > total {
            return Ok(ResolvedCursor {
                lines: Vec::new(),
                truncated: true,
            });
        }
        let end = self.end.min(total);
        let truncated = self.end > total;
        let slice = lines[(self.start - 1) as usize..end as usize]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Ok(ResolvedCursor {
            lines: slice,
            truncated,
        })
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let (Some(branch), Some(commit)) = (&self.branch, &self.commit) {
            write!(f, "{branch}:{commit}:")?;
        }
        if self.start == self.end {
            write!(f, "{}:{}", self.path, self.start)
        } else {
            write!(f, "{}:{}-{}", self.path, self.start, self.end)
        }
    }
}

impl FromStr for Cursor {
    type Err = BunsenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BunsenError::InvalidCursor(s.to_string());
        let (head, range) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (
                a.parse::<u32>().map_err(|_| invalid())?,
                b.parse::<u32>().map_err(|_| invalid())?,
            ),
            None => {
                let line = range.parse::<u32>().map_err(|_| invalid())?;
                (line, line)
            }
        };
        if start == 0 || end < start {
            return Err(invalid());
        }

        // A fully qualified head is `<branch>:<40-hex id>:<path>`; branch
        // names never contain `:`, so the id sits in the second segment.
        let parts: Vec<&str> = head.splitn(3, ':').collect();
        let (branch, commit, path) = match parts.as_slice() {
            [branch, id, path] if id.len() == HASH_HEX_LEN && ObjectHash::from_str(id).is_ok() => (
                Some(branch.to_string()),
                Some(ObjectHash::from_str(id).map_err(|_| invalid())?),
                path.to_string(),
            ),
            _ => (None, None, head.to_string()),
        };
        if path.is_empty() {
            return Err(invalid());
        }
        Ok(Cursor {
            branch,
            commit,
            path,
            start,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STORE_DIR;
    use crate::store::object::{Signature, SignatureRole, TreeEntry};
    use quickcheck::quickcheck;

    /// parse(serialize(c)) == c for abbreviated and qualified cursors.
    #[test]
    fn test_round_trip() {
        let local = Cursor::local("gdb.sum", 10, 20).unwrap();
        assert_eq!(local.to_string(), "gdb.sum:10-20");
        assert_eq!(Cursor::from_str("gdb.sum:10-20").unwrap(), local);

        let id: ObjectHash = "943a702d06f34599aee1f8da8ef9f7296031d699".parse().unwrap();
        let qualified = Cursor::local("gdb.sum", 5, 5)
            .unwrap()
            .qualified("gdb/testlogs-2019-08", id);
        let text = qualified.to_string();
        assert_eq!(
            text,
            "gdb/testlogs-2019-08:943a702d06f34599aee1f8da8ef9f7296031d699:gdb.sum:5"
        );
        assert_eq!(Cursor::from_str(&text).unwrap(), qualified);
    }

    /// Single-line cursors serialize without the `-end` half.
    #[test]
    fn test_single_line_form() {
        let single = Cursor::from_str("gdb.log:7").unwrap();
        assert_eq!((single.start, single.end), (7, 7));
        assert_eq!(single.to_string(), "gdb.log:7");
    }

    /// A path containing `:` still parses when not id-shaped.
    #[test]
    fn test_colon_path() {
        let cursor = Cursor::from_str("logs:today/gdb.sum:3-4").unwrap();
        assert_eq!(cursor.path, "logs:today/gdb.sum");
        assert!(cursor.commit.is_none());
    }

    /// Zero, reversed, or malformed ranges are rejected.
    #[test]
    fn test_invalid() {
        for bad in ["", "gdb.sum", "gdb.sum:0-3", "gdb.sum:9-5", "gdb.sum:x-y", ":1-2"] {
            assert!(Cursor::from_str(bad).is_err(), "accepted `{bad}`");
        }
    }

    fn store_with_log(lines: &str) -> (tempfile::TempDir, LogStore, ObjectHash) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::init(&dir.path().join(STORE_DIR)).unwrap();
        let blob = store.put_blob(lines.as_bytes()).unwrap();
        let tree = store
            .put_tree(vec![TreeEntry::file("gdb.sum", blob)])
            .unwrap();
        let id = store
            .make_commit(
                tree,
                vec![],
                Signature::engine(SignatureRole::Author, 0),
                Signature::engine(SignatureRole::Committer, 0),
                "{}\n",
            )
            .unwrap();
        (dir, store, id)
    }

    /// Resolution returns the inclusive 1-indexed slice.
    #[test]
    fn test_resolve() {
        let (_dir, store, id) = store_with_log("one\ntwo\nthree\nfour\n");
        let cursor = Cursor::local("gdb.sum", 2, 3).unwrap();
        let resolved = cursor.resolve(&store, Some(id)).unwrap();
        assert_eq!(resolved.lines, vec!["two", "three"]);
        assert!(!resolved.truncated);
    }

    /// Out-of-range ends clamp to the file and set the truncation flag.
    #[test]
    fn test_resolve_clamps() {
        let (_dir, store, id) = store_with_log("one\ntwo\n");
        let clamped = Cursor::local("gdb.sum", 2, 9)
            .unwrap()
            .resolve(&store, Some(id))
            .unwrap();
        assert_eq!(clamped.lines, vec!["two"]);
        assert!(clamped.truncated);

        let past_end = Cursor::local("gdb.sum", 5, 9)
            .unwrap()
            .resolve(&store, Some(id))
            .unwrap();
        assert!(past_end.lines.is_empty());
        assert!(past_end.truncated);
    }

    /// A cursor with no commit context anywhere is an error.
    #[test]
    fn test_resolve_needs_context() {
        let (_dir, store, _id) = store_with_log("one\n");
        let cursor = Cursor::local("gdb.sum", 1, 1).unwrap();
        assert!(matches!(
            cursor.resolve(&store, None),
            Err(BunsenError::InvalidCursor(_))
        ));
    }

    quickcheck! {
        /// Round-trip holds for arbitrary valid ranges.
        fn prop_range_round_trip(start: u32, span: u32) -> bool {
            let start = start.saturating_add(1).min(1_000_000);
            let end = start.saturating_add(span % 1000);
            let cursor = Cursor::local("x.log", start, end).unwrap();
            Cursor::from_str(&cursor.to_string()).unwrap() == cursor
        }
    }
}
