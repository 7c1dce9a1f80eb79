//! The content-addressed store adapter.
//!
//! `LogStore` wraps a bare object store on disk (`bunsen.git/`): loose
//! blob/tree/commit objects plus branch refs with compare-and-set updates.
//! All ingest and index mutation funnels through this adapter; there are no
//! multi-ref atomic updates, so callers sequence their ref advances and
//! recover from partial sequences (see the ingest engine).

pub mod loose;
pub mod object;
pub mod refs;

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::BunsenError;
use crate::hash::ObjectHash;
use crate::store::loose::LooseStore;
use crate::store::object::{Commit, ObjectType, Signature, Tree, TreeEntry};
use crate::store::refs::RefStore;

/// Directory name of the bare store inside a repository.
pub const STORE_DIR: &str = "bunsen.git";

/// Handle on one bare store.
pub struct LogStore {
    root: PathBuf,
    loose: LooseStore,
    refs: RefStore,
}

impl LogStore {
    /// Create the bare store skeleton at `root` (the `bunsen.git` path).
    pub fn init(root: &Path) -> Result<LogStore, BunsenError> {
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs/heads"))?;
        fs::write(root.join("HEAD"), "ref: refs/heads/index\n")?;
        Self::open(root)
    }

    /// Open an existing bare store, validating the layout.
    pub fn open(root: &Path) -> Result<LogStore, BunsenError> {
        if !root.join("objects").is_dir() || !root.join("refs/heads").is_dir() {
            return Err(BunsenError::NotFound(format!(
                "no bare store at {}",
                root.display()
            )));
        }
        Ok(LogStore {
            root: root.to_path_buf(),
            loose: LooseStore::new(root.join("objects")),
            refs: RefStore::new(root.join("refs/heads")),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a blob, returning its id.
    pub fn put_blob(&self, data: &[u8]) -> Result<ObjectHash, BunsenError> {
        self.loose.write(ObjectType::Blob, data)
    }

    /// Store a tree built from `entries`, returning its id.
    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> Result<ObjectHash, BunsenError> {
        let tree = Tree::from_entries(entries)?;
        self.loose.write(ObjectType::Tree, &tree.to_data())
    }

    /// Create and store a commit object.
    pub fn make_commit(
        &self,
        tree_id: ObjectHash,
        parent_ids: Vec<ObjectHash>,
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> Result<ObjectHash, BunsenError> {
        let commit = Commit::new(author, committer, tree_id, parent_ids, message);
        self.loose.write(ObjectType::Commit, &commit.to_data())
    }

    /// Whether an object is already present.
    pub fn contains(&self, id: ObjectHash) -> bool {
        self.loose.contains(id)
    }

    /// Read a blob's bytes.
    pub fn read_blob(&self, id: ObjectHash) -> Result<Vec<u8>, BunsenError> {
        match self.loose.read(id)? {
            (ObjectType::Blob, payload) => Ok(payload),
            (other, _) => Err(BunsenError::InvalidObject(format!(
                "{id} is a {other}, expected a blob"
            ))),
        }
    }

    /// Read a commit object.
    pub fn read_commit(&self, id: ObjectHash) -> Result<Commit, BunsenError> {
        match self.loose.read(id)? {
            (ObjectType::Commit, payload) => Commit::from_bytes(&payload, id),
            (other, _) => Err(BunsenError::InvalidObject(format!(
                "{id} is a {other}, expected a commit"
            ))),
        }
    }

    /// Read the tree of a commit.
    pub fn read_tree(&self, commit_id: ObjectHash) -> Result<Tree, BunsenError> {
        let commit = self.read_commit(commit_id)?;
        self.read_tree_object(commit.tree_id)
    }

    /// Read a tree object by its own id.
    pub fn read_tree_object(&self, tree_id: ObjectHash) -> Result<Tree, BunsenError> {
        match self.loose.read(tree_id)? {
            (ObjectType::Tree, payload) => Tree::from_bytes(&payload, tree_id),
            (other, _) => Err(BunsenError::InvalidObject(format!(
                "{tree_id} is a {other}, expected a tree"
            ))),
        }
    }

    /// Read the blob at `path` inside a commit's tree. `path` may contain
    /// `/` separators for nested bundles.
    pub fn read_path(&self, commit_id: ObjectHash, path: &str) -> Result<Vec<u8>, BunsenError> {
        let mut tree = self.read_tree(commit_id)?;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let entry = tree.entry(segment).ok_or_else(|| {
                BunsenError::NotFound(format!("path `{path}` in commit {commit_id}"))
            })?;
            if segments.peek().is_none() {
                return self.read_blob(entry.id);
            }
            tree = self.read_tree_object(entry.id)?;
        }
        Err(BunsenError::NotFound(format!("empty path in {commit_id}")))
    }

    /// Current tip of a branch.
    pub fn resolve_ref(&self, branch: &str) -> Result<Option<ObjectHash>, BunsenError> {
        self.refs.resolve(branch)
    }

    /// Compare-and-set advance of a branch.
    pub fn update_ref(
        &self,
        branch: &str,
        old: Option<ObjectHash>,
        new: ObjectHash,
    ) -> Result<(), BunsenError> {
        self.refs.update(branch, old, new)
    }

    /// Branch names under a prefix, sorted.
    pub fn list_branches(&self, prefix: &str) -> Result<Vec<String>, BunsenError> {
        self.refs.list(prefix)
    }

    /// First-parent walk of a branch, tip first. An unborn branch yields
    /// nothing.
    pub fn walk(&self, branch: &str) -> Result<CommitWalk<'_>, BunsenError> {
        Ok(CommitWalk {
            store: self,
            next: self.resolve_ref(branch)?,
        })
    }
}

/// Iterator over the first-parent chain of a branch.
pub struct CommitWalk<'a> {
    store: &'a LogStore,
    next: Option<ObjectHash>,
}

impl Iterator for CommitWalk<'_> {
    type Item = Result<Commit, BunsenError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.store.read_commit(id) {
            Ok(commit) => {
                self.next = commit.parent_ids.first().copied();
                Some(Ok(commit))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::object::SignatureRole;

    fn new_store() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::init(&dir.path().join(STORE_DIR)).unwrap();
        (dir, store)
    }

    fn commit_file(
        store: &LogStore,
        branch: &str,
        name: &str,
        data: &[u8],
        message: &str,
    ) -> ObjectHash {
        let blob = store.put_blob(data).unwrap();
        let tree = store.put_tree(vec![TreeEntry::file(name, blob)]).unwrap();
        let parent = store.resolve_ref(branch).unwrap();
        let id = store
            .make_commit(
                tree,
                parent.into_iter().collect(),
                Signature::engine(SignatureRole::Author, 0),
                Signature::engine(SignatureRole::Committer, 0),
                message,
            )
            .unwrap();
        store.update_ref(branch, parent, id).unwrap();
        id
    }

    /// init creates a store that open accepts; open rejects a bare dir.
    #[test]
    fn test_init_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_DIR);
        assert!(LogStore::open(&path).is_err());
        LogStore::init(&path).unwrap();
        LogStore::open(&path).unwrap();
    }

    /// Blobs, trees and commits round-trip through the store.
    #[test]
    fn test_commit_and_read_back() {
        let (_dir, store) = new_store();
        let id = commit_file(&store, "gdb/testlogs-2019-08", "gdb.sum", b"PASS: t\n", "{}\n");
        let commit = store.read_commit(id).unwrap();
        assert_eq!(commit.message, "{}\n");
        assert_eq!(
            store.read_path(id, "gdb.sum").unwrap(),
            b"PASS: t\n".to_vec()
        );
        assert!(matches!(
            store.read_path(id, "missing.log"),
            Err(BunsenError::NotFound(_))
        ));
    }

    /// walk yields the first-parent chain, tip first.
    #[test]
    fn test_walk_chain() {
        let (_dir, store) = new_store();
        let first = commit_file(&store, "gdb/testlogs-2019-08", "a", b"1", "one\n");
        let second = commit_file(&store, "gdb/testlogs-2019-08", "a", b"2", "two\n");
        let chain: Vec<_> = store
            .walk("gdb/testlogs-2019-08")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, second);
        assert_eq!(chain[1].id, first);
        assert!(store.walk("gdb/testlogs-1999-01").unwrap().next().is_none());
    }

    /// Identical content produces one object regardless of writer count.
    #[test]
    fn test_dedup_across_commits() {
        let (_dir, store) = new_store();
        let a = store.put_blob(b"shared log text").unwrap();
        let b = store.put_blob(b"shared log text").unwrap();
        assert_eq!(a, b);
    }
}
