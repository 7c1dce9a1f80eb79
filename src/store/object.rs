//! Object model for the content-addressed log store: blobs hold verbatim log
//! bytes, trees bind a testrun's file names to blobs, and commits chain a
//! tree to the history of a testlogs branch while carrying the testrun
//! summary in their message.
//!
//! Wire formats follow the loose-object conventions of the underlying bare
//! store byte for byte, so ids computed here are stable across engines.

use std::fmt::{self, Display};
use std::str::FromStr;

use bstr::ByteSlice;

use crate::errors::BunsenError;
use crate::hash::{HASH_SIZE, ObjectHash};

const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const COMMIT_OBJECT_TYPE: &[u8] = b"commit";

/// Object kinds held by the store. Only the three kinds the log layout
/// needs; there are no tags or delta objects here.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
        })
    }
}

impl ObjectType {
    /// The type name bytes used in object headers.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Blob => BLOB_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
        }
    }

    /// Parses a type name as it appears in an object header.
    pub fn from_name(s: &str) -> Result<ObjectType, BunsenError> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            _ => Err(BunsenError::InvalidObject(format!(
                "unknown object type `{s}`"
            ))),
        }
    }
}

/// Role tag of a commit signature line.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SignatureRole {
    Author,
    Committer,
}

impl Display for SignatureRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SignatureRole::Author => "author",
            SignatureRole::Committer => "committer",
        })
    }
}

/// One `author`/`committer` line of a commit.
///
/// Bunsen always writes the fixed engine identity with a UTC offset, so that
/// commit ids depend only on the tree, the parent, and the run timestamp.
/// Arbitrary identities are still parsed back faithfully.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Signature {
    pub role: SignatureRole,
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Timezone offset text, e.g. `+0000`. Preserved verbatim on re-parse.
    pub offset: String,
}

/// Fixed identity used for every commit the engine writes.
pub const ENGINE_NAME: &str = "bunsen";
/// Email of the fixed engine identity.
pub const ENGINE_EMAIL: &str = "bunsen@local";

impl Signature {
    /// The engine identity at a given timestamp (seconds, UTC).
    pub fn engine(role: SignatureRole, seconds: i64) -> Signature {
        Signature {
            role,
            name: ENGINE_NAME.to_string(),
            email: ENGINE_EMAIL.to_string(),
            seconds,
            offset: "+0000".to_string(),
        }
    }

    /// Parse one signature line, e.g.
    /// `author bunsen <bunsen@local> 1566914580 +0000`.
    pub fn from_data(data: &[u8]) -> Result<Signature, BunsenError> {
        let text = data
            .to_str()
            .map_err(|_| BunsenError::InvalidObject("signature is not UTF-8".to_string()))?;
        let invalid = || BunsenError::InvalidObject(format!("malformed signature `{text}`"));

        let (role_str, rest) = text.split_once(' ').ok_or_else(invalid)?;
        let role = match role_str {
            "author" => SignatureRole::Author,
            "committer" => SignatureRole::Committer,
            _ => return Err(invalid()),
        };
        let lt = rest.find('<').ok_or_else(invalid)?;
        let gt = rest.find('>').ok_or_else(invalid)?;
        if gt < lt || lt == 0 {
            return Err(invalid());
        }
        let name = rest[..lt - 1].to_string();
        let email = rest[lt + 1..gt].to_string();
        let mut tail = rest[gt + 1..].split_whitespace();
        let seconds = tail
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let offset = tail.next().unwrap_or("+0000").to_string();
        Ok(Signature {
            role,
            name,
            email,
            seconds,
            offset,
        })
    }

    /// Serialize the signature line without a trailing newline.
    pub fn to_data(&self) -> Vec<u8> {
        format!(
            "{} {} <{}> {} {}",
            self.role, self.name, self.email, self.seconds, self.offset
        )
        .into_bytes()
    }
}

/// A file's verbatim bytes under a testlogs commit.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Blob {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, &data);
        Blob { id, data }
    }
}

/// Entry mode inside a tree. Log bundles are flat, but subtrees are encoded
/// and decoded so nested bundles stay representable.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum EntryMode {
    File,
    Dir,
}

impl EntryMode {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            EntryMode::File => b"100644",
            EntryMode::Dir => b"40000",
        }
    }

    pub fn from_mode_bytes(mode: &[u8]) -> Result<EntryMode, BunsenError> {
        match mode {
            b"100644" | b"100755" | b"120000" => Ok(EntryMode::File),
            b"40000" | b"040000" => Ok(EntryMode::Dir),
            _ => Err(BunsenError::InvalidObject(format!(
                "unknown tree entry mode `{}`",
                mode.as_bstr()
            ))),
        }
    }
}

/// One name → object binding inside a tree.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub id: ObjectHash,
    pub name: String,
}

impl TreeEntry {
    pub fn file(name: impl Into<String>, id: ObjectHash) -> TreeEntry {
        TreeEntry {
            mode: EntryMode::File,
            id,
            name: name.into(),
        }
    }

    /// Sort key: directories compare as if their name ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode == EntryMode::Dir {
            key.push(b'/');
        }
        key
    }
}

/// The file listing of one testrun's log bundle.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Tree {
    pub id: ObjectHash,
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries. Entries are sorted into canonical order,
    /// so the resulting id is independent of insertion order.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Result<Tree, BunsenError> {
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(BunsenError::InvalidObject(format!(
                    "duplicate tree entry `{}`",
                    pair[0].name
                )));
            }
        }
        let mut tree = Tree {
            id: ObjectHash::default(),
            entries,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data());
        Ok(tree)
    }

    /// Serialize to the tree wire format:
    /// `<mode> <name>\0<raw id bytes>` per entry.
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend(entry.mode.as_bytes());
            data.push(b' ');
            data.extend(entry.name.as_bytes());
            data.push(b'\x00');
            data.extend(entry.id.as_bytes());
        }
        data
    }

    /// Parse a tree payload read back from the store.
    pub fn from_bytes(data: &[u8], id: ObjectHash) -> Result<Tree, BunsenError> {
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .find_byte(b' ')
                .ok_or_else(|| BunsenError::InvalidObject("tree entry without mode".to_string()))?;
            let mode = EntryMode::from_mode_bytes(&rest[..space])?;
            rest = &rest[space + 1..];
            let nul = rest
                .find_byte(b'\x00')
                .ok_or_else(|| BunsenError::InvalidObject("tree entry without name".to_string()))?;
            let name = rest[..nul]
                .to_str()
                .map_err(|_| BunsenError::InvalidObject("tree entry name not UTF-8".to_string()))?
                .to_string();
            rest = &rest[nul + 1..];
            if rest.len() < HASH_SIZE {
                return Err(BunsenError::InvalidObject(
                    "tree entry truncated before id".to_string(),
                ));
            }
            let entry_id = ObjectHash::from_bytes(&rest[..HASH_SIZE])?;
            rest = &rest[HASH_SIZE..];
            entries.push(TreeEntry {
                mode,
                id: entry_id,
                name,
            });
        }
        Ok(Tree { id, entries })
    }

    /// Look up an entry by name.
    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// A commit on a testlogs, testruns, or index branch.
///
/// On testlogs branches the commit id is the `bunsen_commit_id` and the
/// message carries the canonical testrun summary. The id is a deterministic
/// hash of tree, parents, signatures, and message.
#[derive(Eq, Debug, Clone)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in &self.parent_ids {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "date: {} {}", self.author.seconds, self.author.offset)?;
        writeln!(f)?;
        write!(f, "{}", self.message)
    }
}

impl Commit {
    /// Build a commit and compute its id from the serialized payload.
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data());
        commit
    }

    /// Serialize to the commit wire format.
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.push(b'\x0a');
        for parent_id in &self.parent_ids {
            data.extend(b"parent ");
            data.extend(parent_id.to_string().as_bytes());
            data.push(b'\x0a');
        }
        data.extend(self.author.to_data());
        data.push(b'\x0a');
        data.extend(self.committer.to_data());
        data.push(b'\x0a');
        data.push(b'\x0a');
        data.extend(self.message.as_bytes());
        data
    }

    /// Parse a commit payload read back from the store.
    pub fn from_bytes(data: &[u8], id: ObjectHash) -> Result<Commit, BunsenError> {
        let header_end = data
            .find(b"\n\n")
            .ok_or_else(|| BunsenError::InvalidObject("commit without message".to_string()))?;
        let message = data[header_end + 2..]
            .to_str()
            .map_err(|_| BunsenError::InvalidObject("commit message not UTF-8".to_string()))?
            .to_string();

        let mut tree_id = None;
        let mut parent_ids = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in data[..header_end].lines() {
            if let Some(rest) = line.strip_prefix(b"tree ") {
                tree_id = Some(parse_id_line(rest)?);
            } else if let Some(rest) = line.strip_prefix(b"parent ") {
                parent_ids.push(parse_id_line(rest)?);
            } else if line.starts_with(b"author ") {
                author = Some(Signature::from_data(line)?);
            } else if line.starts_with(b"committer ") {
                committer = Some(Signature::from_data(line)?);
            }
            // Unknown header lines are ignored on read.
        }
        let invalid = |what: &str| BunsenError::InvalidObject(format!("commit without {what}"));
        Ok(Commit {
            id,
            tree_id: tree_id.ok_or_else(|| invalid("tree"))?,
            parent_ids,
            author: author.ok_or_else(|| invalid("author"))?,
            committer: committer.ok_or_else(|| invalid("committer"))?,
            message,
        })
    }
}

fn parse_id_line(bytes: &[u8]) -> Result<ObjectHash, BunsenError> {
    let text = bytes
        .to_str()
        .map_err(|_| BunsenError::InvalidObject("id line not UTF-8".to_string()))?;
    ObjectHash::from_str(text.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// Blob ids match `git hash-object` for known content.
    #[test]
    fn test_blob_id() {
        let blob = Blob::new(b"test content\n".to_vec());
        assert_eq!(
            blob.id.to_string(),
            "d670460b4b4aece5915caf5c68d12f560a9fe3e4"
        );
    }

    /// The empty tree hashes to the well-known id.
    #[test]
    fn test_empty_tree_id() {
        let tree = Tree::from_entries(Vec::new()).unwrap();
        assert_eq!(
            tree.id.to_string(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    /// Tree ids are independent of entry insertion order.
    #[test]
    fn test_tree_order_independent() {
        let blob = Blob::new(b"x".to_vec());
        let a = Tree::from_entries(vec![
            TreeEntry::file("b.log", blob.id),
            TreeEntry::file("a.sum", blob.id),
        ])
        .unwrap();
        let b = Tree::from_entries(vec![
            TreeEntry::file("a.sum", blob.id),
            TreeEntry::file("b.log", blob.id),
        ])
        .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.entries[0].name, "a.sum");
    }

    /// Duplicate names are rejected.
    #[test]
    fn test_tree_duplicate_entry() {
        let blob = Blob::new(b"x".to_vec());
        let result = Tree::from_entries(vec![
            TreeEntry::file("gdb.log", blob.id),
            TreeEntry::file("gdb.log", blob.id),
        ]);
        assert!(result.is_err());
    }

    /// Tree payloads round-trip through serialize and parse.
    #[test]
    fn test_tree_round_trip() {
        let blob = Blob::new(b"log line\n".to_vec());
        let tree = Tree::from_entries(vec![
            TreeEntry::file("gdb.log", blob.id),
            TreeEntry::file("gdb.sum", blob.id),
        ])
        .unwrap();
        let parsed = Tree::from_bytes(&tree.to_data(), tree.id).unwrap();
        assert_eq!(parsed, tree);
        assert!(parsed.entry("gdb.sum").is_some());
        assert!(parsed.entry("missing").is_none());
    }

    /// Signature lines round-trip and keep the offset text.
    #[test]
    fn test_signature_round_trip() {
        let sig = Signature::engine(SignatureRole::Author, 1566914580);
        let data = sig.to_data();
        assert_eq!(data, b"author bunsen <bunsen@local> 1566914580 +0000");
        let parsed = Signature::from_data(&data).unwrap();
        assert_eq!(parsed, sig);
    }

    /// Foreign identities parse as-is.
    #[test]
    fn test_signature_foreign_identity() {
        let sig =
            Signature::from_data(b"committer A. Hacker <hacker@example.com> 123456 +0800").unwrap();
        assert_eq!(sig.role, SignatureRole::Committer);
        assert_eq!(sig.name, "A. Hacker");
        assert_eq!(sig.email, "hacker@example.com");
        assert_eq!(sig.seconds, 123456);
        assert_eq!(sig.offset, "+0800");
    }

    /// Malformed signature lines are rejected, not panicked on.
    #[test]
    fn test_signature_malformed() {
        assert!(Signature::from_data(b"author").is_err());
        assert!(Signature::from_data(b"tagger x <a@b> 1 +0000").is_err());
        assert!(Signature::from_data(b"author x <a@b> notanumber +0000").is_err());
    }

    fn summary_commit() -> Commit {
        let tree = Tree::from_entries(Vec::new()).unwrap();
        Commit::new(
            Signature::engine(SignatureRole::Author, 1566914580),
            Signature::engine(SignatureRole::Committer, 1566914580),
            tree.id,
            vec![],
            "{\"pass_count\":42}\n",
        )
    }

    /// Commit payloads round-trip through serialize and parse.
    #[test]
    fn test_commit_round_trip() {
        let commit = summary_commit();
        let parsed = Commit::from_bytes(&commit.to_data(), commit.id).unwrap();
        assert_eq!(parsed.tree_id, commit.tree_id);
        assert_eq!(parsed.parent_ids, commit.parent_ids);
        assert_eq!(parsed.author, commit.author);
        assert_eq!(parsed.message, commit.message);
        // Re-hashing the parsed commit reproduces the id.
        let rehash = ObjectHash::from_type_and_data(ObjectType::Commit, &parsed.to_data());
        assert_eq!(rehash, commit.id);
    }

    /// The id is deterministic in tree, parents, identity and message.
    #[test]
    fn test_commit_id_deterministic() {
        let a = summary_commit();
        let b = summary_commit();
        assert_eq!(a.id, b.id);
        let tree = Tree::from_entries(Vec::new()).unwrap();
        let c = Commit::new(
            Signature::engine(SignatureRole::Author, 1566914581),
            Signature::engine(SignatureRole::Committer, 1566914581),
            tree.id,
            vec![],
            "{\"pass_count\":42}\n",
        );
        assert_ne!(a.id, c.id);
    }

    /// Parent chains serialize one `parent` line each.
    #[test]
    fn test_commit_parents() {
        let tree = Tree::from_entries(Vec::new()).unwrap();
        let parent = ObjectHash::from_str("8ab686eafeb1f44702738c8b0f24f2567c36da6d").unwrap();
        let commit = Commit::new(
            Signature::engine(SignatureRole::Author, 0),
            Signature::engine(SignatureRole::Committer, 0),
            tree.id,
            vec![parent],
            "msg\n",
        );
        let parsed = Commit::from_bytes(&commit.to_data(), commit.id).unwrap();
        assert_eq!(parsed.parent_ids, vec![parent]);
    }

    /// Commits without a blank separator line are rejected.
    #[test]
    fn test_commit_malformed() {
        assert!(Commit::from_bytes(b"tree deadbeef", ObjectHash::default()).is_err());
    }
}
