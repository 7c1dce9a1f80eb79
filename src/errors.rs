//! Error types for the Bunsen engine.
//!
//! This module defines a unified error enumeration used across the object
//! store, the testrun model, ingest, indexing, and the query surface. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Every variant maps to a stable kind tag and a CLI exit code.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the Bunsen library.
///
/// - Used across store access, canonical serialization, ingest and queries.
/// - Implements `std::error::Error` via `thiserror`.
pub enum BunsenError {
    /// Disk or backing store failure; fatal to the current call.
    #[error("store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// Compare-and-set on a branch ref lost against another writer.
    #[error("ref `{branch}` moved: expected {expected}, found {found}")]
    RefConflict {
        branch: String,
        expected: String,
        found: String,
    },

    /// Parser returned an incomplete testrun without flagging `problems`.
    #[error("parse rejected: {0}")]
    ParseRejected(String),

    /// Canonical serialization caught a type or shape error.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// An id prefix resolves to more than one stored testrun.
    #[error("`{0}` matches multiple testruns: {1:?}")]
    AmbiguousId(String, Vec<String>),

    /// A script name resolves to more than one plug-in directory.
    #[error("script `{0}` is ambiguous across {1:?}")]
    AmbiguousScript(String, Vec<String>),

    /// Id, month, project, path, or branch absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer holds the repository lock (non-blocking mode).
    #[error("write lock is held by another process: {0}")]
    LockHeld(String),

    /// Required configuration missing or malformed.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// The testlogs ref advanced but a later view commit failed. The
    /// repository heals on `repair` or on re-ingest of the same bundle.
    #[error("ingest of {id} left views incomplete (missing {missing:?})")]
    IncompleteIngest { id: String, missing: Vec<String> },

    /// Invalid object hash formatting or value.
    #[error("the `{0}` is not a valid object hash")]
    InvalidHash(String),

    /// Malformed stored object (commit, tree, or object header).
    #[error("invalid stored object: {0}")]
    InvalidObject(String),

    /// Malformed cursor text.
    #[error("the `{0}` is not a valid cursor")]
    InvalidCursor(String),
}

impl BunsenError {
    /// Stable kind tag for logs and wire surfaces.
    pub fn kind(&self) -> &'static str {
        match self {
            BunsenError::StoreIo(_) => "StoreIO",
            BunsenError::RefConflict { .. } => "RefConflict",
            BunsenError::ParseRejected(_) => "ParseRejected",
            BunsenError::ValidationFailed(_) => "ValidationFailed",
            BunsenError::AmbiguousId(..) => "AmbiguousId",
            BunsenError::AmbiguousScript(..) => "AmbiguousScript",
            BunsenError::NotFound(_) => "NotFound",
            BunsenError::LockHeld(_) => "LockHeld",
            BunsenError::BadConfig(_) => "BadConfig",
            BunsenError::IncompleteIngest { .. } => "IncompleteIngest",
            BunsenError::InvalidHash(_) => "InvalidHash",
            BunsenError::InvalidObject(_) => "InvalidObject",
            BunsenError::InvalidCursor(_) => "InvalidCursor",
        }
    }

    /// CLI exit code: 0 ok, 1 generic, 2 invalid input, 3 store error or
    /// ref conflict after retries, 4 ambiguous id/script.
    pub fn exit_code(&self) -> i32 {
        match self {
            BunsenError::ParseRejected(_)
            | BunsenError::ValidationFailed(_)
            | BunsenError::BadConfig(_)
            | BunsenError::InvalidHash(_)
            | BunsenError::InvalidCursor(_) => 2,
            BunsenError::StoreIo(_)
            | BunsenError::RefConflict { .. }
            | BunsenError::IncompleteIngest { .. } => 3,
            BunsenError::AmbiguousId(..) | BunsenError::AmbiguousScript(..) => 4,
            _ => 1,
        }
    }
}
