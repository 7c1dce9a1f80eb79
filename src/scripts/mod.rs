//! The commit-module registry.
//!
//! A commit module turns an uploaded file map into a parsed testrun plus
//! the (possibly renamed or filtered) files to store. Modules are
//! capabilities keyed by name: built-ins register themselves here, and
//! `scripts*/` directories at the repository root are scanned at open time
//! so a repository can pin which module names are visible to it. A name
//! found in more than one scripts directory is ambiguous and refuses to
//! resolve.

pub mod dejagnu;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::errors::BunsenError;
use crate::model::Testrun;

/// Uploaded (or stored) file name → bytes.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Result of a commit module's parse step.
pub struct ParsedBundle {
    pub testrun: Testrun,
    pub files: FileMap,
    /// Optional testruns-branch suffix chosen by the module.
    pub extra_label: Option<String>,
}

/// A parse-and-commit capability.
pub trait CommitModule {
    /// The name config refers to via `[bunsen-upload] commit_module`.
    fn name(&self) -> &'static str;

    /// Parse a bundle. May rename or drop files. A module that cannot
    /// produce the required summary fields must set `problems` instead of
    /// failing, so broken uploads can still be archived.
    fn parse(&self, files: FileMap) -> Result<ParsedBundle, BunsenError>;
}

/// The registry of built-in modules plus the repository's scripts scan.
pub struct ScriptRegistry {
    modules: Vec<Box<dyn CommitModule>>,
    /// Script name → directories it was found in.
    discovered: BTreeMap<String, Vec<String>>,
}

/// Name of the module used when config names none.
pub const DEFAULT_MODULE: &str = "dejagnu";

impl ScriptRegistry {
    /// Built-ins plus a scan of `scripts*/` directories under `root`.
    pub fn discover(root: &Path) -> Result<ScriptRegistry, BunsenError> {
        let mut registry = ScriptRegistry {
            modules: vec![Box::new(dejagnu::DejagnuModule)],
            discovered: BTreeMap::new(),
        };
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if !dir_name.starts_with("scripts") || !entry.path().is_dir() {
                continue;
            }
            for script in fs::read_dir(entry.path())? {
                let script = script?;
                let path = script.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                debug!(dir = %dir_name, name = %stem, "discovered script");
                registry
                    .discovered
                    .entry(stem.to_string())
                    .or_default()
                    .push(dir_name.clone());
            }
        }
        Ok(registry)
    }

    /// Registry with built-ins only (no scripts scan); used by tests and
    /// by repositories without scripts directories.
    pub fn builtin() -> ScriptRegistry {
        ScriptRegistry {
            modules: vec![Box::new(dejagnu::DejagnuModule)],
            discovered: BTreeMap::new(),
        }
    }

    /// Resolve a module by name; `None` selects the default. Fails
    /// `AmbiguousScript` when the scripts scan found the name in more than
    /// one directory, and `BadConfig` when config names a module that does
    /// not exist.
    pub fn resolve(&self, name: Option<&str>) -> Result<&dyn CommitModule, BunsenError> {
        let name = name.unwrap_or(DEFAULT_MODULE);
        if let Some(dirs) = self.discovered.get(name) {
            if dirs.len() > 1 {
                return Err(BunsenError::AmbiguousScript(
                    name.to_string(),
                    dirs.clone(),
                ));
            }
        }
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.as_ref())
            .ok_or_else(|| BunsenError::BadConfig(format!("unknown commit module `{name}`")))
    }
}
