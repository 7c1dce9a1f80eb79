//! Repository configuration.
//!
//! `<repo>/config` is an INI file in the git-config dialect:
//!
//! ```ini
//! [core]
//!     project = gdb
//! [project "gdb"]
//!     source_repo = /srv/git/binutils-gdb.git
//!     gitweb_url = https://sourceware.org/git/?p=binutils-gdb.git
//! [bunsen-upload]
//!     manifest = *.sum, *.log, README.txt
//!     commit_module = dejagnu
//! ```
//!
//! The parse is hand-written like the other on-disk formats this crate
//! owns; unknown sections and keys are preserved-by-ignoring so older
//! engines keep opening newer repositories.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::errors::BunsenError;

/// File name of the configuration inside a repository.
pub const CONFIG_FILE: &str = "config";

/// Per-project settings from `[project "<name>"]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectConfig {
    /// Checkout or bare repository of the tested project, used for the
    /// source-commit timestamp fallback.
    pub source_repo: Option<PathBuf>,
    pub gitweb_url: Option<String>,
}

/// Upload settings from `[bunsen-upload]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadConfig {
    /// Comma-separated glob list of file names accepted into a bundle.
    /// Empty means accept everything.
    pub manifest: Vec<String>,
    /// Parser module name; unset falls back to the built-in default.
    pub commit_module: Option<String>,
    /// Configuration fields joined into the testruns-branch extra label
    /// when the parser supplies none.
    pub extra_label_fields: Vec<String>,
}

/// Parsed repository configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoConfig {
    /// `[core] project`, the default project for submissions that name
    /// none.
    pub default_project: Option<String>,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub upload: UploadConfig,
}

impl RepoConfig {
    /// Load and parse `<repo>/config`. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<RepoConfig, BunsenError> {
        match fs::read_to_string(path) {
            Ok(text) => RepoConfig::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RepoConfig::default()),
            Err(e) => Err(BunsenError::StoreIo(e)),
        }
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<RepoConfig, BunsenError> {
        let mut config = RepoConfig::default();
        let mut section = Section::None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let header = header
                    .strip_suffix(']')
                    .ok_or_else(|| bad_line(lineno, raw, "unterminated section header"))?
                    .trim();
                section = parse_section(header)
                    .ok_or_else(|| bad_line(lineno, raw, "malformed section header"))?;
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| bad_line(lineno, raw, "expected `key = value`"))?;
            let key = key.trim();
            let value = value.trim().to_string();
            match &section {
                Section::None => {
                    return Err(bad_line(lineno, raw, "key outside any section"));
                }
                Section::Core => {
                    if key == "project" {
                        config.default_project = Some(value);
                    }
                }
                Section::Project(name) => {
                    let project = config.projects.entry(name.clone()).or_default();
                    match key {
                        "source_repo" => project.source_repo = Some(PathBuf::from(value)),
                        "gitweb_url" => project.gitweb_url = Some(value),
                        _ => {}
                    }
                }
                Section::Upload => match key {
                    "manifest" => {
                        config.upload.manifest = split_list(&value);
                    }
                    "commit_module" => config.upload.commit_module = Some(value),
                    "extra_label_fields" => {
                        config.upload.extra_label_fields = split_list(&value);
                    }
                    _ => {}
                },
                Section::Other => {}
            }
        }
        Ok(config)
    }

    /// Settings for one project, when configured.
    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.get(name)
    }

    /// Compile the manifest glob list. `None` means no manifest is
    /// configured and every file is accepted.
    pub fn manifest_globs(&self) -> Result<Option<GlobSet>, BunsenError> {
        if self.upload.manifest.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.upload.manifest {
            let glob = Glob::new(pattern).map_err(|e| {
                BunsenError::BadConfig(format!("manifest glob `{pattern}`: {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| BunsenError::BadConfig(format!("manifest globs: {e}")))?;
        Ok(Some(set))
    }
}

enum Section {
    None,
    Core,
    Project(String),
    Upload,
    Other,
}

fn parse_section(header: &str) -> Option<Section> {
    if let Some(rest) = header.strip_prefix("project ") {
        let name = rest.trim().strip_prefix('"')?.strip_suffix('"')?;
        if name.is_empty() {
            return None;
        }
        return Some(Section::Project(name.to_string()));
    }
    match header {
        "core" => Some(Section::Core),
        "bunsen-upload" => Some(Section::Upload),
        _ if header.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') => Some(Section::Other),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn bad_line(lineno: usize, line: &str, what: &str) -> BunsenError {
    BunsenError::BadConfig(format!("line {}: {what}: `{line}`", lineno + 1))
}
