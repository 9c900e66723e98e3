//! Test declarations and their selection.
//!
//! A declaration is a JSON document stored as `{tests_dir}/{suite}/test_NAME.cfg`
//! and deserialised directly into [`TestDeclaration`]. Tests are selected
//! either by tag intersection over the discovered files or by explicit
//! `{"NAME": {...}}` blobs passed on the command line.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_yaml::Mapping;
use thiserror::Error;
use tracing::debug;

use crate::workspace::files::{self, FileError};

const FILE_PREFIX: &str = "test_";
const FILE_EXTENSION: &str = "cfg";

/// Errors raised while loading test declarations.
#[derive(Debug, Error)]
pub enum DeclarationError {
    /// Raised when the tests directory cannot be listed.
    #[error("failed to list {path}: {message}")]
    Scan {
        /// Directory being listed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a declaration file cannot be read.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when a declaration does not match the expected schema.
    #[error("invalid declaration for test '{name}': {message}")]
    Invalid {
        /// Test whose declaration is invalid.
        name: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when a selector is not a single-key JSON object.
    #[error("invalid test selector '{selector}': {message}")]
    Selector {
        /// Selector text as given.
        selector: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when two declarations share a name.
    #[error("test '{0}' is declared more than once")]
    Duplicate(String),
}

/// Variables merged into an extra file for the duration of one test.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct VarsOverride {
    /// File path relative to the playbook directory. Absolute paths and
    /// `..` components are rejected by [`TestDeclaration::validate`].
    pub path: Utf8PathBuf,
    /// Top-level keys merged into the file.
    #[serde(default)]
    pub params: Mapping,
}

/// Client requirements of one test.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ClientSpec {
    /// Number of client hosts.
    #[serde(default)]
    pub count: usize,
    /// Flavor the clients need; `None` accepts any.
    #[serde(default)]
    pub flavor: Option<String>,
}

/// Server requirements of one test.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServerSpec {
    /// Hosts per server sub-group.
    #[serde(default)]
    pub count_per_group: Vec<usize>,
    /// Flavor the servers need; `None` accepts any.
    #[serde(default)]
    pub flavor: Option<String>,
}

/// Environment a test runs in.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Environment {
    /// Client requirements.
    #[serde(default)]
    pub clients: ClientSpec,
    /// Server requirements.
    #[serde(default)]
    pub servers: ServerSpec,
    /// Whether the pool may be deleted after the run. `None` defers to the
    /// harness default.
    #[serde(default, rename = "delete_nodes")]
    pub delete_after: Option<bool>,
}

impl Environment {
    /// Sum of the per-group server counts.
    #[must_use]
    pub fn server_total(&self) -> usize {
        self.servers.count_per_group.iter().sum()
    }
}

/// One declared test.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TestDeclaration {
    /// Test name, taken from the file name or the selector key.
    #[serde(skip)]
    pub name: String,
    /// Tags used for selection.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Playbook run as the test body.
    pub playbook: String,
    /// Variables written to `group_vars/clients-NAME.yml`.
    #[serde(default)]
    pub params: Mapping,
    /// Extra variable files overridden while the test runs.
    #[serde(default, rename = "params_list")]
    pub extra_vars: Vec<VarsOverride>,
    /// Hosts the test needs.
    #[serde(rename = "test_env_cfg")]
    pub environment: Environment,
}

impl TestDeclaration {
    /// Decodes a declaration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::Invalid`] when the document does not match
    /// the schema.
    pub fn from_json(name: &str, text: &str) -> Result<Self, DeclarationError> {
        let mut declaration: Self =
            serde_json::from_str(text).map_err(|err| DeclarationError::Invalid {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        declaration.name = name.to_owned();
        Ok(declaration)
    }

    /// Checks that the name and extra variable paths are safe to use inside
    /// the playbook directory.
    ///
    /// Names become file names and inventory group names, so only ASCII
    /// alphanumerics, `_`, `.` and `-` are accepted. Extra variable paths
    /// must stay below the playbook directory.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::Invalid`] describing the first offending
    /// value.
    pub fn validate(&self) -> Result<(), DeclarationError> {
        let invalid = |message: String| DeclarationError::Invalid {
            name: self.name.clone(),
            message,
        };
        let well_formed = !self.name.is_empty()
            && !self.name.starts_with('.')
            && self.name.chars().all(is_name_char);
        if !well_formed {
            return Err(invalid(String::from(
                "names use ASCII letters, digits, '_', '.' or '-' and must not start with '.'",
            )));
        }
        for extra in &self.extra_vars {
            let escapes = extra.path.components().any(|component| {
                !matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir)
            });
            if escapes || extra.path.as_str().is_empty() {
                return Err(invalid(format!(
                    "params_list path '{}' must be relative to the playbook directory",
                    extra.path
                )));
            }
        }
        Ok(())
    }

    /// Returns `true` when the test carries any of `tags`.
    #[must_use]
    pub fn matches_any(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }

    /// Delete preference with the harness default applied.
    #[must_use]
    pub fn delete_after(&self, default: bool) -> bool {
        self.environment.delete_after.unwrap_or(default)
    }
}

/// Selected tests keyed, and therefore run, by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeclarationSet {
    tests: BTreeMap<String, TestDeclaration>,
}

impl DeclarationSet {
    /// Builds a set, rejecting unsafe and duplicate names.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::Invalid`] when a declaration fails
    /// [`TestDeclaration::validate`] and [`DeclarationError::Duplicate`] when
    /// two declarations share a name.
    pub fn from_declarations(
        declarations: impl IntoIterator<Item = TestDeclaration>,
    ) -> Result<Self, DeclarationError> {
        let mut tests = BTreeMap::new();
        for declaration in declarations {
            declaration.validate()?;
            let name = declaration.name.clone();
            if tests.insert(name.clone(), declaration).is_some() {
                return Err(DeclarationError::Duplicate(name));
            }
        }
        Ok(Self { tests })
    }

    /// Scans `tests_dir/*/test_NAME.cfg` and keeps tests carrying any of
    /// `tags`.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError`] when the directory cannot be listed or a
    /// declaration fails to load.
    pub fn discover(tests_dir: &Utf8Path, tags: &[String]) -> Result<Self, DeclarationError> {
        let mut selected = Vec::new();
        for suite in list_dir(tests_dir)? {
            if !suite.is_dir() {
                continue;
            }
            for file in list_dir(&suite)? {
                let Some(name) = test_name(&file) else {
                    continue;
                };
                let declaration = TestDeclaration::from_json(name, &files::read_required(&file)?)?;
                if declaration.matches_any(tags) {
                    debug!(test = name, path = %file, "selected by tag");
                    selected.push(declaration);
                }
            }
        }
        Self::from_declarations(selected)
    }

    /// Parses explicit `{"NAME": {...}}` selectors.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::Selector`] for blobs that are not a
    /// single-key object, and [`DeclarationError::Invalid`] for bodies that do
    /// not match the schema.
    pub fn from_selectors(selectors: &[String]) -> Result<Self, DeclarationError> {
        let mut declarations = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let blob: BTreeMap<String, serde_json::Value> = serde_json::from_str(selector)
                .map_err(|err| DeclarationError::Selector {
                    selector: selector.clone(),
                    message: err.to_string(),
                })?;
            if blob.is_empty() {
                return Err(DeclarationError::Selector {
                    selector: selector.clone(),
                    message: String::from("selector names no test"),
                });
            }
            for (name, body) in blob {
                let mut declaration: TestDeclaration =
                    serde_json::from_value(body).map_err(|err| DeclarationError::Invalid {
                        name: name.clone(),
                        message: err.to_string(),
                    })?;
                declaration.name = name;
                declarations.push(declaration);
            }
        }
        Self::from_declarations(declarations)
    }

    /// Explicit selectors win over tag discovery.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`DeclarationSet::from_selectors`] and
    /// [`DeclarationSet::discover`].
    pub fn select(
        tests_dir: &Utf8Path,
        tags: &[String],
        selectors: &[String],
    ) -> Result<Self, DeclarationError> {
        if selectors.is_empty() {
            Self::discover(tests_dir, tags)
        } else {
            Self::from_selectors(selectors)
        }
    }

    /// Number of selected tests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns `true` when nothing was selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Looks a test up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TestDeclaration> {
        self.tests.get(name)
    }

    /// Tests in name order.
    pub fn iter(&self) -> impl Iterator<Item = &TestDeclaration> {
        self.tests.values()
    }

    /// Conjunction of every test's delete preference.
    #[must_use]
    pub fn delete_on_exit(&self, default: bool) -> bool {
        self.iter().all(|test| test.delete_after(default))
    }
}

fn list_dir(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DeclarationError> {
    let scan_error = |err: std::io::Error| DeclarationError::Scan {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let mut entries = path
        .read_dir_utf8()
        .map_err(scan_error)?
        .map(|entry| entry.map(|entry| entry.into_path()).map_err(scan_error))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

const fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-')
}

fn test_name(path: &Utf8Path) -> Option<&str> {
    if path.extension() != Some(FILE_EXTENSION) {
        return None;
    }
    path.file_stem()?
        .strip_prefix(FILE_PREFIX)
        .filter(|name| !name.is_empty())
}
