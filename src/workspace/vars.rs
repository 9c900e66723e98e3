//! Group variable files: block-style YAML mappings with a document marker.

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::files::{self, FileError};

/// Errors raised while reading or writing variable files.
#[derive(Debug, Error)]
pub enum VarsError {
    /// Raised when the file cannot be accessed.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when existing content is not a YAML mapping.
    #[error("failed to parse variables in {path}: {message}")]
    Parse {
        /// File whose content failed to parse.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// Raised when a mapping cannot be serialised.
    #[error("failed to render variables for {path}: {message}")]
    Render {
        /// File the variables were destined for.
        path: Utf8PathBuf,
        /// Serialiser message.
        message: String,
    },
}

/// Reads the mapping stored at `path`; a missing or empty file is an empty
/// mapping.
///
/// # Errors
///
/// Returns [`VarsError`] when the file cannot be read or is not a mapping.
pub fn read_vars(path: &Utf8Path) -> Result<Mapping, VarsError> {
    let Some(contents) = files::read_optional(path)? else {
        return Ok(Mapping::new());
    };
    parse_vars(path, &contents)
}

fn parse_vars(path: &Utf8Path, contents: &str) -> Result<Mapping, VarsError> {
    let value: Value = serde_yaml::from_str(contents).map_err(|err| VarsError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(VarsError::Parse {
            path: path.to_path_buf(),
            message: String::from("top level value is not a mapping"),
        }),
    }
}

/// Renders a mapping the way it is written to disk.
///
/// # Errors
///
/// Returns [`VarsError::Render`] when serialisation fails.
pub fn render_vars(path: &Utf8Path, vars: &Mapping) -> Result<String, VarsError> {
    let body = serde_yaml::to_string(vars).map_err(|err| VarsError::Render {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(format!("---\n{body}"))
}

/// Replaces the content of `path` with `vars`.
///
/// # Errors
///
/// Returns [`VarsError`] when rendering or writing fails.
pub fn write_vars(path: &Utf8Path, vars: &Mapping) -> Result<(), VarsError> {
    let rendered = render_vars(path, vars)?;
    files::write(path, &rendered)?;
    debug!(%path, keys = vars.len(), "wrote variables");
    Ok(())
}

/// Merges `updates` over the existing top-level keys of `path` and writes
/// the result back.
///
/// # Errors
///
/// Returns [`VarsError`] when the file cannot be read, parsed, or written.
pub fn update_vars(path: &Utf8Path, updates: &Mapping) -> Result<Mapping, VarsError> {
    let mut merged = read_vars(path)?;
    for (key, value) in updates {
        merged.insert(key.clone(), value.clone());
    }
    write_vars(path, &merged)?;
    Ok(merged)
}

/// Raw content of a variable file captured before it is overwritten.
///
/// [`VarsSnapshot::restore`] puts the bytes back (or removes a file that did
/// not exist). Dropping an unrestored snapshot restores it as well and logs
/// any failure.
#[derive(Debug)]
pub struct VarsSnapshot {
    path: Utf8PathBuf,
    previous: Option<String>,
    restored: bool,
}

impl VarsSnapshot {
    /// Captures the current content of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VarsError::File`] when the file exists but cannot be read.
    pub fn capture(path: &Utf8Path) -> Result<Self, VarsError> {
        Ok(Self {
            path: path.to_path_buf(),
            previous: files::read_optional(path)?,
            restored: false,
        })
    }

    /// File guarded by this snapshot.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns `true` when the file existed at capture time.
    #[must_use]
    pub const fn existed(&self) -> bool {
        self.previous.is_some()
    }

    /// Writes the captured content back.
    ///
    /// # Errors
    ///
    /// Returns [`VarsError::File`] when the file cannot be written or removed.
    pub fn restore(mut self) -> Result<(), VarsError> {
        self.restored = true;
        self.put_back()
    }

    fn put_back(&self) -> Result<(), VarsError> {
        match &self.previous {
            Some(contents) => files::write(&self.path, contents)?,
            None => files::remove(&self.path)?,
        }
        debug!(path = %self.path, "restored variables");
        Ok(())
    }
}

impl Drop for VarsSnapshot {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = self.put_back() {
            warn!(path = %self.path, error = %err, "failed to restore variables");
        }
    }
}
