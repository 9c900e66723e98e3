//! Capability-scoped file helpers shared by the workspace writers.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Raised when a workspace file cannot be read or written.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to access {path}: {message}")]
pub struct FileError {
    /// Path that could not be accessed.
    pub path: Utf8PathBuf,
    /// Human-readable error message.
    pub message: String,
}

impl FileError {
    fn new(path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| FileError {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    Ok((parent, file_name))
}

/// Reads `path`, returning `None` when the file or its directory is absent.
pub(crate) fn read_optional(path: &Utf8Path) -> Result<Option<String>, FileError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(FileError::new(parent, &err)),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FileError::new(path, &err)),
    }
}

/// Reads `path`, failing when it does not exist.
pub(crate) fn read_required(path: &Utf8Path) -> Result<String, FileError> {
    read_optional(path)?.ok_or_else(|| FileError {
        path: path.to_path_buf(),
        message: String::from("file not found"),
    })
}

/// Writes `contents` to `path`, creating parent directories as needed.
pub(crate) fn write(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| FileError::new(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| FileError::new(parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| FileError::new(path, &err))
}

/// Removes `path`; a missing file is not an error.
pub(crate) fn remove(path: &Utf8Path) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FileError::new(parent, &err)),
    };
    match dir.remove_file(file_name) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(FileError::new(path, &err)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()))
    }

    #[test]
    fn write_creates_missing_directories() {
        let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let path = utf8_root(&temp).join("group_vars/nested/clients.yml");

        write(&path, "---\nrepo_dir: /srv\n").unwrap_or_else(|err| panic!("write: {err}"));

        assert_eq!(
            read_required(&path).unwrap_or_else(|err| panic!("read: {err}")),
            "---\nrepo_dir: /srv\n"
        );
    }

    #[test]
    fn missing_files_read_as_none_and_remove_cleanly() {
        let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let path = utf8_root(&temp).join("absent/test.yml");

        assert_eq!(read_optional(&path), Ok(None));
        assert_eq!(remove(&path), Ok(()));
        assert!(read_required(&path).is_err());
    }
}
