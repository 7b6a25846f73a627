//! Utility functions for compsync.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use url::Url;

use crate::errors::SyncError;

pub use crate::utils::raw::{is_directory, is_file, path_exists};

pub(crate) mod json;
pub mod raw;

pub(crate) fn ensure_dir_exists(name: &'static str, path: &Path) -> Result<bool> {
    raw::ensure_dir_exists(path).with_context(|| {
        format!("could not create {} directory: '{}'", name, path.display())
    })
}

/// Writes through a temp file in the destination directory followed by an
/// atomic rename, so readers never observe a partially written file.
pub(crate) fn write_file_atomic(name: &'static str, path: &Path, contents: &[u8]) -> Result<()> {
    write_file_atomic_inner(path, contents)
        .with_context(|| SyncError::FileWriteFailure {
            path: PathBuf::from(path),
        })
        .with_context(|| format!("could not write {name} file"))
}

fn write_file_atomic_inner(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn copy_file(name: &'static str, src: &Path, dest: &Path) -> Result<u64> {
    fs::copy(src, dest)
        .with_context(|| SyncError::FileWriteFailure {
            path: PathBuf::from(dest),
        })
        .with_context(|| {
            format!(
                "could not copy {} file from '{}' to '{}'",
                name,
                src.display(),
                dest.display()
            )
        })
}

pub(crate) fn rename_file(name: &'static str, src: &Path, dest: &Path) -> Result<()> {
    fs::rename(src, dest)
        .with_context(|| SyncError::FileWriteFailure {
            path: PathBuf::from(dest),
        })
        .with_context(|| {
            format!(
                "could not rename {} file from '{}' to '{}'",
                name,
                src.display(),
                dest.display()
            )
        })
}

pub(crate) fn remove_file(name: &'static str, path: &Path) -> Result<()> {
    raw::remove_file(path)
        .with_context(|| format!("could not remove {} file: '{}'", name, path.display()))
}

pub(crate) fn remove_dir_all(name: &'static str, path: &Path) -> Result<()> {
    raw::remove_dir_all(path)
        .with_context(|| format!("could not remove {} directory: '{}'", name, path.display()))
}

pub(crate) fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)
        .with_context(|| SyncError::FileReadFailure {
            path: PathBuf::from(path),
        })?
        .len())
}

pub(crate) fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).with_context(|| format!("failed to parse url: {url}"))
}
