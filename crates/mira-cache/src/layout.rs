//! On-disk layout of the cache directory.
//!
//! The cache root holds one subdirectory per account; each account directory
//! contains the `directorytree` snapshot and a flat `files/` directory with
//! the materialized file contents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Per-account cache directory: snapshot file plus content directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(base: PathBuf, account: &str) -> CacheLayout {
        CacheLayout { root: base.join(account) }
    }

    /// Create the account directory and the content directory if missing.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.files_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the serialized directory tree.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("directorytree")
    }

    /// Flat directory holding the cached file contents.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }
}

/// Base cache directory: $XDG_CACHE_HOME/mirafs or ~/.cache/mirafs.
pub fn cache_base_dir() -> Result<PathBuf> {
    if let Some(cache_home) = xdg_absolute_dir("XDG_CACHE_HOME") {
        return Ok(cache_home.join("mirafs"));
    }

    if let Ok(home) = std::env::var("HOME") {
        let home_path = PathBuf::from(home);
        if home_path.is_absolute() {
            return Ok(home_path.join(".cache").join("mirafs"));
        }
    }

    Err(anyhow!(
        "Could not determine cache directory. Set XDG_CACHE_HOME or HOME to an absolute path."
    ))
}

/// Base cache directory with an explicit override.
pub fn cache_base_dir_custom(custom_dir: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = custom_dir {
        Ok(PathBuf::from(dir))
    } else {
        cache_base_dir()
    }
}

fn xdg_absolute_dir(var_name: &str) -> Option<PathBuf> {
    let raw = std::env::var(var_name).ok()?;
    parse_absolute_dir(&raw)
}

fn parse_absolute_dir(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let path = PathBuf::from(trimmed);
    path.is_absolute().then_some(path)
}
