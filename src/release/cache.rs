// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk release cache.
//!
//! ```text
//! <root>/
//!   b6780/              extracted tree for tag b6780
//!   b6780.lock          fs2 lock guarding download+extract of that entry
//!   url-3f9a0c1d2e4b5a67/   extracted tree for a direct archive URL
//! ```
//!
//! The root is injected through [`ReleasesDir`] rather than read from a
//! global, so tests point it at a temporary directory. Entries are never
//! evicted. An entry only appears once its extraction has finished: work
//! happens in a hidden staging directory that is renamed into place.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::config::{EnvSnapshot, ENV_RELEASES_DIR};
use crate::error::{Result, WardenError};

/// How long to wait for another process to finish populating an entry.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Hex digits of the URL hash kept in the entry name.
const URL_KEY_LEN: usize = 16;

// =============================================================================
// RELEASES DIRECTORY
// =============================================================================

/// Root of the release cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasesDir {
    root: PathBuf,
}

impl ReleasesDir {
    /// Cache rooted at an explicit path.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `LLAMA_WARDEN_RELEASES_DIR` if set, else the per-user data directory.
    pub fn from_env(env: &EnvSnapshot) -> Result<Self> {
        match env.get(ENV_RELEASES_DIR) {
            Some(dir) => Ok(Self::at(dir)),
            None => Self::default_location(),
        }
    }

    /// `<data dir>/llama-warden/releases`.
    pub fn default_location() -> Result<Self> {
        let data = dirs::data_dir().ok_or_else(|| {
            WardenError::config(format!(
                "could not determine a data directory; set {ENV_RELEASES_DIR}"
            ))
        })?;
        Ok(Self::at(data.join("llama-warden").join("releases")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry for a release tag.
    pub fn entry_for_tag(&self, tag: &str) -> CacheEntry {
        self.entry(sanitize_key(tag))
    }

    /// Entry for a direct archive URL.
    pub fn entry_for_url(&self, url: &str) -> CacheEntry {
        self.entry(url_key(url))
    }

    fn entry(&self, key: String) -> CacheEntry {
        CacheEntry {
            path: self.root.join(&key),
            root: self.root.clone(),
            key,
        }
    }

    /// Populated entries, sorted by name. A missing root is an empty cache.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::io(format!("reading {}", self.root.display()), e)),
        };

        let mut entries = Vec::new();
        for item in read {
            let item = item.map_err(|e| WardenError::io(format!("reading {}", self.root.display()), e))?;
            let path = item.path();
            let hidden = item.file_name().to_string_lossy().starts_with('.');
            if path.is_dir() && !hidden {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// Tags are used as directory names; anything unusual becomes `_`.
fn sanitize_key(tag: &str) -> String {
    let key: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match key.trim_start_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn url_key(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("url-{}", &digest[..URL_KEY_LEN])
}

// =============================================================================
// CACHE ENTRY
// =============================================================================

/// One cached release directory.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    path: PathBuf,
    root: PathBuf,
}

impl CacheEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exists and has at least one child.
    pub fn is_populated(&self) -> bool {
        fs::read_dir(&self.path)
            .map(|mut it| it.next().is_some())
            .unwrap_or(false)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(format!("{}.lock", self.key))
    }

    /// Take the exclusive cross-process lock for this entry.
    ///
    /// Retries until `timeout` elapses; the lock is released when the
    /// returned guard is dropped.
    pub fn lock(&self, timeout: Duration) -> Result<CacheLock> {
        fs::create_dir_all(&self.root)
            .map_err(|e| WardenError::io(format!("creating {}", self.root.display()), e))?;

        let path = self.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| WardenError::io(format!("opening lock file {}", path.display()), e))?;

        let start = Instant::now();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(CacheLock { file, path }),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if start.elapsed() >= timeout {
                        return Err(WardenError::io(
                            format!(
                                "timed out after {:?} waiting for {}; another process may be downloading this release",
                                timeout,
                                path.display()
                            ),
                            e,
                        ));
                    }
                    if !announced {
                        tracing::info!(lock = %path.display(), "Waiting for another process to finish this release");
                        announced = true;
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(WardenError::io(format!("locking {}", path.display()), e));
                }
            }
        }
    }

    /// Hidden staging directory next to the entry, removed on drop unless installed.
    pub fn staging_dir(&self) -> Result<TempDir> {
        fs::create_dir_all(&self.root)
            .map_err(|e| WardenError::io(format!("creating {}", self.root.display()), e))?;
        tempfile::Builder::new()
            .prefix(&format!(".{}.", self.key))
            .suffix(".partial")
            .tempdir_in(&self.root)
            .map_err(|e| WardenError::io(format!("creating staging dir in {}", self.root.display()), e))
    }

    /// Move a fully extracted `staged` tree into place, replacing any old entry.
    ///
    /// Callers hold [`CacheLock`] for this entry.
    pub fn install(&self, staged: &Path) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path)
                .map_err(|e| WardenError::io(format!("removing stale {}", self.path.display()), e))?;
        }
        fs::rename(staged, &self.path).map_err(|e| {
            WardenError::io(
                format!("moving {} to {}", staged.display(), self.path.display()),
                e,
            )
        })
    }
}

/// Held exclusive lock on a cache entry.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(lock = %self.path.display(), error = %e, "Failed to release cache lock");
        }
    }
}
