// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release Manager: [`ReleaseConfig`] → [`ResolvedBinaryDir`].
//!
//! Exactly one mode runs per call. `LocalDir` never touches the network,
//! `ArchiveUrl` is cached under a hash of the URL, and `Tag` is handed to the
//! [`ReleaseFetcher`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::platform::HostPlatform;

use super::cache::ReleasesDir;
use super::download::{ArchiveDownloader, HttpDownloader};
use super::fetcher::ReleaseFetcher;
use super::index::{GithubReleaseIndex, ReleaseIndex};
use super::types::{tag_from_download_url, validate_archive_url, ReleaseConfig, ResolvedBinaryDir};

/// Resolves release configurations to directories holding `llama-server`.
#[derive(Debug, Clone)]
pub struct ReleaseManager {
    fetcher: ReleaseFetcher,
}

impl ReleaseManager {
    /// Manager backed by the llama.cpp GitHub releases.
    pub fn new(releases: ReleasesDir) -> Result<Self> {
        Ok(Self::with_sources(
            releases,
            Arc::new(GithubReleaseIndex::llama_cpp()?),
            Arc::new(HttpDownloader::new()),
        ))
    }

    /// Manager with caller-supplied index and downloader.
    pub fn with_sources(
        releases: ReleasesDir,
        index: Arc<dyn ReleaseIndex>,
        downloader: Arc<dyn ArchiveDownloader>,
    ) -> Self {
        Self {
            fetcher: ReleaseFetcher::new(index, downloader, releases),
        }
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.fetcher = self.fetcher.with_platform(platform);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.fetcher = self.fetcher.with_lock_timeout(timeout);
        self
    }

    pub fn fetcher(&self) -> &ReleaseFetcher {
        &self.fetcher
    }

    pub fn releases(&self) -> &ReleasesDir {
        self.fetcher.releases()
    }

    /// Resolve `config`, reusing cached downloads.
    pub fn resolve(&self, config: &ReleaseConfig) -> Result<ResolvedBinaryDir> {
        self.resolve_with(config, false)
    }

    /// Resolve `config`; with `force`, cached downloads are replaced.
    ///
    /// `force` has no effect on `LocalDir`.
    pub fn resolve_with(&self, config: &ReleaseConfig, force: bool) -> Result<ResolvedBinaryDir> {
        tracing::debug!(config = %config.describe(), force, "Resolving release");
        let executable = self.fetcher.platform().executable_name();

        match config {
            ReleaseConfig::LocalDir(dir) => {
                if !dir.is_dir() {
                    return Err(WardenError::BinaryNotFound {
                        binary: executable,
                        searched: vec![dir.clone()],
                    });
                }
                locate_binary(dir, &executable)
            }
            ReleaseConfig::ArchiveUrl(url) => {
                validate_archive_url(url)?;
                let entry = self.releases().entry_for_url(url);
                if let Some(tag) = tag_from_download_url(url) {
                    tracing::info!(tag, url = %url, "Using release archive");
                }

                if !force && entry.is_populated() {
                    if let Ok(resolved) = locate_binary(entry.path(), &executable) {
                        tracing::info!(dir = %resolved, "Using cached archive");
                        return Ok(resolved);
                    }
                }

                let name = url.rsplit('/').next().unwrap_or(url.as_str());
                let replace = force || entry.is_populated();
                self.fetcher.install_archive(&entry, url, name, replace)?;
                locate_binary(entry.path(), &executable)
            }
            ReleaseConfig::Tag(selection) => self.fetcher.fetch(selection, force),
        }
    }
}

/// Find the directory under `root` that holds `executable`.
///
/// Checks, in order: `root`, `root/build/bin`, and the same two locations
/// inside `root`'s only subdirectory when it has exactly one.
pub(crate) fn locate_binary(root: &Path, executable: &str) -> Result<ResolvedBinaryDir> {
    let searched = candidate_dirs(root);
    for dir in &searched {
        if dir.join(executable).is_file() {
            let dir = fs::canonicalize(dir)
                .map_err(|e| WardenError::io(format!("resolving {}", dir.display()), e))?;
            return Ok(ResolvedBinaryDir::new(dir, executable));
        }
    }
    Err(WardenError::BinaryNotFound {
        binary: executable.to_string(),
        searched,
    })
}

fn candidate_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![root.to_path_buf(), root.join("build").join("bin")];

    let subdirs: Vec<PathBuf> = fs::read_dir(root)
        .map(|read| {
            read.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();

    if let [only] = subdirs.as_slice() {
        if only.file_name().map_or(true, |n| n != "build") {
            dirs.push(only.clone());
            dirs.push(only.join("build").join("bin"));
        }
    }
    dirs
}
