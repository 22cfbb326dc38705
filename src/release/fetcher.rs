// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release Fetcher: tag → cached, extracted release directory.
//!
//! ```text
//! tag ──latest?──▶ index.latest_tag()
//!  │
//!  ▼
//! cache entry populated? ──yes──▶ locate binary
//!  │ no (or force)
//!  ▼
//! index.list_assets() ─▶ selector ─▶ lock entry ─▶ download ─▶ extract ─▶ rename into place
//! ```
//!
//! Downloads are never retried here; a failure surfaces to the caller, who
//! may simply call again.

use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::error::{Result, WardenError};
use crate::platform::HostPlatform;

use super::archive::{self, ArchiveFormat};
use super::cache::{CacheEntry, ReleasesDir, DEFAULT_LOCK_TIMEOUT};
use super::download::ArchiveDownloader;
use super::index::ReleaseIndex;
use super::manager::locate_binary;
use super::selector::AssetSelector;
use super::types::{ReleaseAsset, ResolvedBinaryDir, TagSelection, LATEST_TAG};

/// Downloads and caches tagged releases.
#[derive(Clone)]
pub struct ReleaseFetcher {
    index: Arc<dyn ReleaseIndex>,
    downloader: Arc<dyn ArchiveDownloader>,
    releases: ReleasesDir,
    selector: AssetSelector,
    lock_timeout: Duration,
}

impl std::fmt::Debug for ReleaseFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseFetcher")
            .field("releases", &self.releases)
            .field("platform", &self.selector.platform())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl ReleaseFetcher {
    pub fn new(
        index: Arc<dyn ReleaseIndex>,
        downloader: Arc<dyn ArchiveDownloader>,
        releases: ReleasesDir,
    ) -> Self {
        Self {
            index,
            downloader,
            releases,
            selector: AssetSelector::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Select assets for `platform` instead of the running host.
    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.selector = AssetSelector::new(platform);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn releases(&self) -> &ReleasesDir {
        &self.releases
    }

    pub fn platform(&self) -> HostPlatform {
        self.selector.platform()
    }

    /// `"latest"` becomes the newest concrete tag; anything else is used verbatim.
    pub fn resolve_tag(&self, tag: &str) -> Result<String> {
        if tag.eq_ignore_ascii_case(LATEST_TAG) {
            let resolved = self.index.latest_tag()?;
            tracing::info!(tag = %resolved, "Resolved latest release");
            Ok(resolved)
        } else {
            Ok(tag.to_string())
        }
    }

    /// Archive assets of `tag`, in index order.
    ///
    /// # Errors
    ///
    /// [`WardenError::AssetNotFound`] when the release lists no archives.
    pub fn archive_assets(&self, tag: &str) -> Result<Vec<ReleaseAsset>> {
        let assets: Vec<ReleaseAsset> = self
            .index
            .list_assets(tag)?
            .into_iter()
            .filter(ReleaseAsset::is_archive)
            .collect();
        if assets.is_empty() {
            return Err(WardenError::AssetNotFound { tag: tag.to_string() });
        }
        Ok(assets)
    }

    /// The asset this host would download for `selection`, without downloading it.
    pub fn choose_asset(&self, tag: &str, selection: &TagSelection) -> Result<ReleaseAsset> {
        let assets = self.archive_assets(tag)?;
        self.selector
            .select(&assets, &selection.priority_patterns, &selection.exclude_patterns)
    }

    /// Resolve `selection` to an extracted release directory.
    ///
    /// With `force`, an existing cache entry is replaced.
    pub fn fetch(&self, selection: &TagSelection, force: bool) -> Result<ResolvedBinaryDir> {
        let tag = self.resolve_tag(&selection.tag)?;
        let entry = self.releases.entry_for_tag(&tag);
        let executable = self.selector.platform().executable_name();

        if !force && entry.is_populated() {
            match locate_binary(entry.path(), &executable) {
                Ok(resolved) => {
                    tracing::info!(tag = %tag, dir = %resolved, "Using cached release");
                    return Ok(resolved);
                }
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Cached release is unusable; downloading again");
                }
            }
        }

        let asset = self.choose_asset(&tag, selection)?;
        tracing::info!(tag = %tag, asset = %asset.name, "Selected release asset");

        // A cache entry without the binary is replaced, not reused.
        let replace = force || entry.is_populated();
        self.install_archive(&entry, &asset.download_url, &asset.name, replace)?;
        locate_binary(entry.path(), &executable)
    }

    /// Download `url` and extract it into `entry`.
    ///
    /// Runs under the entry's cross-process lock. If another process
    /// populated the entry while we waited, its result is kept unless
    /// `replace` is set.
    pub(crate) fn install_archive(
        &self,
        entry: &CacheEntry,
        url: &str,
        name_hint: &str,
        replace: bool,
    ) -> Result<()> {
        let _lock = entry.lock(self.lock_timeout)?;
        if !replace && entry.is_populated() {
            tracing::info!(entry = %entry.path().display(), "Release was cached by another process");
            return Ok(());
        }

        let staging = entry.staging_dir()?;
        let download = NamedTempFile::new_in(self.releases.root()).map_err(|e| {
            WardenError::io(format!("creating temporary file in {}", self.releases.root().display()), e)
        })?;

        let bytes = self.downloader.download(url, download.path())?;
        tracing::info!(url, bytes, "Downloaded archive");

        let format = ArchiveFormat::detect(download.path(), name_hint)?;
        archive::extract(download.path(), format, staging.path())?;
        drop(download);

        entry.install(staging.path())?;
        tracing::info!(entry = %entry.path().display(), "Release cached");
        Ok(())
    }
}
