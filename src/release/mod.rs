// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release resolution for llama-server.
//!
//! Turns a [`ReleaseConfig`] (local directory, archive URL, or release tag)
//! into a [`ResolvedBinaryDir`] on disk.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌────────────────┐     ┌────────────────┐
//! │ ReleaseManager │────▶│ ReleaseFetcher │────▶│ ReleaseIndex   │
//! │ (mode dispatch)│     │ (tag → cache)  │     │ (GitHub API)   │
//! └───────┬────────┘     └───────┬────────┘     └────────────────┘
//!         │                      │
//!         ▼                      ▼
//! ┌────────────────┐     ┌────────────────┐     ┌────────────────┐
//! │ ReleasesDir    │◀────│ AssetSelector  │     │ Archive        │
//! │ (cache + lock) │     │ (host match)   │     │ Downloader     │
//! └────────────────┘     └────────────────┘     └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use llama_warden::release::{ReleaseConfig, ReleaseManager, ReleasesDir};
//!
//! # fn example() -> llama_warden::Result<()> {
//! let manager = ReleaseManager::new(ReleasesDir::default_location()?)?;
//! let resolved = manager.resolve(&ReleaseConfig::tag("latest"))?;
//! println!("llama-server lives in {}", resolved.dir().display());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod download;
pub mod fetcher;
pub mod index;
pub mod manager;
pub mod selector;
pub mod types;

pub use archive::ArchiveFormat;
pub use cache::{CacheEntry, CacheLock, ReleasesDir};
pub use download::{ArchiveDownloader, HttpDownloader};
pub use fetcher::ReleaseFetcher;
pub use index::{GithubReleaseIndex, ReleaseIndex, LLAMA_CPP_RELEASES_API};
pub use manager::ReleaseManager;
pub use selector::AssetSelector;
pub use types::{
    ReleaseAsset, ReleaseConfig, ReleaseSettings, ResolvedBinaryDir, TagSelection,
    DEFAULT_EXCLUDE_PATTERNS, DEFAULT_PRIORITY_PATTERNS, LATEST_TAG,
};
