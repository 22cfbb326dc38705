// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Picks the one release asset that fits this host.
//!
//! Filtering order:
//! 1. the asset name must carry the host OS token (and arch token when known),
//! 2. names containing any exclude pattern are dropped,
//! 3. if any survivor contains a priority pattern, only those survivors remain.
//!
//! Ties go to the first asset in index order. That order is whatever the
//! release index returns; it is not a documented recency guarantee.

use crate::error::{Result, WardenError};
use crate::platform::HostPlatform;

use super::types::ReleaseAsset;

/// Asset selection for one host platform.
#[derive(Debug, Clone, Copy)]
pub struct AssetSelector {
    platform: HostPlatform,
}

impl Default for AssetSelector {
    fn default() -> Self {
        Self::new(HostPlatform::current())
    }
}

impl AssetSelector {
    pub fn new(platform: HostPlatform) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> HostPlatform {
        self.platform
    }

    /// Assets that target this host and are not excluded, in index order.
    pub fn candidates<'a>(
        &self,
        assets: &'a [ReleaseAsset],
        exclude_patterns: &[String],
    ) -> Vec<&'a ReleaseAsset> {
        let exclude = lowercase_all(exclude_patterns);
        assets
            .iter()
            .filter(|asset| {
                let name = asset.name.to_lowercase();
                self.platform.matches(&name) && !exclude.iter().any(|p| name.contains(p.as_str()))
            })
            .collect()
    }

    /// Choose the best asset for this host.
    ///
    /// # Errors
    ///
    /// [`WardenError::NoMatchingAsset`] when no asset survives the OS/arch
    /// and exclude filters.
    pub fn select(
        &self,
        assets: &[ReleaseAsset],
        priority_patterns: &[String],
        exclude_patterns: &[String],
    ) -> Result<ReleaseAsset> {
        let candidates = self.candidates(assets, exclude_patterns);
        if candidates.is_empty() {
            return Err(WardenError::NoMatchingAsset {
                platform: self.platform.to_string(),
                candidates: assets.iter().map(|a| a.name.clone()).collect(),
            });
        }

        let priority = lowercase_all(priority_patterns);
        let preferred: Vec<&ReleaseAsset> = candidates
            .iter()
            .copied()
            .filter(|asset| {
                let name = asset.name.to_lowercase();
                priority.iter().any(|p| name.contains(p.as_str()))
            })
            .collect();
        let pool = if preferred.is_empty() { candidates } else { preferred };

        if pool.len() > 1 {
            tracing::warn!(
                selected = %pool[0].name,
                matches = ?pool.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
                "More than one archive matches this host; taking the first"
            );
        }
        Ok(pool[0].clone())
    }
}

fn lowercase_all(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
