// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release index queries.
//!
//! The index is a capability: the fetcher only needs "what is the newest
//! tag" and "which assets does this tag have". [`GithubReleaseIndex`] answers
//! both from the GitHub releases API; tests substitute their own.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WardenError};

use super::types::ReleaseAsset;

/// GitHub releases endpoint for llama.cpp.
pub const LLAMA_CPP_RELEASES_API: &str = "https://api.github.com/repos/ggml-org/llama.cpp/releases";

/// Timeout for index queries (in seconds).
const INDEX_TIMEOUT_SECS: u64 = 30;

/// GitHub rejects API requests without a User-Agent.
pub(crate) const USER_AGENT: &str = concat!("llama-warden/", env!("CARGO_PKG_VERSION"));

/// Read-only view of a releases catalog.
pub trait ReleaseIndex: Send + Sync {
    /// Resolve the newest published release to its concrete tag.
    fn latest_tag(&self) -> Result<String>;

    /// All assets listed for `tag`, in the index's own order.
    fn list_assets(&self, tag: &str) -> Result<Vec<ReleaseAsset>>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// [`ReleaseIndex`] backed by the GitHub REST API.
///
/// A blocking HTTP client is built per query, so the index can be created and
/// dropped from async code and only ever does I/O on the calling thread.
#[derive(Debug, Clone)]
pub struct GithubReleaseIndex {
    api_url: String,
}

impl GithubReleaseIndex {
    /// Index for the official llama.cpp repository.
    pub fn llama_cpp() -> Result<Self> {
        Self::new(LLAMA_CPP_RELEASES_API)
    }

    /// Index for any `https://api.github.com/repos/<owner>/<repo>/releases` URL.
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        if !api_url.ends_with("/releases") {
            return Err(WardenError::config(format!(
                "releases API URL must end with /releases: {api_url}"
            )));
        }

        Ok(Self { api_url })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn get_release(&self, url: &str) -> Result<GithubRelease> {
        tracing::debug!(url, "Querying release index");
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(INDEX_TIMEOUT_SECS))
            .build()
            .map_err(|e| WardenError::download(url, e))?;

        let response = client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .map_err(|e| WardenError::download(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::download(url, format!("HTTP {status}")));
        }

        response
            .json::<GithubRelease>()
            .map_err(|e| WardenError::download(url, format!("unexpected response: {e}")))
    }
}

impl ReleaseIndex for GithubReleaseIndex {
    fn latest_tag(&self) -> Result<String> {
        let url = format!("{}/latest", self.api_url);
        let release = self.get_release(&url)?;
        if release.tag_name.is_empty() {
            return Err(WardenError::download(url, "latest release has no tag"));
        }
        Ok(release.tag_name)
    }

    fn list_assets(&self, tag: &str) -> Result<Vec<ReleaseAsset>> {
        let url = format!("{}/tags/{}", self.api_url, tag);
        let release = self.get_release(&url)?;
        Ok(release
            .assets
            .into_iter()
            .map(|a| ReleaseAsset {
                name: a.name,
                download_url: a.browser_download_url,
                size: a.size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_github_release_payload() {
        let body = r#"{
            "tag_name": "b6780",
            "name": "b6780",
            "assets": [
                {"name": "llama-b6780-bin-ubuntu-x64.zip",
                 "browser_download_url": "https://github.com/ggml-org/llama.cpp/releases/download/b6780/llama-b6780-bin-ubuntu-x64.zip",
                 "size": 12345678,
                 "content_type": "application/zip"}
            ]
        }"#;
        let release: GithubRelease = serde_json::from_str(body).unwrap();
        assert_eq!(release.tag_name, "b6780");
        assert_eq!(release.assets.len(), 1);
        assert_eq!(release.assets[0].size, Some(12345678));
    }

    #[test]
    fn test_rejects_non_releases_url() {
        let err = GithubReleaseIndex::new("https://api.github.com/repos/ggml-org/llama.cpp").unwrap_err();
        assert!(matches!(err, WardenError::Configuration(_)));
    }
}
