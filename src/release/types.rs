// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release resolution types.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{EnvSnapshot, ENV_ARCHIVE_URL, ENV_BINARY_DIR, ENV_TAG};
use crate::error::{Result, WardenError};

/// Tag value that resolves to the newest release.
pub const LATEST_TAG: &str = "latest";

/// Builds preferred when several assets match the host.
pub const DEFAULT_PRIORITY_PATTERNS: &[&str] = &["cpu", "cuda"];

/// Builds never selected unless explicitly asked for.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["vulkan", "cudart"];

/// One downloadable archive within a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    /// Size in bytes, when the index reports it.
    #[serde(default)]
    pub size: Option<u64>,
}

impl ReleaseAsset {
    pub fn new(name: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            download_url: download_url.into(),
            size: None,
        }
    }

    /// Whether the asset looks like an archive we can extract.
    pub fn is_archive(&self) -> bool {
        let name = self.name.to_lowercase();
        [".zip", ".tar.gz", ".tgz", ".tar"]
            .iter()
            .any(|ext| name.ends_with(ext))
    }
}

/// How a release is picked from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSelection {
    /// Concrete tag or [`LATEST_TAG`].
    pub tag: String,
    /// Case-insensitive substrings preferred among host-matching assets.
    pub priority_patterns: Vec<String>,
    /// Case-insensitive substrings that disqualify an asset.
    pub exclude_patterns: Vec<String>,
}

impl TagSelection {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            priority_patterns: DEFAULT_PRIORITY_PATTERNS.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn latest() -> Self {
        Self::new(LATEST_TAG)
    }

    pub fn with_priority<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// The three mutually exclusive ways of obtaining the server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseConfig {
    /// Use an existing directory as-is.
    LocalDir(PathBuf),
    /// Download a specific archive.
    ArchiveUrl(String),
    /// Pick an asset from a tagged release.
    Tag(TagSelection),
}

impl ReleaseConfig {
    pub fn local_dir(path: impl Into<PathBuf>) -> Self {
        ReleaseConfig::LocalDir(path.into())
    }

    pub fn archive_url(url: impl Into<String>) -> Self {
        ReleaseConfig::ArchiveUrl(url.into())
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        ReleaseConfig::Tag(TagSelection::new(tag))
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            ReleaseConfig::LocalDir(path) => format!("local dir {}", path.display()),
            ReleaseConfig::ArchiveUrl(url) => format!("archive {}", url),
            ReleaseConfig::Tag(sel) => format!("release {}", sel.tag),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        ReleaseConfig::Tag(TagSelection::latest())
    }
}

/// Raw resolution inputs, any combination of which may be supplied.
///
/// [`ReleaseSettings::resolve`] takes the explicit fields if any mode is set,
/// otherwise the environment snapshot, and within that layer applies the
/// override order `LocalDir` > `ArchiveUrl` > `Tag`.
#[derive(Debug, Clone, Default)]
pub struct ReleaseSettings {
    pub local_dir: Option<PathBuf>,
    pub archive_url: Option<String>,
    pub tag: Option<String>,
    pub priority_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
}

impl ReleaseSettings {
    pub fn resolve(&self, env: &EnvSnapshot) -> Result<ReleaseConfig> {
        // Any explicitly supplied mode shadows the whole environment layer.
        let explicit_mode = self.local_dir.is_some() || self.archive_url.is_some() || self.tag.is_some();
        let (local_dir, archive_url, tag) = if explicit_mode {
            (self.local_dir.clone(), self.archive_url.clone(), self.tag.clone())
        } else {
            (
                env.get(ENV_BINARY_DIR).map(PathBuf::from),
                env.get(ENV_ARCHIVE_URL).map(str::to_string),
                env.get(ENV_TAG).map(str::to_string),
            )
        };

        if let Some(dir) = local_dir {
            if archive_url.is_some() || tag.is_some() {
                tracing::debug!("binary directory overrides archive URL and tag");
            }
            return Ok(ReleaseConfig::LocalDir(dir));
        }

        if let Some(url) = archive_url {
            validate_archive_url(&url)?;
            return Ok(ReleaseConfig::ArchiveUrl(url));
        }

        let tag = tag.unwrap_or_else(|| LATEST_TAG.to_string());
        if tag.trim().is_empty() {
            return Err(WardenError::config("release tag must not be empty"));
        }
        let mut selection = TagSelection::new(tag.trim());
        if let Some(priority) = &self.priority_patterns {
            selection = selection.with_priority(priority.iter().cloned());
        }
        if let Some(exclude) = &self.exclude_patterns {
            selection = selection.with_exclude(exclude.iter().cloned());
        }
        Ok(ReleaseConfig::Tag(selection))
    }
}

/// Reject archive URLs we could never download.
pub fn validate_archive_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| WardenError::config(format!("invalid archive URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(WardenError::config(format!(
            "archive URL {url:?} uses unsupported scheme {other:?}"
        ))),
    }
}

/// Release tag embedded in a GitHub download URL (`.../releases/download/<tag>/<file>`).
pub fn tag_from_download_url(url: &str) -> Option<&str> {
    let rest = url.split("/releases/download/").nth(1)?;
    rest.split('/').next().filter(|tag| !tag.is_empty())
}

/// Directory guaranteed to contain the server executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinaryDir {
    dir: PathBuf,
    executable: PathBuf,
}

impl ResolvedBinaryDir {
    pub(crate) fn new(dir: PathBuf, executable_name: &str) -> Self {
        let executable = dir.join(executable_name);
        Self { dir, executable }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path to the server executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl fmt::Display for ResolvedBinaryDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_order() {
        let settings = ReleaseSettings {
            local_dir: Some(PathBuf::from("/opt/llama")),
            archive_url: Some("https://example.com/a.zip".to_string()),
            tag: Some("b6780".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve(&EnvSnapshot::empty()).unwrap(),
            ReleaseConfig::LocalDir(PathBuf::from("/opt/llama"))
        );

        let settings = ReleaseSettings {
            archive_url: Some("https://example.com/a.zip".to_string()),
            tag: Some("b6780".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve(&EnvSnapshot::empty()).unwrap(),
            ReleaseConfig::ArchiveUrl("https://example.com/a.zip".to_string())
        );
    }

    #[test]
    fn test_environment_layer() {
        let env = EnvSnapshot::from_pairs([(ENV_TAG, "b6000"), (ENV_BINARY_DIR, "/env/dir")]);

        // The environment applies its own override order when nothing is explicit.
        assert_eq!(
            ReleaseSettings::default().resolve(&env).unwrap(),
            ReleaseConfig::LocalDir(PathBuf::from("/env/dir"))
        );

        // An explicit tag shadows every environment-supplied mode.
        let explicit_tag = ReleaseSettings {
            tag: Some("b6780".to_string()),
            ..Default::default()
        };
        match explicit_tag.resolve(&env).unwrap() {
            ReleaseConfig::Tag(sel) => assert_eq!(sel.tag, "b6780"),
            other => panic!("unexpected {:?}", other),
        }

        let env = EnvSnapshot::from_pairs([(ENV_TAG, "b6000")]);
        match ReleaseSettings::default().resolve(&env).unwrap() {
            ReleaseConfig::Tag(sel) => assert_eq!(sel.tag, "b6000"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_is_latest_with_default_patterns() {
        match ReleaseSettings::default().resolve(&EnvSnapshot::empty()).unwrap() {
            ReleaseConfig::Tag(sel) => {
                assert_eq!(sel.tag, LATEST_TAG);
                assert_eq!(sel.priority_patterns, vec!["cpu", "cuda"]);
                assert_eq!(sel.exclude_patterns, vec!["vulkan", "cudart"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_archive_url_and_empty_tag() {
        let settings = ReleaseSettings {
            archive_url: Some("ftp://example.com/a.zip".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            settings.resolve(&EnvSnapshot::empty()),
            Err(WardenError::Configuration(_))
        ));

        let settings = ReleaseSettings {
            tag: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(settings.resolve(&EnvSnapshot::empty()).is_err());
    }

    #[test]
    fn test_tag_from_download_url() {
        assert_eq!(
            tag_from_download_url(
                "https://github.com/ggml-org/llama.cpp/releases/download/b6752/llama-b6752-bin-win-cpu-x64.zip"
            ),
            Some("b6752")
        );
        assert_eq!(tag_from_download_url("https://example.com/a.zip"), None);
    }

    #[test]
    fn test_is_archive() {
        assert!(ReleaseAsset::new("llama-bin-ubuntu-x64.zip", "u").is_archive());
        assert!(ReleaseAsset::new("llama-bin-ubuntu-x64.TAR.GZ", "u").is_archive());
        assert!(!ReleaseAsset::new("checksums.txt", "u").is_archive());
    }
}
