// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for llama-warden.
//!
//! Every failure carries enough context (URL or path attempted, elapsed time,
//! last observed exit status) to be diagnosed without verbose logging.
//! [`WardenError::report`] turns an error into the multi-line
//! "possible causes / try these fixes" block printed by the CLI.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::ServerState;

/// Issue tracker linked from error reports.
pub const ISSUES_URL: &str = "https://github.com/rigrun/llama-warden/issues";

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors produced while resolving, launching or stopping llama-server.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Invalid or contradictory configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The release lists archives, but none targets this host.
    #[error("no release asset matches {platform} (candidates: {})", .candidates.join(", "))]
    NoMatchingAsset {
        platform: String,
        candidates: Vec<String>,
    },

    /// The release exists but lists no downloadable archives.
    #[error("release {tag} has no archive assets")]
    AssetNotFound { tag: String },

    /// Transport failure talking to the release index or downloading an archive.
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    /// The archive is corrupt or in an unsupported format.
    #[error("failed to extract {}: {reason}", .archive.display())]
    Extraction { archive: PathBuf, reason: String },

    /// The resolved directory does not contain the server executable.
    #[error("{binary} not found (searched: {})", display_paths(.searched))]
    BinaryNotFound {
        binary: String,
        searched: Vec<PathBuf>,
    },

    /// `start()` was called while the supervisor was not idle or stopped.
    #[error("server is already {state}; stop it before starting again")]
    AlreadyRunning { state: ServerState },

    /// Readiness polling timed out while the child was still alive.
    #[error("server at {url} did not become ready within {elapsed:.1?}")]
    ServerStartTimeout { url: String, elapsed: Duration },

    /// The child exited before becoming ready.
    #[error("server exited before becoming ready after {elapsed:.1?} ({status})")]
    ServerCrashed { status: String, elapsed: Duration },

    /// `server_url` was requested before the server reported ready.
    #[error("server is not ready (state: {state})")]
    ServerNotReady { state: ServerState },

    /// A concurrent `stop()` interrupted readiness polling.
    #[error("server start was cancelled by stop()")]
    StartCancelled,

    /// The OS refused to launch the binary.
    #[error("failed to spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Forceful termination failed at the OS level.
    #[error("failed to terminate server process {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl WardenError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WardenError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        WardenError::Configuration(message.into())
    }

    pub fn download(url: impl Into<String>, reason: impl ToString) -> Self {
        WardenError::Download {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction(archive: impl Into<PathBuf>, reason: impl ToString) -> Self {
        WardenError::Extraction {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }

    /// Render the error with likely causes and suggested fixes.
    pub fn report(&self) -> String {
        let builder = ErrorBuilder::new(self.to_string());
        let builder = match self {
            WardenError::Configuration(_) => builder
                .cause("An LLAMA_WARDEN_* or LLAMA_ARG_* variable has an invalid value")
                .fix("Check the environment with: env | grep -E 'LLAMA_(WARDEN|ARG)_'"),
            WardenError::NoMatchingAsset { .. } => builder
                .cause("The release has no build for this OS/architecture")
                .cause("Exclude patterns removed every remaining build")
                .fix("List the release assets: llama-warden assets --tag <tag>")
                .fix("Point at an archive directly: --archive-url <url>"),
            WardenError::AssetNotFound { .. } => builder
                .cause("The tag does not exist or its release is still being published")
                .fix("Try the newest release: --tag latest"),
            WardenError::Download { .. } => builder
                .cause("No network access or GitHub API rate limit reached")
                .cause("The archive URL is wrong")
                .fix("Retry the command; downloads are not resumed automatically")
                .fix("Use a pre-downloaded build: --binary-dir <dir>"),
            WardenError::Extraction { .. } => builder
                .cause("The download was truncated or the archive is not zip/tar")
                .fix("Re-download with: llama-warden fetch --force"),
            WardenError::BinaryNotFound { .. } => builder
                .cause("The directory does not contain a llama.cpp build")
                .fix("Point --binary-dir at the directory holding llama-server"),
            WardenError::AlreadyRunning { .. } => {
                builder.fix("Call stop() before start() again")
            }
            WardenError::ServerStartTimeout { .. } => builder
                .cause("The model is still loading (large models take minutes)")
                .cause("Another process already owns the port")
                .fix("Raise the timeout: LLAMA_WARDEN_START_TIMEOUT=600")
                .fix("Run with --verbose to see llama-server output"),
            WardenError::ServerCrashed { .. } => builder
                .cause("Model path or Hugging Face repo is wrong")
                .cause("Missing shared libraries for this build")
                .fix("Run with --verbose to see llama-server output"),
            WardenError::ServerNotReady { .. } => {
                builder.fix("Call start() and wait for it to return")
            }
            WardenError::Spawn { .. } => builder
                .cause("The binary is not executable on this host")
                .fix("Re-download with: llama-warden fetch --force"),
            _ => builder,
        };
        builder.build()
    }
}

/// Formats an error message with title, causes, fixes, and help link.
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n\n", title));

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(&format!("Need help? {}", ISSUES_URL));
    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}
