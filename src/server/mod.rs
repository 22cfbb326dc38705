// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server facade.
//!
//! [`LlamaServer`] (blocking) and [`AsyncLlamaServer`] (tokio) tie release
//! resolution and process supervision together behind one object and hand
//! out the server's URLs once it is ready.
//!
//! # Example
//!
//! ```no_run
//! use llama_warden::server::{LlamaServer, ServerOptions};
//!
//! # fn example() -> llama_warden::Result<()> {
//! let server = LlamaServer::new(
//!     ServerOptions::new()
//!         .tag("latest")
//!         .port(8081)
//!         .hf_repo("ggml-org/gemma-3-1b-it-GGUF"),
//! )?;
//!
//! let guard = server.start_scoped()?;
//! println!("OpenAI-compatible API at {}", guard.openai_base_url()?);
//! // llama-server is stopped when `guard` goes out of scope.
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    resolve_start_timeout, EnvSnapshot, EnvironmentOverlay, ServerEndpoint,
};
use crate::error::{Result, WardenError};
use crate::process::{LaunchSpec, ServerState, Timings};
use crate::release::{
    ArchiveDownloader, GithubReleaseIndex, HttpDownloader, ReleaseIndex, ReleaseManager,
    ReleaseSettings, ReleasesDir,
};

pub mod blocking;
pub mod cooperative;

pub use blocking::{LlamaServer, ServerGuard};
pub use cooperative::AsyncLlamaServer;

/// Path suffix of the OpenAI-compatible API.
pub const OPENAI_API_PATH: &str = "/v1";

/// Everything needed to build a [`LlamaServer`] or [`AsyncLlamaServer`].
///
/// Unset fields fall back to the environment snapshot, then to defaults.
#[derive(Clone, Default)]
pub struct ServerOptions {
    release: ReleaseSettings,
    host: Option<String>,
    port: Option<u16>,
    start_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    stop_grace: Option<Duration>,
    env_vars: Vec<(String, String)>,
    scrub_model_vars: bool,
    scrub_server_vars: bool,
    args: Vec<String>,
    verbose: bool,
    force_download: bool,
    download_progress: bool,
    releases_dir: Option<PathBuf>,
    environment: Option<EnvSnapshot>,
    index: Option<Arc<dyn ReleaseIndex>>,
    downloader: Option<Arc<dyn ArchiveDownloader>>,
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("release", &self.release)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("start_timeout", &self.start_timeout)
            .field("args", &self.args)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    // --- release resolution -------------------------------------------------

    /// Release tag, or `"latest"`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.release.tag = Some(tag.into());
        self
    }

    /// Download this archive instead of picking one from a release.
    pub fn archive_url(mut self, url: impl Into<String>) -> Self {
        self.release.archive_url = Some(url.into());
        self
    }

    /// Use an existing directory containing `llama-server`.
    pub fn binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.release.local_dir = Some(dir.into());
        self
    }

    pub fn priority_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.release.priority_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.release.exclude_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    /// Draw a progress bar on stderr while downloading releases.
    pub fn download_progress(mut self, show: bool) -> Self {
        self.download_progress = show;
        self
    }

    /// Cache root; defaults to `LLAMA_WARDEN_RELEASES_DIR` or the data directory.
    pub fn releases_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.releases_dir = Some(dir.into());
        self
    }

    /// Query this index instead of the llama.cpp GitHub releases.
    pub fn release_index(mut self, index: Arc<dyn ReleaseIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn ArchiveDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    // --- endpoint and timing ------------------------------------------------

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Grace period between SIGTERM and kill on stop.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = Some(grace);
        self
    }

    // --- child environment --------------------------------------------------

    /// Resolve everything against this snapshot instead of the process environment.
    pub fn environment(mut self, env: EnvSnapshot) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn model(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into().display().to_string();
        self.env_var("LLAMA_ARG_MODEL", path)
    }

    pub fn hf_repo(self, repo: impl Into<String>) -> Self {
        self.env_var("LLAMA_ARG_HF_REPO", repo)
    }

    pub fn ctx_size(self, tokens: u32) -> Self {
        self.env_var("LLAMA_ARG_CTX_SIZE", tokens.to_string())
    }

    /// Ignore model-selection variables inherited from the environment.
    pub fn without_model_vars(mut self) -> Self {
        self.scrub_model_vars = true;
        self
    }

    /// Ignore every inherited `LLAMA_ARG_*` / `LLAMA_LOG_*` variable.
    pub fn without_server_vars(mut self) -> Self {
        self.scrub_server_vars = true;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Relay llama-server's output through `tracing`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    // --- resolution ---------------------------------------------------------

    /// Resolve the layered settings into a launch spec and release manager.
    pub fn build(&self) -> Result<(LaunchSpec, ReleaseManager)> {
        let env = self.environment.clone().unwrap_or_else(EnvSnapshot::capture);

        let release = self.release.resolve(&env)?;
        // host()/port() > env_var() entries > inherited snapshot > defaults.
        let inherited = if self.scrub_server_vars {
            EnvSnapshot::empty()
        } else {
            env.clone()
        };
        let endpoint_env = inherited.with_overrides(self.env_vars.iter().cloned());
        let endpoint = ServerEndpoint::resolve(self.host.as_deref(), self.port, &endpoint_env)?;

        let defaults = Timings::default();
        let timings = Timings {
            start_timeout: resolve_start_timeout(self.start_timeout, &env)?,
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            stop_grace: self.stop_grace.unwrap_or(defaults.stop_grace),
        };
        if timings.poll_interval.is_zero() {
            return Err(WardenError::config("poll interval must be positive"));
        }

        let mut overlay = EnvironmentOverlay::from_snapshot(&env);
        if self.scrub_model_vars {
            overlay = overlay.without_model_vars();
        }
        if self.scrub_server_vars {
            overlay = overlay.without_server_vars();
        }
        for (key, value) in &self.env_vars {
            overlay = overlay.set(key.clone(), value.clone());
        }

        let spec = LaunchSpec {
            release,
            force_download: self.force_download,
            endpoint,
            overlay,
            args: self.args.clone(),
            verbose: self.verbose,
            timings,
        };
        Ok((spec, self.release_manager(&env)?))
    }

    fn release_manager(&self, env: &EnvSnapshot) -> Result<ReleaseManager> {
        let releases = match &self.releases_dir {
            Some(dir) => ReleasesDir::at(dir),
            None => ReleasesDir::from_env(env)?,
        };
        let index: Arc<dyn ReleaseIndex> = match &self.index {
            Some(index) => Arc::clone(index),
            None => Arc::new(GithubReleaseIndex::llama_cpp()?),
        };
        let downloader: Arc<dyn ArchiveDownloader> = match &self.downloader {
            Some(downloader) => Arc::clone(downloader),
            None => Arc::new(HttpDownloader::new().with_progress(self.download_progress)),
        };
        Ok(ReleaseManager::with_sources(releases, index, downloader))
    }
}

/// `url` when the server is ready, [`WardenError::ServerNotReady`] otherwise.
fn when_ready(state: ServerState, url: String) -> Result<String> {
    if state.is_ready() {
        Ok(url)
    } else {
        Err(WardenError::ServerNotReady { state })
    }
}

fn server_url(state: ServerState, endpoint: &ServerEndpoint) -> Result<String> {
    when_ready(state, endpoint.base_url())
}

fn openai_base_url(state: ServerState, endpoint: &ServerEndpoint) -> Result<String> {
    when_ready(state, format!("{}{}", endpoint.base_url(), OPENAI_API_PATH))
}

fn health_url(state: ServerState, endpoint: &ServerEndpoint) -> Result<String> {
    when_ready(state, endpoint.health_url())
}
