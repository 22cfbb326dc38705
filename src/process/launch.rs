// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! What to launch and how long to wait for it.

use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::{EnvironmentOverlay, ServerEndpoint, DEFAULT_START_TIMEOUT_SECS};
use crate::release::{ReleaseConfig, ResolvedBinaryDir};

/// Default delay between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Timing knobs for start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Total budget for readiness polling.
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Everything a supervisor needs to start llama-server.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub release: ReleaseConfig,
    /// Replace cached downloads instead of reusing them.
    pub force_download: bool,
    pub endpoint: ServerEndpoint,
    pub overlay: EnvironmentOverlay,
    /// Extra command-line arguments, passed verbatim.
    pub args: Vec<String>,
    /// Relay the child's stdout/stderr through `tracing`.
    pub verbose: bool,
    pub timings: Timings,
}

impl LaunchSpec {
    /// The child command for a resolved binary.
    ///
    /// The environment is replaced wholesale by the rendered overlay, so
    /// variables scrubbed from the overlay are really gone for the child.
    pub fn command(&self, resolved: &ResolvedBinaryDir) -> Command {
        let mut cmd = Command::new(resolved.executable());
        cmd.args(&self.args)
            .current_dir(resolved.dir())
            .env_clear()
            .envs(self.overlay.render(&self.endpoint, resolved.dir()))
            .stdin(Stdio::null());

        if self.verbose {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd
    }
}
