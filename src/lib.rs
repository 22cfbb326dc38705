// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! llama-warden - run llama.cpp's `llama-server` as a managed child process
//!
//! Resolves a `llama-server` binary (downloaded release, direct archive, or
//! local directory), launches it, waits until it answers `/health`, and
//! tears it down cleanly. Blocking and tokio callers get the same
//! lifecycle.
//!
//! **ReleaseConfig** -> **ReleaseManager** -> **Supervisor** -> **server URL**
//!
//! # Core Modules
//!
//! - [`release`] - Asset selection, download, extraction, and the on-disk cache
//! - [`process`] - Lifecycle state machine, readiness probing, supervisors
//! - [`server`] - `LlamaServer` / `AsyncLlamaServer` facades and scoped acquisition
//! - [`config`] - Environment snapshot, endpoint, and child environment overlay
//! - [`platform`] - Host OS/architecture detection
//! - [`error`] - Error type and user-facing error reports

pub mod config;
pub mod error;
pub mod locks;
pub mod platform;
pub mod process;
pub mod release;
pub mod server;

pub use config::{EnvSnapshot, EnvironmentOverlay, ServerEndpoint};
pub use error::{Result, WardenError};
pub use platform::{Arch, HostPlatform, OsFamily};
pub use process::{
    AsyncSupervise, AsyncSupervisor, LaunchSpec, ServerState, Supervise, Supervisor, Timings,
};
pub use release::{
    ReleaseAsset, ReleaseConfig, ReleaseManager, ReleaseSettings, ReleasesDir, ResolvedBinaryDir,
    TagSelection,
};
pub use server::{AsyncLlamaServer, LlamaServer, ServerGuard, ServerOptions};
