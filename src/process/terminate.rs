// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Graceful-then-forceful child termination.
//!
//! On Unix the child first gets SIGTERM (via `kill -TERM`, so no libc
//! bindings are needed) and a grace period to exit; after that it is
//! killed. Windows has no graceful signal for console children, so the
//! process is killed immediately.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, WardenError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stop a blocking-world child and reap it.
pub fn terminate_child(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let pid = child.id();
    if let Some(status) = try_wait(child)? {
        tracing::debug!(pid, %status, "Server process had already exited");
        return Ok(status);
    }

    if request_graceful_exit(pid) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = try_wait(child)? {
                tracing::info!(pid, %status, "Server process exited");
                return Ok(status);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        tracing::warn!(pid, grace = ?grace, "Server ignored SIGTERM; killing it");
    }

    if let Err(source) = child.kill() {
        // The child may have exited between the last poll and the kill.
        if let Some(status) = try_wait(child)? {
            return Ok(status);
        }
        return Err(WardenError::Terminate { pid, source });
    }
    child
        .wait()
        .map_err(|source| WardenError::Terminate { pid, source })
}

/// Stop a tokio child and reap it without blocking the runtime.
pub async fn terminate_child_async(
    child: &mut tokio::process::Child,
    grace: Duration,
) -> Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child
            .wait()
            .await
            .map_err(|source| WardenError::Terminate { pid: 0, source });
    };

    if request_graceful_exit_async(pid).await {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, %status, "Server process exited");
                return Ok(status);
            }
            Ok(Err(source)) => return Err(WardenError::Terminate { pid, source }),
            Err(_) => tracing::warn!(pid, grace = ?grace, "Server ignored SIGTERM; killing it"),
        }
    }

    if let Err(source) = child.start_kill() {
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(status);
        }
        return Err(WardenError::Terminate { pid, source });
    }
    child
        .wait()
        .await
        .map_err(|source| WardenError::Terminate { pid, source })
}

fn try_wait(child: &mut Child) -> Result<Option<ExitStatus>> {
    let pid = child.id();
    child
        .try_wait()
        .map_err(|source| WardenError::Terminate { pid, source })
}

/// Send SIGTERM. Returns whether a graceful exit is worth waiting for.
#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> bool {
    match std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(pid, error = %e, "Could not send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
async fn request_graceful_exit_async(pid: u32) -> bool {
    match tokio::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(pid, error = %e, "Could not send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
async fn request_graceful_exit_async(_pid: u32) -> bool {
    false
}
