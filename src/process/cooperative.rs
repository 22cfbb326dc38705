// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process Supervisor for async callers.
//!
//! Same state machine as [`super::Supervisor`], but nothing here blocks a
//! runtime thread: the child is a `tokio::process::Child`, readiness polling
//! and output relay are tasks, and `stop()` interrupts polling through a
//! `watch` channel. The one blocking step, release resolution (HTTP plus
//! archive extraction), runs on the blocking pool via `spawn_blocking`.
//!
//! Children are spawned with `kill_on_drop(true)`, so dropping a supervisor
//! without awaiting `stop()` still kills the server, just without the
//! graceful SIGTERM phase.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, WardenError};
use crate::locks::resilient_lock;
use crate::release::{ReleaseManager, ResolvedBinaryDir};

use super::launch::LaunchSpec;
use super::output::{relay_async, OutputStream};
use super::probe::{AsyncHttpProbe, AsyncReadinessProbe};
use super::state::{Lifecycle, ServerState, StartTicket, StopAction};
use super::terminate::terminate_child_async;
use super::{AsyncSupervise, PollOutcome};

#[derive(Debug)]
struct ServerProcess {
    child: tokio::process::Child,
    pid: u32,
    started_at: Instant,
    relays: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Inner {
    lifecycle: Lifecycle,
    process: Option<ServerProcess>,
    cancel: Option<watch::Sender<bool>>,
    resolved: Option<ResolvedBinaryDir>,
    last_exit: Option<String>,
}

/// Supervises one `llama-server` child on a tokio runtime.
pub struct AsyncSupervisor {
    spec: LaunchSpec,
    releases: ReleaseManager,
    probe: Arc<dyn AsyncReadinessProbe>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for AsyncSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSupervisor")
            .field("endpoint", &self.spec.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AsyncSupervisor {
    pub fn new(spec: LaunchSpec, releases: ReleaseManager) -> Self {
        Self::with_probe(spec, releases, Arc::new(AsyncHttpProbe::new()))
    }

    pub fn with_probe(
        spec: LaunchSpec,
        releases: ReleaseManager,
        probe: Arc<dyn AsyncReadinessProbe>,
    ) -> Self {
        Self {
            spec,
            releases,
            probe,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Current state; notices a child that died after becoming ready.
    pub fn state(&self) -> ServerState {
        let mut inner = resilient_lock(&self.inner);
        observe_exit(&mut inner);
        inner.lifecycle.state()
    }

    pub fn last_exit_status(&self) -> Option<String> {
        resilient_lock(&self.inner).last_exit.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        resilient_lock(&self.inner).process.as_ref().map(|p| p.pid)
    }

    pub fn resolved(&self) -> Option<ResolvedBinaryDir> {
        resilient_lock(&self.inner).resolved.clone()
    }

    /// Resolve, spawn, and wait until the server is ready.
    pub async fn start(&self) -> Result<()> {
        let ticket = {
            let mut inner = resilient_lock(&self.inner);
            observe_exit(&mut inner);
            let ticket = inner.lifecycle.begin_start()?;
            inner.last_exit = None;
            ticket
        };

        let resolved = match self.resolve().await {
            Ok(resolved) => resolved,
            Err(e) => {
                resilient_lock(&self.inner).lifecycle.abort_start(ticket);
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(orphan) = self.spawn(&resolved, ticket, cancel_tx)? {
            reap(orphan, self.spec.timings.stop_grace).await.ok();
            return Err(WardenError::StartCancelled);
        }

        let outcome = self.poll_readiness(cancel_rx).await;
        self.finish_start(ticket, outcome).await
    }

    /// Stop the child if one is running. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<()> {
        let (process, cancel) = {
            let mut inner = resilient_lock(&self.inner);
            match inner.lifecycle.begin_stop() {
                StopAction::Noop | StopAction::InProgress => return Ok(()),
                StopAction::Proceed => {}
            }
            (inner.process.take(), inner.cancel.take())
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }

        let result = match process {
            Some(process) => {
                tracing::info!(pid = process.pid, "Stopping llama-server");
                reap(process, self.spec.timings.stop_grace).await.map(|_| ())
            }
            None => Ok(()),
        };

        resilient_lock(&self.inner).lifecycle.finish_stop();
        result
    }

    async fn resolve(&self) -> Result<ResolvedBinaryDir> {
        if let Some(resolved) = resilient_lock(&self.inner).resolved.clone() {
            return Ok(resolved);
        }

        let releases = self.releases.clone();
        let config = self.spec.release.clone();
        let force = self.spec.force_download;
        let resolved = tokio::task::spawn_blocking(move || releases.resolve_with(&config, force))
            .await
            .map_err(|e| WardenError::io("release resolution task failed", std::io::Error::other(e)))??;

        resilient_lock(&self.inner).resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// Spawn the child and register it. Returns the process back if a
    /// concurrent `stop()` already claimed this start.
    fn spawn(
        &self,
        resolved: &ResolvedBinaryDir,
        ticket: StartTicket,
        cancel: watch::Sender<bool>,
    ) -> Result<Option<ServerProcess>> {
        let mut command = tokio::process::Command::from(self.spec.command(resolved));
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                resilient_lock(&self.inner).lifecycle.mark_failed(ticket);
                return Err(WardenError::Spawn {
                    binary: resolved.executable().to_path_buf(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or_default();
        tracing::info!(pid, endpoint = %self.spec.endpoint, dir = %resolved, "Spawned llama-server");

        let mut relays = Vec::new();
        if self.spec.verbose {
            if let Some(stdout) = child.stdout.take() {
                relays.push(tokio::spawn(relay_async(stdout, OutputStream::Stdout)));
            }
            if let Some(stderr) = child.stderr.take() {
                relays.push(tokio::spawn(relay_async(stderr, OutputStream::Stderr)));
            }
        }

        let process = ServerProcess {
            child,
            pid,
            started_at: Instant::now(),
            relays,
        };

        let mut inner = resilient_lock(&self.inner);
        if !inner.lifecycle.holds(&ticket) {
            return Ok(Some(process));
        }
        inner.process = Some(process);
        inner.cancel = Some(cancel);
        Ok(None)
    }

    async fn poll_readiness(&self, mut cancel: watch::Receiver<bool>) -> PollOutcome {
        let inner = Arc::clone(&self.inner);
        let probe = Arc::clone(&self.probe);
        let endpoint = self.spec.endpoint.clone();
        let timings = self.spec.timings;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                if let Some(status) = child_exit(&inner) {
                    return PollOutcome::Exited {
                        status: status.to_string(),
                        elapsed: started.elapsed(),
                    };
                }

                let ready = tokio::select! {
                    ready = probe.probe(&endpoint) => ready,
                    _ = cancel.changed() => return PollOutcome::Cancelled,
                };
                if ready {
                    return PollOutcome::Ready {
                        elapsed: started.elapsed(),
                    };
                }

                let elapsed = started.elapsed();
                if elapsed >= timings.start_timeout {
                    return match child_exit(&inner) {
                        Some(status) => PollOutcome::Exited {
                            status: status.to_string(),
                            elapsed,
                        },
                        None => PollOutcome::TimedOut { elapsed },
                    };
                }

                let wait = timings.poll_interval.min(timings.start_timeout - elapsed);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.changed() => return PollOutcome::Cancelled,
                }
            }
        });

        task.await.unwrap_or(PollOutcome::Cancelled)
    }

    async fn finish_start(&self, ticket: StartTicket, outcome: PollOutcome) -> Result<()> {
        let url = self.spec.endpoint.base_url();
        let failure = match outcome {
            PollOutcome::Ready { elapsed } => {
                resilient_lock(&self.inner).lifecycle.mark_ready(ticket)?;
                tracing::info!(url = %url, elapsed = ?elapsed, "llama-server is ready");
                return Ok(());
            }
            PollOutcome::Cancelled => return Err(WardenError::StartCancelled),
            PollOutcome::TimedOut { elapsed } => {
                tracing::warn!(url = %url, elapsed = ?elapsed, "llama-server did not become ready");
                WardenError::ServerStartTimeout { url, elapsed }
            }
            PollOutcome::Exited { status, elapsed } => {
                tracing::warn!(%status, elapsed = ?elapsed, "llama-server exited during startup");
                resilient_lock(&self.inner).last_exit = Some(status.clone());
                WardenError::ServerCrashed { status, elapsed }
            }
        };

        let process = {
            let mut inner = resilient_lock(&self.inner);
            if !inner.lifecycle.mark_failed(ticket) {
                return Err(WardenError::StartCancelled);
            }
            inner.cancel = None;
            inner.process.take()
        };
        if let Some(process) = process {
            reap(process, self.spec.timings.stop_grace).await?;
        }
        Err(failure)
    }
}

#[async_trait]
impl AsyncSupervise for AsyncSupervisor {
    async fn start(&self) -> Result<()> {
        AsyncSupervisor::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        AsyncSupervisor::stop(self).await
    }

    fn state(&self) -> ServerState {
        AsyncSupervisor::state(self)
    }
}

impl Drop for AsyncSupervisor {
    fn drop(&mut self) {
        let mut inner = resilient_lock(&self.inner);
        if let Some(process) = inner.process.as_mut() {
            tracing::warn!(pid = process.pid, "Supervisor dropped without stop(); killing llama-server");
            let _ = process.child.start_kill();
        }
    }
}

/// `Ready → Failed` once the child has exited by itself. The child is
/// already reaped by `try_wait`; relay tasks finish at EOF.
fn observe_exit(inner: &mut Inner) {
    if inner.lifecycle.state() != ServerState::Ready {
        return;
    }
    let Some(process) = inner.process.as_mut() else {
        return;
    };
    let Ok(Some(status)) = process.child.try_wait() else {
        return;
    };
    if inner.lifecycle.mark_crashed() {
        tracing::warn!(pid = process.pid, %status, uptime = ?process.started_at.elapsed(), "llama-server exited unexpectedly");
        inner.last_exit = Some(status.to_string());
        inner.cancel = None;
        inner.process = None;
    }
}

fn child_exit(inner: &Mutex<Inner>) -> Option<ExitStatus> {
    let mut inner = resilient_lock(inner);
    let process = inner.process.as_mut()?;
    process.child.try_wait().ok().flatten()
}

async fn reap(mut process: ServerProcess, grace: Duration) -> Result<ExitStatus> {
    let status = terminate_child_async(&mut process.child, grace).await?;
    for relay in process.relays.drain(..) {
        let _ = relay.await;
    }
    tracing::debug!(
        pid = process.pid,
        %status,
        uptime = ?process.started_at.elapsed(),
        "llama-server reaped"
    );
    Ok(status)
}
