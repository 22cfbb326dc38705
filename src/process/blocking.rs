// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process Supervisor for blocking callers.
//!
//! `start()` blocks the calling thread, but the readiness loop itself runs
//! on a dedicated poll thread; the caller just waits for its verdict.
//! Output relay (verbose mode) gets one thread per stream. `stop()` may be
//! called from any thread, including while another thread is inside
//! `start()`: it interrupts polling through a channel instead of waiting
//! out the timeout.

use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Result, WardenError};
use crate::locks::resilient_lock;
use crate::release::{ReleaseManager, ResolvedBinaryDir};

use super::launch::LaunchSpec;
use super::output::{spawn_relay, OutputStream};
use super::probe::{HttpProbe, ReadinessProbe};
use super::state::{Lifecycle, ServerState, StartTicket, StopAction};
use super::terminate::terminate_child;
use super::{PollOutcome, Supervise};

/// A live child plus the threads relaying its output.
#[derive(Debug)]
struct ServerProcess {
    child: Child,
    pid: u32,
    started_at: Instant,
    relays: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Inner {
    lifecycle: Lifecycle,
    process: Option<ServerProcess>,
    /// Dropping or sending on this wakes the poll thread.
    cancel: Option<Sender<()>>,
    resolved: Option<ResolvedBinaryDir>,
    /// Exit status of the last child that died without being stopped.
    last_exit: Option<String>,
}

/// Supervises one `llama-server` child from blocking code.
pub struct Supervisor {
    spec: LaunchSpec,
    releases: ReleaseManager,
    probe: Arc<dyn ReadinessProbe>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("endpoint", &self.spec.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(spec: LaunchSpec, releases: ReleaseManager) -> Self {
        Self::with_probe(spec, releases, Arc::new(HttpProbe::new()))
    }

    pub fn with_probe(spec: LaunchSpec, releases: ReleaseManager, probe: Arc<dyn ReadinessProbe>) -> Self {
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

    /// Current state. A `Ready` server whose child has exited is moved to
    /// `Failed` here.
    pub fn state(&self) -> ServerState {
        let mut inner = resilient_lock(&self.inner);
        observe_exit(&mut inner);
        inner.lifecycle.state()
    }

    /// Exit status of the last child that died on its own, for diagnostics.
    pub fn last_exit_status(&self) -> Option<String> {
        resilient_lock(&self.inner).last_exit.clone()
    }

    /// PID of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        resilient_lock(&self.inner).process.as_ref().map(|p| p.pid)
    }

    /// Directory the binary was resolved to, once a start got that far.
    pub fn resolved(&self) -> Option<ResolvedBinaryDir> {
        resilient_lock(&self.inner).resolved.clone()
    }

    /// Resolve, spawn, and block until the server is ready.
    pub fn start(&self) -> Result<()> {
        let ticket = {
            let mut inner = resilient_lock(&self.inner);
            observe_exit(&mut inner);
            let ticket = inner.lifecycle.begin_start()?;
            inner.last_exit = None;
            ticket
        };

        let resolved = match self.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                resilient_lock(&self.inner).lifecycle.abort_start(ticket);
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = mpsc::channel();
        self.spawn(&resolved, ticket, cancel_tx)?;

        let outcome = match self.await_readiness(cancel_rx) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon_start(ticket);
                return Err(e);
            }
        };
        self.finish_start(ticket, outcome)
    }

    /// Stop the child if one is running. Safe to call repeatedly.
    pub fn stop(&self) -> Result<()> {
        let (process, cancel) = {
            let mut inner = resilient_lock(&self.inner);
            match inner.lifecycle.begin_stop() {
                StopAction::Noop | StopAction::InProgress => return Ok(()),
                StopAction::Proceed => {}
            }
            (inner.process.take(), inner.cancel.take())
        };

        // Wake a poll thread that may still be sleeping.
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }

        let result = match process {
            Some(process) => {
                tracing::info!(pid = process.pid, "Stopping llama-server");
                reap(process, self.spec.timings.stop_grace).map(|_| ())
            }
            None => Ok(()),
        };

        resilient_lock(&self.inner).lifecycle.finish_stop();
        result
    }

    fn resolve(&self) -> Result<ResolvedBinaryDir> {
        if let Some(resolved) = resilient_lock(&self.inner).resolved.clone() {
            return Ok(resolved);
        }
        let resolved = self
            .releases
            .resolve_with(&self.spec.release, self.spec.force_download)?;
        resilient_lock(&self.inner).resolved = Some(resolved.clone());
        Ok(resolved)
    }

    fn spawn(&self, resolved: &ResolvedBinaryDir, ticket: StartTicket, cancel: Sender<()>) -> Result<()> {
        let mut child = match self.spec.command(resolved).spawn() {
            Ok(child) => child,
            Err(source) => {
                resilient_lock(&self.inner).lifecycle.mark_failed(ticket);
                return Err(WardenError::Spawn {
                    binary: resolved.executable().to_path_buf(),
                    source,
                });
            }
        };
        let pid = child.id();
        tracing::info!(pid, endpoint = %self.spec.endpoint, dir = %resolved, "Spawned llama-server");

        let mut relays = Vec::new();
        if self.spec.verbose {
            if let Some(stdout) = child.stdout.take() {
                relays.extend(spawn_relay(stdout, OutputStream::Stdout).ok());
            }
            if let Some(stderr) = child.stderr.take() {
                relays.extend(spawn_relay(stderr, OutputStream::Stderr).ok());
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
            // stop() ran while we were resolving or spawning.
            drop(inner);
            let _ = reap(process, self.spec.timings.stop_grace);
            return Err(WardenError::StartCancelled);
        }
        inner.process = Some(process);
        inner.cancel = Some(cancel);
        Ok(())
    }

    fn await_readiness(&self, cancel: Receiver<()>) -> Result<PollOutcome> {
        let inner = Arc::clone(&self.inner);
        let probe = Arc::clone(&self.probe);
        let endpoint = self.spec.endpoint.clone();
        let timings = self.spec.timings;

        let worker = thread::Builder::new()
            .name("llama-server-poll".to_string())
            .spawn(move || {
                let started = Instant::now();
                loop {
                    if let Some(status) = child_exit(&inner) {
                        return PollOutcome::Exited {
                            status: status.to_string(),
                            elapsed: started.elapsed(),
                        };
                    }
                    if probe.probe(&endpoint) {
                        return PollOutcome::Ready {
                            elapsed: started.elapsed(),
                        };
                    }

                    let elapsed = started.elapsed();
                    if elapsed >= timings.start_timeout {
                        // Distinguish a hung server from one that just died.
                        return match child_exit(&inner) {
                            Some(status) => PollOutcome::Exited {
                                status: status.to_string(),
                                elapsed,
                            },
                            None => PollOutcome::TimedOut { elapsed },
                        };
                    }

                    let wait = timings.poll_interval.min(timings.start_timeout - elapsed);
                    match cancel.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return PollOutcome::Cancelled,
                    }
                }
            })
            .map_err(|e| WardenError::io("spawning readiness poll thread", e))?;

        // A panicking probe is treated like a stop: nothing trustworthy to report.
        Ok(worker.join().unwrap_or(PollOutcome::Cancelled))
    }

    /// Fail a start whose child is already registered, and reap the child.
    fn abandon_start(&self, ticket: StartTicket) {
        let process = {
            let mut inner = resilient_lock(&self.inner);
            if !inner.lifecycle.mark_failed(ticket) {
                // stop() owns the child now.
                return;
            }
            inner.cancel = None;
            inner.process.take()
        };
        if let Some(process) = process {
            if let Err(e) = reap(process, self.spec.timings.stop_grace) {
                tracing::error!(error = %e, "Failed to reap llama-server after an aborted start");
            }
        }
    }

    fn finish_start(&self, ticket: StartTicket, outcome: PollOutcome) -> Result<()> {
        let url = self.spec.endpoint.base_url();
        let mut inner = resilient_lock(&self.inner);

        match outcome {
            PollOutcome::Ready { elapsed } => {
                inner.lifecycle.mark_ready(ticket)?;
                tracing::info!(url = %url, elapsed = ?elapsed, "llama-server is ready");
                Ok(())
            }
            PollOutcome::Cancelled => Err(WardenError::StartCancelled),
            PollOutcome::TimedOut { elapsed } => {
                if !inner.lifecycle.mark_failed(ticket) {
                    return Err(WardenError::StartCancelled);
                }
                let process = inner.process.take();
                inner.cancel = None;
                drop(inner);
                tracing::warn!(url = %url, elapsed = ?elapsed, "llama-server did not become ready");
                if let Some(process) = process {
                    reap(process, self.spec.timings.stop_grace)?;
                }
                Err(WardenError::ServerStartTimeout { url, elapsed })
            }
            PollOutcome::Exited { status, elapsed } => {
                if !inner.lifecycle.mark_failed(ticket) {
                    return Err(WardenError::StartCancelled);
                }
                let process = inner.process.take();
                inner.cancel = None;
                inner.last_exit = Some(status.clone());
                drop(inner);
                tracing::warn!(%status, elapsed = ?elapsed, "llama-server exited during startup");
                if let Some(process) = process {
                    reap(process, self.spec.timings.stop_grace)?;
                }
                Err(WardenError::ServerCrashed { status, elapsed })
            }
        }
    }
}

impl Supervise for Supervisor {
    fn start(&self) -> Result<()> {
        Supervisor::start(self)
    }

    fn stop(&self) -> Result<()> {
        Supervisor::stop(self)
    }

    fn state(&self) -> ServerState {
        Supervisor::state(self)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Failed to stop llama-server while dropping its supervisor");
        }
    }
}

/// Move a `Ready` server whose child has died to `Failed`.
///
/// `try_wait` has already reaped the child; its relay threads end at EOF on
/// their own, so the process record is just dropped.
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

/// Exit status of the supervised child, if it has exited.
fn child_exit(inner: &Mutex<Inner>) -> Option<ExitStatus> {
    let mut inner = resilient_lock(inner);
    let process = inner.process.as_mut()?;
    process.child.try_wait().ok().flatten()
}

/// Terminate, reap, and wait for the relay threads to drain.
fn reap(mut process: ServerProcess, grace: Duration) -> Result<ExitStatus> {
    let status = terminate_child(&mut process.child, grace)?;
    for relay in process.relays.drain(..) {
        let _ = relay.join();
    }
    tracing::debug!(
        pid = process.pid,
        %status,
        uptime = ?process.started_at.elapsed(),
        "llama-server reaped"
    );
    Ok(status)
}
