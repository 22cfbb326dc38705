// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Blocking server facade.

use std::ops::Deref;
use std::sync::Arc;

use crate::config::ServerEndpoint;
use crate::error::Result;
use crate::process::{HttpProbe, ReadinessProbe, ServerState, Supervise, Supervisor};
use crate::release::ResolvedBinaryDir;

use super::ServerOptions;

/// A managed llama-server for blocking code.
#[derive(Debug)]
pub struct LlamaServer {
    supervisor: Supervisor,
}

impl LlamaServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::with_probe(options, Arc::new(HttpProbe::new()))
    }

    /// Configured from the process environment alone.
    pub fn from_env() -> Result<Self> {
        Self::new(ServerOptions::new())
    }

    pub fn with_probe(options: ServerOptions, probe: Arc<dyn ReadinessProbe>) -> Result<Self> {
        let (spec, releases) = options.build()?;
        Ok(Self {
            supervisor: Supervisor::with_probe(spec, releases, probe),
        })
    }

    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.supervisor.stop()
    }

    pub fn state(&self) -> ServerState {
        self.supervisor.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Exit status of a child that died without `stop()`, e.g. after a crash.
    pub fn last_exit_status(&self) -> Option<String> {
        self.supervisor.last_exit_status()
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.supervisor.spec().endpoint
    }

    pub fn binary_dir(&self) -> Option<ResolvedBinaryDir> {
        self.supervisor.resolved()
    }

    /// `http://host:port`; fails unless the server is ready.
    pub fn server_url(&self) -> Result<String> {
        super::server_url(self.state(), self.endpoint())
    }

    /// `http://host:port/v1`; fails unless the server is ready.
    pub fn openai_base_url(&self) -> Result<String> {
        super::openai_base_url(self.state(), self.endpoint())
    }

    pub fn health_url(&self) -> Result<String> {
        super::health_url(self.state(), self.endpoint())
    }

    /// Start the server and return a guard that stops it when dropped.
    ///
    /// If starting fails, the server is stopped before the error is returned.
    pub fn start_scoped(&self) -> Result<ServerGuard<'_>> {
        if let Err(e) = self.start() {
            if let Err(stop_err) = self.stop() {
                tracing::error!(error = %stop_err, "Cleanup after failed start also failed");
            }
            return Err(e);
        }
        Ok(ServerGuard { server: self })
    }

    /// Run `f` with the server started; it is stopped afterwards on every path.
    pub fn scoped<T>(&self, f: impl FnOnce(&LlamaServer) -> T) -> Result<T> {
        let guard = self.start_scoped()?;
        let out = f(&guard);
        guard.finish()?;
        Ok(out)
    }
}

impl Supervise for LlamaServer {
    fn start(&self) -> Result<()> {
        LlamaServer::start(self)
    }

    fn stop(&self) -> Result<()> {
        LlamaServer::stop(self)
    }

    fn state(&self) -> ServerState {
        LlamaServer::state(self)
    }
}

/// Stops the server when dropped, including during unwinding.
#[derive(Debug)]
#[must_use = "the server stops as soon as the guard is dropped"]
pub struct ServerGuard<'a> {
    server: &'a LlamaServer,
}

impl ServerGuard<'_> {
    /// Stop now and surface any termination error instead of logging it.
    pub fn finish(self) -> Result<()> {
        self.server.stop()
    }
}

impl Deref for ServerGuard<'_> {
    type Target = LlamaServer;

    fn deref(&self) -> &LlamaServer {
        self.server
    }
}

impl Drop for ServerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.server.stop() {
            tracing::error!(error = %e, "Failed to stop llama-server at end of scope");
        }
    }
}
