// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async server facade.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerEndpoint;
use crate::error::Result;
use crate::process::{AsyncHttpProbe, AsyncReadinessProbe, AsyncSupervise, AsyncSupervisor, ServerState};
use crate::release::ResolvedBinaryDir;

use super::ServerOptions;

/// A managed llama-server for async code.
#[derive(Debug)]
pub struct AsyncLlamaServer {
    supervisor: AsyncSupervisor,
}

impl AsyncLlamaServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::with_probe(options, Arc::new(AsyncHttpProbe::new()))
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ServerOptions::new())
    }

    pub fn with_probe(options: ServerOptions, probe: Arc<dyn AsyncReadinessProbe>) -> Result<Self> {
        let (spec, releases) = options.build()?;
        Ok(Self {
            supervisor: AsyncSupervisor::with_probe(spec, releases, probe),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
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

    pub fn server_url(&self) -> Result<String> {
        super::server_url(self.state(), self.endpoint())
    }

    pub fn openai_base_url(&self) -> Result<String> {
        super::openai_base_url(self.state(), self.endpoint())
    }

    pub fn health_url(&self) -> Result<String> {
        super::health_url(self.state(), self.endpoint())
    }

    /// Start the server, await `f`, then stop the server.
    ///
    /// The stop also runs when `f`'s output is an error. If the returned
    /// future is dropped early, the child is still killed when this server
    /// is dropped.
    pub async fn scoped<'a, F, Fut, T>(&'a self, f: F) -> Result<T>
    where
        F: FnOnce(&'a AsyncLlamaServer) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        if let Err(e) = self.start().await {
            if let Err(stop_err) = self.stop().await {
                tracing::error!(error = %stop_err, "Cleanup after failed start also failed");
            }
            return Err(e);
        }

        let out = f(self).await;
        self.stop().await?;
        Ok(out)
    }
}

#[async_trait]
impl AsyncSupervise for AsyncLlamaServer {
    async fn start(&self) -> Result<()> {
        AsyncLlamaServer::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        AsyncLlamaServer::stop(self).await
    }

    fn state(&self) -> ServerState {
        AsyncLlamaServer::state(self)
    }
}
