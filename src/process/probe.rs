// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Readiness probes.
//!
//! A probe answers one question: is the server at this endpoint up? Only
//! success or failure is observed; response bodies are never interpreted.
//! llama-server answers `/health` with 503 while the model is loading and
//! 200 once it can serve requests, so only a 2xx counts as ready.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ServerEndpoint;

/// Per-request timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Blocking readiness check, called from the supervisor's poll thread.
pub trait ReadinessProbe: Send + Sync {
    fn probe(&self, endpoint: &ServerEndpoint) -> bool;
}

/// Non-blocking readiness check, awaited on the caller's runtime.
#[async_trait]
pub trait AsyncReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &ServerEndpoint) -> bool;
}

/// `GET <endpoint>/health` with a blocking client.
///
/// The client is built on first use, on the polling thread.
#[derive(Debug, Default)]
pub struct HttpProbe {
    timeout: Option<Duration>,
    client: OnceLock<Option<reqwest::blocking::Client>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Option<&reqwest::blocking::Client> {
        self.client
            .get_or_init(|| {
                reqwest::blocking::Client::builder()
                    .timeout(self.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT))
                    .build()
                    .map_err(|e| tracing::warn!(error = %e, "Failed to build readiness probe client"))
                    .ok()
            })
            .as_ref()
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe(&self, endpoint: &ServerEndpoint) -> bool {
        let Some(client) = self.client() else {
            return false;
        };
        match client.get(endpoint.health_url()).send() {
            Ok(response) => {
                tracing::trace!(status = %response.status(), "Readiness probe answered");
                response.status().is_success()
            }
            Err(e) => {
                tracing::trace!(error = %e, "Readiness probe failed");
                false
            }
        }
    }
}

/// `GET <endpoint>/health` with an async client.
#[derive(Debug, Clone)]
pub struct AsyncHttpProbe {
    client: reqwest::Client,
}

impl Default for AsyncHttpProbe {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }
}

impl AsyncHttpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client for readiness probes");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl AsyncReadinessProbe for AsyncHttpProbe {
    async fn probe(&self, endpoint: &ServerEndpoint) -> bool {
        match self.client.get(endpoint.health_url()).send().await {
            Ok(response) => {
                tracing::trace!(status = %response.status(), "Readiness probe answered");
                response.status().is_success()
            }
            Err(e) => {
                tracing::trace!(error = %e, "Readiness probe failed");
                false
            }
        }
    }
}
