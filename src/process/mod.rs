// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! llama-server process supervision.
//!
//! Two supervisors share one [`Lifecycle`] and differ only in how they wait:
//!
//! - [`Supervisor`]: blocking `start()`/`stop()`, readiness polling on a
//!   worker thread, output relay on background threads.
//! - [`AsyncSupervisor`]: `start()`/`stop()` are futures; polling and relay
//!   are tasks on the caller's tokio runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod blocking;
pub mod cooperative;
pub mod launch;
pub mod output;
pub mod probe;
pub mod state;
pub mod terminate;

pub use blocking::Supervisor;
pub use cooperative::AsyncSupervisor;
pub use launch::{LaunchSpec, Timings, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_GRACE};
pub use output::{LineSplitter, OutputStream, RELAY_TARGET};
pub use probe::{AsyncHttpProbe, AsyncReadinessProbe, HttpProbe, ReadinessProbe};
pub use state::{Lifecycle, ServerState, StartTicket, StopAction};

/// Control surface of a blocking supervisor.
pub trait Supervise {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn state(&self) -> ServerState;

    fn is_ready(&self) -> bool {
        self.state().is_ready()
    }
}

/// Control surface of an async supervisor.
#[async_trait]
pub trait AsyncSupervise: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn state(&self) -> ServerState;

    fn is_ready(&self) -> bool {
        self.state().is_ready()
    }
}

/// Verdict of a readiness polling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
    Exited { status: String, elapsed: Duration },
    Cancelled,
}
