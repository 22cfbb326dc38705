// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor lifecycle state machine.
//!
//! ```text
//!  Idle ──start──▶ Starting ──probe ok──▶ Ready
//!   ▲                 │ │                   │
//!   └─resolve failed──┘ └─timeout/crash─▶ Failed ◀──child exited──┘
//!
//!  Stopped ◀── Stopping ◀──stop── Starting | Ready | Failed
//! ```
//!
//! Both supervisors drive the same [`Lifecycle`]; only their waiting
//! differs. Every `start()` gets a [`StartTicket`]. `stop()` bumps the
//! generation, which invalidates the ticket of any start still polling, so
//! a late "ready" from a cancelled start can never resurrect the state.

use std::fmt;

use crate::error::{Result, WardenError};

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerState {
    #[default]
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    /// `start()` is only accepted from these states.
    pub fn can_start(self) -> bool {
        matches!(self, ServerState::Idle | ServerState::Stopped)
    }

    pub fn is_ready(self) -> bool {
        self == ServerState::Ready
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Idle => "idle",
            ServerState::Starting => "starting",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Proof that a particular `start()` call owns the `Starting` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTicket {
    generation: u64,
    previous: ServerState,
}

/// What `stop()` should do after consulting the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Nothing is running; return immediately.
    Noop,
    /// Another `stop()` is already tearing the process down.
    InProgress,
    /// This caller owns the teardown and must call [`Lifecycle::finish_stop`].
    Proceed,
}

/// Transition rules shared by the blocking and async supervisors.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: ServerState,
    generation: u64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// `Idle | Stopped → Starting`.
    pub fn begin_start(&mut self) -> Result<StartTicket> {
        if !self.state.can_start() {
            return Err(WardenError::AlreadyRunning { state: self.state });
        }
        let ticket = StartTicket {
            generation: self.generation,
            previous: self.state,
        };
        self.state = ServerState::Starting;
        Ok(ticket)
    }

    /// Whether `ticket` still owns the `Starting` state.
    pub fn holds(&self, ticket: &StartTicket) -> bool {
        self.generation == ticket.generation && self.state == ServerState::Starting
    }

    /// Undo `begin_start` before anything was spawned.
    pub fn abort_start(&mut self, ticket: StartTicket) {
        if self.holds(&ticket) {
            self.state = ticket.previous;
        }
    }

    /// `Starting → Ready`, unless a `stop()` got there first.
    pub fn mark_ready(&mut self, ticket: StartTicket) -> Result<()> {
        if !self.holds(&ticket) {
            return Err(WardenError::StartCancelled);
        }
        self.state = ServerState::Ready;
        Ok(())
    }

    /// `Starting → Failed`. Returns `false` if a `stop()` already took over.
    pub fn mark_failed(&mut self, ticket: StartTicket) -> bool {
        if !self.holds(&ticket) {
            return false;
        }
        self.state = ServerState::Failed;
        true
    }

    /// `Ready → Failed` after the child died on its own.
    ///
    /// Returns `false` unless the server was `Ready`; a crash noticed during
    /// startup or teardown is handled by those paths instead.
    pub fn mark_crashed(&mut self) -> bool {
        if self.state != ServerState::Ready {
            return false;
        }
        self.state = ServerState::Failed;
        true
    }

    /// Enter `Stopping` if there is anything to stop.
    pub fn begin_stop(&mut self) -> StopAction {
        match self.state {
            ServerState::Idle | ServerState::Stopped => StopAction::Noop,
            ServerState::Stopping => StopAction::InProgress,
            ServerState::Starting | ServerState::Ready | ServerState::Failed => {
                self.generation += 1;
                self.state = ServerState::Stopping;
                StopAction::Proceed
            }
        }
    }

    /// `Stopping → Stopped`.
    pub fn finish_stop(&mut self) {
        if self.state == ServerState::Stopping {
            self.state = ServerState::Stopped;
        }
    }
}
