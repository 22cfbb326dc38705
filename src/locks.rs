// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The supervisors keep their state and child handle behind `std::sync::Mutex`.
//! A relay thread or caller that panics while holding one of those locks must
//! not turn the next `stop()` into a second panic: a leaked `llama-server`
//! is worse than slightly stale bookkeeping. These helpers log the poisoning
//! and recover the guard.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "llama_warden::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned; recovering. A thread panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}
