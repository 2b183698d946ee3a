//! Error & Recovery Manager
//!
//! Owns the engine mode. Every mode change goes through
//! [`RecoveryManager::transition`]; nothing else writes it.
//!
//! ```text
//! Uninitialized ──start──▶ Active ◀──reconnect ok── RecoveryMode
//!       │                  │  ▲                         │
//!       │          hidden  ▼  │ visible        attempts exhausted
//!       │                 Paused                        ▼
//!       └──────── primary source failed ──────▶ FallbackMode
//! ```

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

/// Engine lifecycle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    Uninitialized,
    Active,
    Paused,
    RecoveryMode,
    FallbackMode,
}

impl EngineMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineMode::Uninitialized => "uninitialized",
            EngineMode::Active => "active",
            EngineMode::Paused => "paused",
            EngineMode::RecoveryMode => "recovery",
            EngineMode::FallbackMode => "fallback",
        }
    }

    /// Is the transition `self → to` part of the lifecycle?
    pub fn can_transition(self, to: EngineMode) -> bool {
        use EngineMode::*;
        matches!(
            (self, to),
            (Uninitialized, Active)
                | (Uninitialized, FallbackMode)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, RecoveryMode)
                | (RecoveryMode, Active)
                | (RecoveryMode, FallbackMode)
        )
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sliding-window error tracker and mode holder
#[derive(Debug)]
pub struct RecoveryManager {
    mode: EngineMode,
    threshold: usize,
    window_ms: u64,
    max_attempts: u32,
    backoff_base_ms: u64,
    window: VecDeque<u64>,
    attempts: u32,
    systemic_errors: u64,
    transitions: u64,
    recovery_attempts: u64,
}

impl RecoveryManager {
    pub fn new(threshold: usize, window_ms: u64, max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            mode: EngineMode::Uninitialized,
            threshold,
            window_ms,
            max_attempts,
            backoff_base_ms,
            window: VecDeque::new(),
            attempts: 0,
            systemic_errors: 0,
            transitions: 0,
            recovery_attempts: 0,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Move to `to`; returns `false` (and changes nothing) for transitions
    /// outside the lifecycle
    pub fn transition(&mut self, to: EngineMode) -> bool {
        let from = self.mode;
        if !from.can_transition(to) {
            tracing::debug!(%from, %to, "ignoring mode transition");
            return false;
        }
        self.mode = to;
        self.transitions += 1;
        if to == EngineMode::RecoveryMode {
            self.attempts = 0;
        }
        if from == EngineMode::RecoveryMode {
            self.window.clear();
        }
        tracing::info!(%from, %to, "engine mode changed");
        true
    }

    /// Record a systemic error at `now`. Returns `true` exactly once per
    /// threshold breach, while the engine is active.
    pub fn record_error(&mut self, now: u64) -> bool {
        self.systemic_errors += 1;
        if self.mode != EngineMode::Active {
            return false;
        }
        self.window.push_back(now);
        let horizon = now.saturating_sub(self.window_ms);
        while self.window.front().is_some_and(|&at| at < horizon) {
            self.window.pop_front();
        }
        if self.window.len() > self.threshold {
            tracing::warn!(
                errors = self.window.len(),
                window_ms = self.window_ms,
                "systemic error threshold exceeded"
            );
            self.window.clear();
            return true;
        }
        false
    }

    /// Count a reconnect attempt; returns its number (1-based)
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.recovery_attempts += 1;
        self.attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before the next reconnect attempt
    pub fn next_backoff_ms(&self) -> u64 {
        self.backoff_base_ms
            .saturating_mul(1u64.checked_shl(self.attempts).unwrap_or(u64::MAX))
    }

    /// Errors currently inside the sliding window
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn systemic_errors(&self) -> u64 {
        self.systemic_errors
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn recovery_attempts(&self) -> u64 {
        self.recovery_attempts
    }

    /// Forget everything; used by `destroy`
    pub fn reset(&mut self) {
        if self.mode != EngineMode::Uninitialized {
            tracing::info!(from = %self.mode, "engine mode reset");
        }
        self.mode = EngineMode::Uninitialized;
        self.window.clear();
        self.attempts = 0;
    }
}
