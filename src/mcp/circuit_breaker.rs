// Copyright 2025 Assistance Micro Design
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Circuit breaker for MCP server resilience.
//!
//! Three states:
//! - **Closed**: normal operation, requests pass through
//! - **Open**: server unhealthy, requests are rejected immediately
//! - **HalfOpen**: testing recovery, allows one request through

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default failure threshold before opening the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default cooldown period before the half-open probe (60 seconds).
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Failing; requests rejected until the cooldown elapses
    Open,
    /// Cooldown elapsed; one probe request allowed
    HalfOpen,
}

/// Per-server failure breaker.
///
/// Consecutive failures open the circuit; after the cooldown one probe is
/// let through, and its outcome decides between closing and re-opening.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    cooldown: Duration,
    last_failure: Option<Instant>,
    server_name: String,
}

impl CircuitBreaker {
    /// Creates a breaker with custom thresholds.
    pub fn new(server_name: String, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold,
            cooldown,
            last_failure: None,
            server_name,
        }
    }

    /// Creates a breaker with the default threshold (3) and cooldown (60s).
    pub fn with_defaults(server_name: String) -> Self {
        Self::new(
            server_name,
            DEFAULT_FAILURE_THRESHOLD,
            Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        )
    }

    /// Whether a request may proceed right now.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self
                    .last_failure
                    .map(|t| t.elapsed() > self.cooldown)
                    .unwrap_or(true)
                {
                    debug!(
                        server = %self.server_name,
                        "Circuit breaker transitioning to half-open"
                    );
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Records a successful call; closes the circuit.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            debug!(server = %self.server_name, "Circuit breaker closing after success");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }

    /// Records a failed call; opens the circuit once the threshold is hit.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            if self.state != CircuitState::Open {
                warn!(
                    server = %self.server_name,
                    failures = self.failure_count,
                    "Circuit breaker opening"
                );
            }
            self.state = CircuitState::Open;
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Remaining cooldown before the next probe, if the circuit is open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.last_failure
            .map(|t| self.cooldown.saturating_sub(t.elapsed()))
    }

    /// Manual reset; use only for operator intervention.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test".to_string(), 3, Duration::from_millis(cooldown_ms))
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let mut cb = CircuitBreaker::with_defaults("test".to_string());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker(60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(cb.remaining_cooldown().is_some());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker(60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let mut cb = breaker(1);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A failing probe re-opens immediately
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_success_closes() {
        let mut cb = breaker(1);
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.remaining_cooldown().is_none());
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker(60_000);
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }
}
