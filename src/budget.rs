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

//! Session token budget with pre-charge accounting.
//!
//! The executor charges an estimate before each LLM or tool call and
//! reconciles the delta afterwards. A charge that would push usage past the
//! ceiling fails atomically without mutating state, which is what turns the
//! budget into a circuit breaker for runaway sessions.

use std::sync::Mutex;
use thiserror::Error;

/// Default fraction of the budget at which a warning fires.
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.8;

/// Budget errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    /// The requested charge would exceed the ceiling
    #[error("token budget exceeded: used {used} + requested {requested} > max {max}")]
    Exceeded {
        used: u64,
        requested: u64,
        max: u64,
    },
}

/// Outcome of a successful `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Usage after the charge
    pub used: u64,
    /// True exactly once per budget: this charge crossed the warn threshold
    pub crossed_warn_threshold: bool,
}

struct BudgetInner {
    used: u64,
    warned: bool,
}

/// Monotonic token counter guarded by a ceiling.
///
/// Owned by a single session. `consume` never suspends; concurrent readers
/// are fine, writes serialize on the internal lock (the executor is the only
/// writer in practice).
pub struct TokenBudget {
    max: u64,
    warn_threshold: f64,
    inner: Mutex<BudgetInner>,
}

impl TokenBudget {
    /// Creates a budget with the default warn threshold.
    pub fn new(max: u64) -> Self {
        Self::with_warn_threshold(max, DEFAULT_WARN_THRESHOLD)
    }

    /// Creates a budget with a custom warn threshold fraction (clamped to 0..=1).
    pub fn with_warn_threshold(max: u64, warn_threshold: f64) -> Self {
        Self {
            max,
            warn_threshold: warn_threshold.clamp(0.0, 1.0),
            inner: Mutex::new(BudgetInner {
                used: 0,
                warned: false,
            }),
        }
    }

    /// Charges `tokens` against the budget.
    ///
    /// Fails with [`BudgetError::Exceeded`] and leaves usage untouched when
    /// the charge would overflow the ceiling.
    pub fn consume(&self, tokens: u64) -> Result<Consumption, BudgetError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let new_used = inner.used.saturating_add(tokens);
        if new_used > self.max {
            return Err(BudgetError::Exceeded {
                used: inner.used,
                requested: tokens,
                max: self.max,
            });
        }

        inner.used = new_used;

        let threshold = (self.max as f64 * self.warn_threshold) as u64;
        let crossed = !inner.warned && new_used >= threshold && self.max > 0;
        if crossed {
            inner.warned = true;
        }

        Ok(Consumption {
            used: new_used,
            crossed_warn_threshold: crossed,
        })
    }

    /// Returns tokens to the budget (reconciliation after an over-estimate).
    pub fn refund(&self, tokens: u64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.used = inner.used.saturating_sub(tokens);
    }

    /// Tokens consumed so far.
    pub fn used(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .used
    }

    /// Tokens still available.
    pub fn remaining(&self) -> u64 {
        self.max.saturating_sub(self.used())
    }

    /// The ceiling.
    pub fn max(&self) -> u64 {
        self.max
    }
}
