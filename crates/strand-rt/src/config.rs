// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Two knobs: the per-routine stack size and the global preemption
//! quantum. Both can be overridden from the environment.

use std::time::Duration;

use crate::error::{Result, RuntimeError};

/// Default stack for each routine.
///
/// The 8 KiB the design started from does not hold a kernel signal frame
/// (several KiB with AVX-512 state) on top of ordinary formatting code.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack `Config::validate` accepts.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Default time slice before a running routine is forcibly switched out.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(100);

/// Scheduler settings. The quantum is global; routines cannot pick their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes of stack allocated for every spawned routine.
    pub stack_size: usize,
    /// Preemption quantum. `None` disables the timer entirely, leaving
    /// scheduling purely cooperative.
    pub quantum: Option<Duration>,
}

impl Config {
    /// Cooperative-only scheduling: routines switch only on `yield_now()`
    /// or completion.
    pub fn cooperative() -> Self {
        Self {
            quantum: None,
            ..Self::default()
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = Some(quantum);
        self
    }

    /// Defaults overridden by `STRAND_STACK_SIZE` and `STRAND_QUANTUM_MS`.
    ///
    /// Malformed values are ignored. `STRAND_QUANTUM_MS=0` turns
    /// preemption off.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(size) = lookup("STRAND_STACK_SIZE").and_then(|s| parse_size(&s)) {
            config.stack_size = size;
        }
        if let Some(ms) = lookup("STRAND_QUANTUM_MS").and_then(|s| s.trim().parse::<u64>().ok()) {
            config.quantum = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(RuntimeError::StackTooSmall {
                requested: self.stack_size,
                minimum: MIN_STACK_SIZE,
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            quantum: Some(DEFAULT_QUANTUM),
        }
    }
}

/// Parse "65536", "64k" or "1m" into bytes.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, mult) = if let Some(n) = s.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(mult)
}
