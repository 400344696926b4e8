//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Which cost model the per-kernel search uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostMode {
    /// Deterministic model from the device profile. Reproducible results,
    /// no device time spent searching.
    Analytic,
    /// Compile and time each variant on the device.
    Empirical,
}

/// Retry policy for transient execution failures. Non-transient failures
/// are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (counting from 1), doubling each time.
    pub fn backoff(&self, attempt: usize) -> Duration {
        self.initial_backoff * (1u32 << (attempt.saturating_sub(1)).min(16) as u32)
    }
}

/// Executor configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: String,
    pub beam_width: usize,
    /// Maximum search steps per kernel.
    pub opt_budget: usize,
    pub cost_mode: CostMode,
    /// On-disk artifact cache location; `None` disables the disk layer
    /// even when `disk_cache` is set and no default directory exists.
    pub cache_dir: Option<PathBuf>,
    pub disk_cache: bool,
    pub jit: bool,
    pub show_progress: bool,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: "host".to_string(),
            beam_width: 1,
            opt_budget: 8,
            cost_mode: CostMode::Analytic,
            cache_dir: crate::runtime::cache::default_cache_dir(),
            disk_cache: false,
            jit: true,
            show_progress: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_beam_width(mut self, width: usize) -> Self {
        self.beam_width = width.max(1);
        self
    }

    pub fn with_opt_budget(mut self, steps: usize) -> Self {
        self.opt_budget = steps;
        self
    }

    pub fn with_cost_mode(mut self, mode: CostMode) -> Self {
        self.cost_mode = mode;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self.disk_cache = true;
        self
    }

    pub fn with_disk_cache(mut self, enabled: bool) -> Self {
        self.disk_cache = enabled;
        self
    }

    pub fn with_jit(mut self, enabled: bool) -> Self {
        self.jit = enabled;
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
