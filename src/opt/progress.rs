//! Progress reporting for the kernel search.
//!
//! The search loop reports through a small trait so diagnostics can be
//! swapped out or silenced; the bar is cosmetic and never affects results.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// Snapshot of the search state for display.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub current_step: usize,
    pub max_steps: usize,
    pub message: String,
}

impl ProgressState {
    pub fn new(current_step: usize, max_steps: usize, message: impl Into<String>) -> Self {
        Self {
            current_step,
            max_steps,
            message: message.into(),
        }
    }
}

/// Summary emitted when the search ends.
#[derive(Debug, Clone)]
pub struct FinishInfo {
    pub elapsed: Duration,
    pub steps: usize,
    pub max_steps: usize,
    /// Whether the search stopped before exhausting its step budget.
    pub converged: bool,
    pub task_name: String,
}

impl FinishInfo {
    pub fn new(
        elapsed: Duration,
        steps: usize,
        max_steps: usize,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            elapsed,
            steps,
            max_steps,
            converged: steps < max_steps,
            task_name: task_name.into(),
        }
    }
}

/// Display hooks called by the search loop.
pub trait SearchProgress: Send {
    fn start(&mut self, max_steps: usize, task_name: &str);
    fn update(&mut self, state: &ProgressState);
    fn finish(&mut self, info: &FinishInfo);
}

/// Cargo-style progress bar.
pub struct IndicatifProgress {
    pb: Option<ProgressBar>,
    start_time: Option<Instant>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            pb: None,
            start_time: None,
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchProgress for IndicatifProgress {
    fn start(&mut self, max_steps: usize, _task_name: &str) {
        self.start_time = Some(Instant::now());
        let pb = ProgressBar::new(max_steps as u64);
        pb.set_style(
            ProgressStyle::with_template("{prefix:>12.cyan.bold} [{bar:24}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_prefix("Optimizing");
        self.pb = Some(pb);
    }

    fn update(&mut self, state: &ProgressState) {
        if let Some(pb) = &self.pb {
            pb.set_position(state.current_step as u64);
            pb.set_message(state.message.clone());
        }
    }

    fn finish(&mut self, info: &FinishInfo) {
        if let Some(pb) = self.pb.take() {
            let detail = if info.converged {
                format!("converged after {} steps", info.steps)
            } else {
                format!("{} steps", info.steps)
            };
            pb.finish_and_clear();
            eprintln!(
                "{:>12} {} in {:.2?} ({})",
                "Finished", info.task_name, info.elapsed, detail
            );
        }
    }
}

/// Silent progress for tests and library use.
pub struct NoOpProgress;

impl SearchProgress for NoOpProgress {
    fn start(&mut self, _max_steps: usize, _task_name: &str) {}
    fn update(&mut self, _state: &ProgressState) {}
    fn finish(&mut self, _info: &FinishInfo) {}
}
