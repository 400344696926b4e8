//! Per-kernel search over iteration-structure variants.
//!
//! Beam search: each step expands every plan in the beam by one legal
//! action, scores the candidates, and keeps the best `beam_width`. Width 1
//! is plain greedy search. A variant the renderer or compiler rejects
//! scores `f32::INFINITY` and simply never wins; rejection only becomes an
//! error when no variant at all survives, which cannot happen here because
//! the untransformed plan always renders.

mod cost;
pub mod plan;
pub mod progress;

pub use cost::{AnalyticCost, CostEstimator, EmpiricalCost};
pub use plan::{Axis, AxisKind, KernelPlan, OptAction};

use std::time::Instant;

use log::{debug, info, trace};

use crate::backend::DeviceProfile;
use crate::render::Renderer;
use crate::schedule::ExecKernel;
use progress::{FinishInfo, IndicatifProgress, NoOpProgress, ProgressState, SearchProgress};

/// Beam search over kernel plans.
pub struct BeamSearchOptimizer<P = IndicatifProgress>
where
    P: SearchProgress,
{
    beam_width: usize,
    max_steps: usize,
    max_no_improvement_steps: usize,
    progress: Option<P>,
}

impl BeamSearchOptimizer<IndicatifProgress> {
    pub fn new() -> Self {
        Self {
            beam_width: 1,
            max_steps: 8,
            max_no_improvement_steps: 2,
            progress: None,
        }
    }

    /// Show a progress bar while searching. Diagnostics only.
    pub fn with_progress(mut self) -> Self {
        self.progress = Some(IndicatifProgress::new());
        self
    }
}

impl Default for BeamSearchOptimizer<IndicatifProgress> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: SearchProgress> BeamSearchOptimizer<P> {
    pub fn with_beam_width(mut self, width: usize) -> Self {
        self.beam_width = width.max(1);
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_no_improvement_limit(mut self, steps: usize) -> Self {
        self.max_no_improvement_steps = steps.max(1);
        self
    }

    pub fn without_progress(self) -> BeamSearchOptimizer<NoOpProgress> {
        BeamSearchOptimizer {
            beam_width: self.beam_width,
            max_steps: self.max_steps,
            max_no_improvement_steps: self.max_no_improvement_steps,
            progress: None,
        }
    }

    /// Search for the cheapest plan of `kernel` under `estimator`.
    ///
    /// Returns the best plan found together with its score. Deterministic
    /// for a deterministic estimator: candidates are enumerated in a fixed
    /// order and ties keep the earlier candidate.
    pub fn optimize(
        &mut self,
        kernel: &ExecKernel,
        profile: &DeviceProfile,
        renderer: &dyn Renderer,
        estimator: &mut dyn CostEstimator,
    ) -> (KernelPlan, f32) {
        let start_time = Instant::now();
        let initial = KernelPlan::from_kernel(kernel);
        let initial_cost = match renderer.render(&initial, profile) {
            Ok(rendered) => estimator.cost(&initial, &rendered),
            // The untransformed plan uses no optional device features, so a
            // rejection here means the estimator cannot run at all; the
            // search degrades to returning the initial plan.
            Err(rejection) => {
                debug!("initial plan of {} rejected: {rejection}", kernel.name);
                f32::INFINITY
            }
        };
        info!(
            "beam search for {} started (width={}, cost_model={}, initial={:.3e})",
            kernel.name,
            self.beam_width,
            estimator.name(),
            initial_cost
        );

        let mut best = initial.clone();
        let mut best_cost = initial_cost;
        let mut beam = vec![initial];
        let mut no_improvement = 0;
        let mut steps_taken = 0;

        if let Some(progress) = &mut self.progress {
            progress.start(self.max_steps, "kernel search");
        }

        for step in 0..self.max_steps {
            steps_taken = step + 1;
            if let Some(progress) = &mut self.progress {
                progress.update(&ProgressState::new(
                    step,
                    self.max_steps,
                    format!("{} (beam={})", kernel.name, beam.len()),
                ));
            }

            let mut scored: Vec<(KernelPlan, f32)> = Vec::new();
            for entry in &beam {
                for action in entry.candidate_actions(profile) {
                    let Some(candidate) = entry.apply(&action, profile) else {
                        continue;
                    };
                    debug_assert!(candidate.covers_iteration_space());
                    let cost = match renderer.render(&candidate, profile) {
                        Ok(rendered) => estimator.cost(&candidate, &rendered),
                        Err(rejection) => {
                            trace!("{action} rejected: {rejection}");
                            f32::INFINITY
                        }
                    };
                    scored.push((candidate, cost));
                }
            }
            if scored.is_empty() {
                debug!("no candidates at step {step}, search complete");
                break;
            }
            // Stable sort keeps enumeration order on ties.
            scored.sort_by(|a, b| a.1.total_cmp(&b.1));

            if scored[0].1 < best_cost {
                trace!(
                    "step {step}: cost {:.3e} -> {:.3e} via {:?}",
                    best_cost,
                    scored[0].1,
                    scored[0].0.actions.last()
                );
                best = scored[0].0.clone();
                best_cost = scored[0].1;
                no_improvement = 0;
            } else {
                no_improvement += 1;
                if no_improvement >= self.max_no_improvement_steps {
                    debug!("no improvement for {no_improvement} steps, search complete");
                    break;
                }
            }

            beam = scored
                .into_iter()
                .filter(|(_, cost)| cost.is_finite())
                .take(self.beam_width)
                .map(|(plan, _)| plan)
                .collect();
            if beam.is_empty() {
                break;
            }
        }

        if let Some(progress) = &mut self.progress {
            progress.finish(&FinishInfo::new(
                start_time.elapsed(),
                steps_taken,
                self.max_steps,
                "kernel search",
            ));
        }
        info!(
            "beam search for {} done: {} actions, cost {:.3e} -> {:.3e}",
            kernel.name,
            best.actions.len(),
            initial_cost,
            best_cost
        );
        (best, best_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::graph::OpKind;
    use crate::kernelize::KSrc;
    use crate::render::CRenderer;
    use crate::schedule::{BufferId, ExecOp};

    fn elementwise_kernel(n: usize) -> ExecKernel {
        ExecKernel {
            name: "k0_add".into(),
            fingerprint: 7,
            ops: vec![ExecOp {
                kind: OpKind::Add,
                dtype: DType::F32,
                shape: vec![n],
                src: vec![KSrc::Ext(0), KSrc::Ext(1)],
            }],
            args: vec![BufferId(0), BufferId(1), BufferId(2)],
            input_shapes: vec![vec![n], vec![n]],
            input_dtypes: vec![DType::F32, DType::F32],
            out_shape: vec![n],
            dtype: DType::F32,
            reduce_sizes: Vec::new(),
        }
    }

    #[test]
    fn test_search_improves_or_keeps_initial() {
        let profile = DeviceProfile::default();
        let renderer = CRenderer::new();
        let kernel = elementwise_kernel(256);
        let mut est = AnalyticCost::new();
        let mut opt = BeamSearchOptimizer::new().without_progress().with_beam_width(2);
        let initial = KernelPlan::from_kernel(&kernel);
        let initial_cost = est.cost(&initial, &renderer.render(&initial, &profile).unwrap());
        let (best, cost) = opt.optimize(&kernel, &profile, &renderer, &mut est);
        assert!(cost <= initial_cost);
        assert!(best.covers_iteration_space());
    }

    #[test]
    fn test_search_deterministic() {
        let profile = DeviceProfile::default();
        let renderer = CRenderer::new();
        let kernel = elementwise_kernel(128);
        let run = || {
            let mut est = AnalyticCost::new();
            let mut opt = BeamSearchOptimizer::new().without_progress().with_beam_width(3);
            opt.optimize(&kernel, &profile, &renderer, &mut est)
        };
        let (a, ca) = run();
        let (b, cb) = run();
        assert_eq!(a.actions, b.actions);
        assert_eq!(ca, cb);
    }

    #[test]
    fn test_rejecting_estimator_returns_initial_plan() {
        struct RejectAll;
        impl CostEstimator for RejectAll {
            fn name(&self) -> &'static str {
                "reject"
            }
            fn cost(&mut self, plan: &KernelPlan, _: &crate::render::RenderedKernel) -> f32 {
                if plan.actions.is_empty() {
                    1.0
                } else {
                    f32::INFINITY
                }
            }
        }
        let profile = DeviceProfile::default();
        let renderer = CRenderer::new();
        let kernel = elementwise_kernel(64);
        let mut opt = BeamSearchOptimizer::new().without_progress();
        let (best, cost) = opt.optimize(&kernel, &profile, &renderer, &mut RejectAll);
        assert!(best.actions.is_empty());
        assert_eq!(cost, 1.0);
    }
}
