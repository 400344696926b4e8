//! Cost models for the kernel search.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHasher};

use super::plan::{AxisKind, KernelPlan};
use crate::backend::{Device, DeviceBuffer};
use crate::render::RenderedKernel;

/// Scores a rendered kernel variant. Lower is better; `f32::INFINITY`
/// marks a variant that cannot run.
pub trait CostEstimator {
    fn name(&self) -> &'static str;
    fn cost(&mut self, plan: &KernelPlan, rendered: &RenderedKernel) -> f32;
}

/// Relative cost of one arithmetic op against one byte moved.
const FLOP_WEIGHT: f32 = 0.25;
/// Per-iteration overhead of a sequential loop level.
const LOOP_WEIGHT: f32 = 0.05;
/// Memory discount for reduce tiles staged in local memory.
const LOCAL_REUSE: f32 = 0.9;

/// Deterministic cost model from the device profile and the plan's shape.
/// Never touches the device, so search results are reproducible.
pub struct AnalyticCost;

impl AnalyticCost {
    pub fn new() -> Self {
        AnalyticCost
    }
}

impl Default for AnalyticCost {
    fn default() -> Self {
        Self::new()
    }
}

impl CostEstimator for AnalyticCost {
    fn name(&self) -> &'static str {
        "analytic"
    }

    fn cost(&mut self, plan: &KernelPlan, _rendered: &RenderedKernel) -> f32 {
        let k = &plan.kernel;
        let points = k.iteration_points() as f32;
        let elem = k.dtype.size_in_bytes() as f32;

        let loads = points * k.input_shapes.len().max(1) as f32 * elem;
        let stores = crate::shape::num_elements(&k.out_shape) as f32 * elem;
        let flops = points * k.ops.iter().filter(|op| !op.kind.is_view()).count() as f32;

        // SIMD on the innermost axis amortizes both traffic and arithmetic.
        let width = plan
            .axes
            .last()
            .filter(|a| a.kind == AxisKind::Vector)
            .map(|a| a.size as f32)
            .unwrap_or(1.0);

        // Sequential loop levels cost per trip; unrolled and vector bodies
        // do not.
        let loop_overhead: f32 = plan
            .axes
            .iter()
            .filter(|a| matches!(a.kind, AxisKind::Reduce | AxisKind::Global | AxisKind::Local))
            .map(|a| a.size as f32)
            .product::<f32>()
            * LOOP_WEIGHT;

        let mut mem = (loads + stores) / width;
        if !k.reduce_sizes.is_empty() && plan.axes.iter().any(|a| a.kind == AxisKind::Local) {
            mem *= LOCAL_REUSE;
        }

        let cost = mem + flops * FLOP_WEIGHT / width + loop_overhead;
        trace!("analytic cost of {}: {cost:.1}", k.name);
        cost
    }
}

/// Compile-and-time cost: runs each variant on the device with scratch
/// buffers and takes the median of `samples` wall-clock timings. Results
/// are memoized by kernel fingerprint and action list, so re-visits during
/// the search are free.
pub struct EmpiricalCost {
    device: Arc<dyn Device>,
    samples: usize,
    memo: FxHashMap<u64, f32>,
}

impl EmpiricalCost {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            samples: 5,
            memo: FxHashMap::default(),
        }
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    fn memo_key(plan: &KernelPlan) -> u64 {
        let mut h = FxHasher::default();
        plan.kernel.fingerprint.hash(&mut h);
        plan.actions.hash(&mut h);
        h.finish()
    }

    fn measure(&self, plan: &KernelPlan, rendered: &RenderedKernel) -> Option<f32> {
        let compiled = match self.device.compiler().compile(plan, rendered) {
            Ok(k) => k,
            Err(err) => {
                debug!("variant rejected at compile: {err}");
                return None;
            }
        };
        let k = &plan.kernel;
        let mut buffers: Vec<Box<dyn DeviceBuffer>> = Vec::with_capacity(k.args.len());
        for (shape, dtype) in k.input_shapes.iter().zip(&k.input_dtypes) {
            let bytes = crate::shape::num_elements(shape).max(1) * dtype.size_in_bytes();
            buffers.push(self.device.alloc(bytes, *dtype).ok()?);
        }
        let out_bytes = crate::shape::num_elements(&k.out_shape).max(1) * k.dtype.size_in_bytes();
        buffers.push(self.device.alloc(out_bytes, k.dtype).ok()?);

        let mut timings = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            let mut refs: Vec<&mut dyn DeviceBuffer> =
                buffers.iter_mut().map(|b| b.as_mut()).collect();
            let start = Instant::now();
            if compiled.launch(&mut refs).is_err() {
                return None;
            }
            if self.device.synchronize().is_err() {
                return None;
            }
            timings.push(start.elapsed().as_secs_f32());
        }
        timings.sort_by(|a, b| a.total_cmp(b));
        Some(timings[timings.len() / 2])
    }
}

impl CostEstimator for EmpiricalCost {
    fn name(&self) -> &'static str {
        "empirical"
    }

    fn cost(&mut self, plan: &KernelPlan, rendered: &RenderedKernel) -> f32 {
        let key = Self::memo_key(plan);
        if let Some(&cost) = self.memo.get(&key) {
            return cost;
        }
        let cost = self.measure(plan, rendered).unwrap_or(f32::INFINITY);
        self.memo.insert(key, cost);
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceProfile;
    use crate::opt::plan::OptAction;
    use crate::render::{CRenderer, Renderer};
    use crate::schedule::ExecKernel;

    fn dummy_kernel() -> ExecKernel {
        use crate::dtype::DType;
        use crate::graph::OpKind;
        use crate::kernelize::KSrc;
        use crate::schedule::{BufferId, ExecOp};
        ExecKernel {
            name: "k0_add".into(),
            fingerprint: 42,
            ops: vec![ExecOp {
                kind: OpKind::Add,
                dtype: DType::F32,
                shape: vec![64],
                src: vec![KSrc::Ext(0), KSrc::Ext(1)],
            }],
            args: vec![BufferId(0), BufferId(1), BufferId(2)],
            input_shapes: vec![vec![64], vec![64]],
            input_dtypes: vec![DType::F32, DType::F32],
            out_shape: vec![64],
            dtype: DType::F32,
            reduce_sizes: Vec::new(),
        }
    }

    #[test]
    fn test_analytic_cost_deterministic_and_favors_vector() {
        let profile = DeviceProfile::default();
        let renderer = CRenderer::new();
        let plan = KernelPlan::from_kernel(&dummy_kernel());
        let rendered = renderer.render(&plan, &profile).unwrap();

        let mut est = AnalyticCost::new();
        let base = est.cost(&plan, &rendered);
        assert_eq!(base, est.cost(&plan, &rendered));

        let vectorized = plan
            .apply(&OptAction::Vectorize { width: 4 }, &profile)
            .unwrap();
        let rendered_v = renderer.render(&vectorized, &profile).unwrap();
        assert!(est.cost(&vectorized, &rendered_v) < base);
    }
}
