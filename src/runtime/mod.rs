//! The executor: drives a graph through the full pipeline and runs the
//! resulting plan on a device.
//!
//! `realize` is the single entry point. It validates inputs and consults
//! the JIT cache: an identical earlier request (same graph structure, same
//! bindings) replays outright, and a request that changed only its scalar
//! bindings rebinds the captured kernel partition, skipping kernelize and
//! the plan search. Everything else takes the full path: kernelize,
//! schedule, search a plan per kernel, render, compile through the
//! artifact cache and execute. A variant the backend fails to compile
//! falls back to the next-shorter action prefix before the request fails.
//! Transient execution failures retry with exponential backoff; everything
//! else surfaces immediately.

pub mod cache;
pub mod jit;

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{ArrayD, IxDyn};
use rustc_hash::{FxHashMap, FxHasher};

use crate::backend::{get_device, CompiledKernel, Device, DeviceBuffer, DeviceProfile};
use crate::config::{Config, CostMode};
use crate::dtype::DType;
use crate::error::{CompileError, Error, Result};
use crate::graph::{Graph, NodeId, OpKind};
use crate::kernelize::{kernelize, KernelizePolicy};
use crate::opt::{
    AnalyticCost, BeamSearchOptimizer, CostEstimator, EmpiricalCost, KernelPlan, OptAction,
};
use crate::render::{CRenderer, Renderer};
use crate::schedule::{schedule, BufferId, ExecKernel, ScheduleItem, SchedulePlan};
use crate::shape::expr::Bindings;
use crate::shape::{num_elements, resolve_shape};
use cache::{ArtifactCache, CacheKey};
use jit::{CapturedSearch, JitCache};

/// A tensor in host memory: raw bytes plus shape and dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DType,
}

impl HostTensor {
    /// Wrap raw bytes. `data` must hold exactly one element per point of
    /// `shape`.
    pub fn from_bytes(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            num_elements(&shape).max(1) * dtype.size_in_bytes(),
            "byte length does not match shape"
        );
        HostTensor { data, shape, dtype }
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(shape, DType::F32, data)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(shape, DType::I32, data)
    }

    pub fn from_ndarray(array: ArrayD<f32>) -> Self {
        let shape = array.shape().to_vec();
        let values: Vec<f32> = array.iter().copied().collect();
        Self::from_f32(shape, &values)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elements(&self) -> usize {
        num_elements(&self.shape).max(1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_f32(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DType::F32, "tensor is {}", self.dtype);
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_i32(&self) -> Vec<i32> {
        assert_eq!(self.dtype, DType::I32, "tensor is {}", self.dtype);
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_ndarray(&self) -> ArrayD<f32> {
        match ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_f32()) {
            Ok(array) => array,
            Err(_) => unreachable!("byte length matches shape by construction"),
        }
    }
}

/// Materialized results of one realize call, addressable by node.
#[derive(Debug)]
pub struct Realized {
    outputs: Vec<(NodeId, HostTensor)>,
}

impl Realized {
    /// The tensor materialized for `node`.
    pub fn get(&self, node: NodeId) -> Result<&HostTensor> {
        self.outputs
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, t)| t)
            .ok_or(Error::NotAnOutput(node))
    }

    /// Tensors in output-marking order.
    pub fn into_vec(self) -> Vec<HostTensor> {
        self.outputs.into_iter().map(|(_, t)| t).collect()
    }
}

pub struct Executor {
    device: Arc<dyn Device>,
    renderer: Box<dyn Renderer>,
    config: Config,
    policy: KernelizePolicy,
    cache: ArtifactCache,
    jit: JitCache,
}

impl Executor {
    pub fn new(config: Config) -> Result<Self> {
        let device = get_device(&config.backend)?;
        let disk_dir = if config.disk_cache {
            config.cache_dir.clone()
        } else {
            None
        };
        Ok(Executor {
            device,
            renderer: Box::new(CRenderer::new()),
            policy: KernelizePolicy::default(),
            cache: ArtifactCache::new(disk_dir),
            jit: JitCache::new(),
            config,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// (hits, misses) of the compiled-artifact cache.
    pub fn cache_stats(&self) -> (usize, usize) {
        (self.cache.hits(), self.cache.misses())
    }

    /// (hits, misses) of the JIT replay cache.
    pub fn replay_stats(&self) -> (usize, usize) {
        (self.jit.hits(), self.jit.misses())
    }

    /// Compile and run the realized portion of `graph`.
    ///
    /// `inputs` are bound by declaration order and must match the declared
    /// element counts under `bindings`. Inputs written by store nodes are
    /// updated in place. Returns one tensor per marked output.
    pub fn realize(
        &mut self,
        graph: &Graph,
        inputs: &mut [HostTensor],
        bindings: &Bindings,
    ) -> Result<Realized> {
        let start = Instant::now();
        self.validate_inputs(graph, inputs, bindings)?;

        let structural = structural_key(graph);
        let bound = binding_key(bindings);
        if self.config.jit {
            if let Some(captured) = self.jit.lookup_bound(structural, bound) {
                let outputs = self.execute(&captured.plan, &captured.kernels, inputs)?;
                info!("replayed plan in {:.1?}", start.elapsed());
                return Ok(Realized { outputs });
            }
            if let Some(search) = self.jit.lookup_search(structural) {
                return self.rebind(graph, &search, inputs, bindings, structural, bound, start);
            }
        }

        let kg = kernelize(graph, &self.policy)?;
        let plan = schedule(graph, &kg, bindings)?;

        let mut estimator: Box<dyn CostEstimator> = match self.config.cost_mode {
            CostMode::Analytic => Box::new(AnalyticCost::new()),
            CostMode::Empirical => Box::new(EmpiricalCost::new(Arc::clone(&self.device))),
        };
        let mut compiled = Vec::with_capacity(plan.kernels.len());
        let mut tuned: FxHashMap<u64, Vec<OptAction>> = FxHashMap::default();
        for kernel in &plan.kernels {
            let (best, cost) = self.search(kernel, estimator.as_mut());
            debug!("kernel {}: {} actions, cost {cost:.3e}", kernel.name, best.actions.len());
            let (variant, artifact) = self.compile_with_fallback(kernel, best)?;
            tuned.insert(kernel.fingerprint, variant.actions);
            compiled.push(artifact);
        }

        let outputs = self.execute(&plan, &compiled, inputs)?;
        info!(
            "realized {} kernels in {:.1?} (cache: {} hits, {} misses)",
            plan.kernels.len(),
            start.elapsed(),
            self.cache.hits(),
            self.cache.misses()
        );
        if self.config.jit {
            self.jit.capture_search(structural, kg, tuned);
            self.jit.capture_bound(structural, bound, plan, compiled);
        }
        Ok(Realized { outputs })
    }

    /// Replay a structurally known graph under fresh bindings: re-resolve
    /// shapes over the captured partition and re-apply the captured action
    /// lists, skipping kernelize and the plan search.
    #[allow(clippy::too_many_arguments)]
    fn rebind(
        &mut self,
        graph: &Graph,
        search: &CapturedSearch,
        inputs: &mut [HostTensor],
        bindings: &Bindings,
        structural: u64,
        bound: u64,
        start: Instant,
    ) -> Result<Realized> {
        let plan = schedule(graph, &search.partition, bindings)?;
        let mut compiled = Vec::with_capacity(plan.kernels.len());
        for kernel in &plan.kernels {
            let actions: &[OptAction] = search
                .tuned
                .get(&kernel.fingerprint)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let variant = reapply(kernel, actions, self.device.profile());
            let (_, artifact) = self.compile_with_fallback(kernel, variant)?;
            compiled.push(artifact);
        }
        let outputs = self.execute(&plan, &compiled, inputs)?;
        info!(
            "rebound plan ({} kernels) in {:.1?}",
            plan.kernels.len(),
            start.elapsed()
        );
        self.jit.capture_bound(structural, bound, plan, compiled);
        Ok(Realized { outputs })
    }

    /// Render and compile `best`, stepping back through its action
    /// prefixes when the backend rejects a variant. Every prefix was a
    /// live search state, so the ladder ends at the always-renderable
    /// untransformed plan; the error surfaces only when nothing compiles.
    fn compile_with_fallback(
        &mut self,
        kernel: &ExecKernel,
        best: KernelPlan,
    ) -> Result<(KernelPlan, Arc<dyn CompiledKernel>)> {
        let mut candidate = best;
        let mut last: Option<CompileError> = None;
        loop {
            match self.renderer.render(&candidate, self.device.profile()) {
                Ok(rendered) => {
                    let key = CacheKey::new(
                        &candidate,
                        self.device.name(),
                        self.device.compiler().version(),
                    );
                    match self
                        .cache
                        .get_or_compile(&key, &candidate, &rendered, self.device.as_ref())
                    {
                        Ok(artifact) => return Ok((candidate, artifact)),
                        Err(Error::Compile(err)) => {
                            warn!(
                                "variant {:?} of {} failed to compile: {err}",
                                candidate.actions, kernel.name
                            );
                            last = Some(err);
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(rejection) => {
                    last = Some(CompileError {
                        backend: self.renderer.target().to_string(),
                        kernel: kernel.name.clone(),
                        message: rejection.to_string(),
                    });
                }
            }
            if candidate.actions.is_empty() {
                let Some(last) = last else {
                    unreachable!("a failure precedes exhaustion");
                };
                return Err(Error::VariantsExhausted {
                    kernel: kernel.name.clone(),
                    last,
                });
            }
            let prefix = candidate.actions[..candidate.actions.len() - 1].to_vec();
            candidate = reapply(kernel, &prefix, self.device.profile());
        }
    }

    /// Per-kernel plan search under the configured budget and cost model.
    fn search(
        &self,
        kernel: &crate::schedule::ExecKernel,
        estimator: &mut dyn CostEstimator,
    ) -> (KernelPlan, f32) {
        let profile = self.device.profile();
        if self.config.show_progress {
            BeamSearchOptimizer::new()
                .with_progress()
                .with_beam_width(self.config.beam_width)
                .with_max_steps(self.config.opt_budget)
                .optimize(kernel, profile, self.renderer.as_ref(), estimator)
        } else {
            BeamSearchOptimizer::new()
                .without_progress()
                .with_beam_width(self.config.beam_width)
                .with_max_steps(self.config.opt_budget)
                .optimize(kernel, profile, self.renderer.as_ref(), estimator)
        }
    }

    fn validate_inputs(
        &self,
        graph: &Graph,
        inputs: &[HostTensor],
        bindings: &Bindings,
    ) -> Result<()> {
        let num_inputs = graph.num_inputs();
        if inputs.len() > num_inputs {
            return Err(Error::InputSizeMismatch {
                index: num_inputs,
                expected: 0,
                got: inputs[num_inputs].elements(),
            });
        }
        for i in 0..graph.len() {
            let node = graph.node(NodeId(i as u32));
            if let OpKind::Input { index } = node.kind {
                let expected = num_elements(&resolve_shape(&node.shape, bindings)?).max(1);
                let got = inputs.get(index).map(|t| t.elements()).unwrap_or(0);
                if got != expected {
                    return Err(Error::InputSizeMismatch {
                        index,
                        expected,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a plan's items in order, write store results back into `inputs`,
    /// and read the requested outputs.
    fn execute(
        &self,
        plan: &SchedulePlan,
        kernels: &[Arc<dyn CompiledKernel>],
        inputs: &mut [HostTensor],
    ) -> Result<Vec<(NodeId, HostTensor)>> {
        let mut buffers: FxHashMap<BufferId, Box<dyn DeviceBuffer>> = FxHashMap::default();
        for (i, tensor) in inputs.iter().enumerate() {
            let mut buf = self.device.alloc(tensor.data.len(), tensor.dtype)?;
            buf.write_from_host(&tensor.data)?;
            buffers.insert(BufferId(i), buf);
        }

        for item in &plan.items {
            match item {
                ScheduleItem::Alloc {
                    buffer,
                    dtype,
                    elements,
                } => {
                    let buf = self.device.alloc(elements * dtype.size_in_bytes(), *dtype)?;
                    buffers.insert(*buffer, buf);
                }
                ScheduleItem::Launch { kernel } => {
                    self.launch(plan, *kernel, &kernels[*kernel], &mut buffers)?;
                }
                ScheduleItem::Free { buffer } => {
                    buffers.remove(buffer);
                }
            }
        }
        self.device.synchronize()?;

        // In-place stores update the caller's tensors.
        let mut written: Vec<BufferId> = plan
            .kernels
            .iter()
            .map(|k| k.output_buffer())
            .filter(|b| b.0 < plan.num_inputs)
            .collect();
        written.sort();
        written.dedup();
        for buf in written {
            inputs[buf.0].data = buffers[&buf].read_to_host()?;
        }

        let mut outputs = Vec::with_capacity(plan.outputs.len());
        for &(node, buf) in &plan.outputs {
            let Some(kernel) = plan.kernels.iter().find(|k| k.output_buffer() == buf) else {
                unreachable!("every output buffer has a producing kernel");
            };
            let data = buffers[&buf].read_to_host()?;
            outputs.push((
                node,
                HostTensor {
                    data,
                    shape: kernel.out_shape.clone(),
                    dtype: kernel.dtype,
                },
            ));
        }
        Ok(outputs)
    }

    /// One launch with argument binding and transient-failure retry.
    ///
    /// A store kernel may read the buffer it writes. The borrow rules of the
    /// launch signature forbid passing the same buffer twice, so an aliased
    /// input occurrence gets a scratch copy taken before the launch; the
    /// result is exact because the copy precedes any write.
    fn launch(
        &self,
        plan: &SchedulePlan,
        index: usize,
        compiled: &Arc<dyn CompiledKernel>,
        buffers: &mut FxHashMap<BufferId, Box<dyn DeviceBuffer>>,
    ) -> Result<()> {
        let kernel = &plan.kernels[index];
        let out_id = kernel.output_buffer();
        let (input_ids, _) = kernel.args.split_at(kernel.args.len() - 1);

        let mut taken: Vec<(Option<BufferId>, Box<dyn DeviceBuffer>)> = Vec::new();
        for &id in input_ids {
            if id == out_id {
                let original = match buffers.get(&id) {
                    Some(buf) => buf,
                    None => unreachable!("schedule allocates every buffer before use"),
                };
                let mut scratch = self.device.alloc(original.byte_len(), original.dtype())?;
                scratch.write_from_host(&original.read_to_host()?)?;
                taken.push((None, scratch));
            } else {
                let Some(buf) = buffers.remove(&id) else {
                    unreachable!("schedule allocates every buffer before use");
                };
                taken.push((Some(id), buf));
            }
        }
        let Some(out_buf) = buffers.remove(&out_id) else {
            unreachable!("schedule allocates every buffer before use");
        };
        taken.push((Some(out_id), out_buf));

        let retry = self.config.retry;
        let mut attempt = 0;
        let result = loop {
            let mut refs: Vec<&mut dyn DeviceBuffer> =
                taken.iter_mut().map(|(_, b)| b.as_mut()).collect();
            match compiled.launch(&mut refs) {
                Ok(()) => break Ok(()),
                Err(err) if err.is_transient() && attempt < retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "transient failure of {} (attempt {attempt}): {err}",
                        kernel.name
                    );
                    std::thread::sleep(retry.backoff(attempt));
                }
                Err(err) => break Err(err),
            }
        };
        for (id, buf) in taken {
            if let Some(id) = id {
                buffers.insert(id, buf);
            }
        }
        result?;
        Ok(())
    }
}

/// Structural replay key: the realized roots' graph structure, independent
/// of the bindings. Cheap to compute up front, before any pipeline work.
fn structural_key(graph: &Graph) -> u64 {
    let mut roots = graph.outputs();
    for store in graph.stores() {
        if !roots.contains(&store) {
            roots.push(store);
        }
    }
    let mut h = FxHasher::default();
    graph.fingerprint(&roots).hash(&mut h);
    h.finish()
}

/// Hash of the sorted binding pairs, the second half of the bound key.
fn binding_key(bindings: &Bindings) -> u64 {
    let mut h = FxHasher::default();
    let mut pairs: Vec<(&String, &i64)> = bindings.iter().collect();
    pairs.sort();
    for (name, value) in pairs {
        name.hash(&mut h);
        value.hash(&mut h);
    }
    h.finish()
}

/// Rebuild the plan an action list reaches from the untransformed plan.
/// An action that no longer applies (a split factor that stopped dividing
/// under new bindings, say) ends the rebuild there; every plan of a kernel
/// computes the same values, so any legal prefix is sound.
fn reapply(kernel: &ExecKernel, actions: &[OptAction], profile: &DeviceProfile) -> KernelPlan {
    let mut plan = KernelPlan::from_kernel(kernel);
    for action in actions {
        match plan.apply(action, profile) {
            Some(next) => plan = next,
            None => {
                debug!("action {action} no longer applies to {}", kernel.name);
                break;
            }
        }
    }
    plan
}
