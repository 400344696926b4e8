//! In-process reference backend.
//!
//! Buffers live in host memory and "compilation" binds an interpreter over
//! the kernel's op list. The interpreter walks the output space element by
//! element and ignores the plan's iteration structure entirely, which is
//! what makes it a trustworthy reference: every plan of a kernel computes
//! the same values by construction. Launches run synchronously but the
//! enqueue/synchronize surface is modeled so callers behave the same
//! against an asynchronous device.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::trace;

use super::{BackendCompiler, CompiledKernel, Device, DeviceBuffer, DeviceProfile};
use crate::dtype::DType;
use crate::error::{AllocError, CompileError, ExecError};
use crate::graph::{OpKind, ReduceOp};
use crate::kernelize::KSrc;
use crate::opt::KernelPlan;
use crate::render::RenderedKernel;
use crate::schedule::ExecKernel;
use crate::shape::view::unravel;
use crate::shape::{contiguous_strides, num_elements};

pub struct HostDevice {
    profile: DeviceProfile,
    compiler: HostCompiler,
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice {
            profile: DeviceProfile::default(),
            compiler: HostCompiler,
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn compiler(&self) -> &dyn BackendCompiler {
        &self.compiler
    }

    fn alloc(&self, bytes: usize, dtype: DType) -> Result<Box<dyn DeviceBuffer>, AllocError> {
        Ok(Box::new(HostBuffer {
            data: vec![0u8; bytes],
            dtype,
        }))
    }

    fn synchronize(&self) -> Result<(), ExecError> {
        // Launches complete before `launch` returns.
        Ok(())
    }
}

pub struct HostBuffer {
    data: Vec<u8>,
    dtype: DType,
}

impl DeviceBuffer for HostBuffer {
    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn write_from_host(&mut self, data: &[u8]) -> Result<(), ExecError> {
        if data.len() != self.data.len() {
            return Err(copy_error(format!(
                "host write of {} bytes into a {} byte buffer",
                data.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(data);
        Ok(())
    }

    fn read_to_host(&self) -> Result<Vec<u8>, ExecError> {
        Ok(self.data.clone())
    }
}

fn copy_error(message: String) -> ExecError {
    ExecError {
        device: "host".to_string(),
        kernel: "copy".to_string(),
        message,
        transient: false,
    }
}

pub struct HostCompiler;

impl BackendCompiler for HostCompiler {
    fn version(&self) -> &str {
        concat!("interp-", env!("CARGO_PKG_VERSION"))
    }

    fn compile(
        &self,
        plan: &KernelPlan,
        rendered: &RenderedKernel,
    ) -> Result<Box<dyn CompiledKernel>, CompileError> {
        if rendered.manifest.args.len() != plan.kernel.args.len() {
            return Err(CompileError {
                backend: "host".to_string(),
                kernel: plan.kernel.name.clone(),
                message: format!(
                    "manifest declares {} arguments, kernel takes {}",
                    rendered.manifest.args.len(),
                    plan.kernel.args.len()
                ),
            });
        }
        trace!("bound interpreter for {}", plan.kernel.name);
        Ok(Box::new(HostKernel {
            kernel: plan.kernel.clone(),
            entry: rendered.manifest.entry_point.clone(),
            elapsed: Mutex::new(None),
        }))
    }
}

struct HostKernel {
    kernel: ExecKernel,
    entry: String,
    elapsed: Mutex<Option<Duration>>,
}

impl CompiledKernel for HostKernel {
    fn entry_point(&self) -> &str {
        &self.entry
    }

    fn launch(&self, args: &mut [&mut (dyn DeviceBuffer + '_)]) -> Result<(), ExecError> {
        let start = Instant::now();
        let k = &self.kernel;
        let n_inputs = k.input_shapes.len();
        if args.len() != n_inputs + 1 {
            return Err(self.error(format!(
                "launch with {} buffers, expected {}",
                args.len(),
                n_inputs + 1
            )));
        }
        // Snapshot the inputs first so an in-place store that reads its own
        // target sees the pre-launch contents.
        let mut inputs = Vec::with_capacity(n_inputs);
        for arg in args[..n_inputs].iter() {
            inputs.push(arg.read_to_host()?);
        }

        let out_elems = num_elements(&k.out_shape).max(1);
        let out_bytes = out_elems * k.dtype.size_in_bytes();
        if args[n_inputs].byte_len() != out_bytes {
            return Err(self.error(format!(
                "output buffer holds {} bytes, kernel writes {}",
                args[n_inputs].byte_len(),
                out_bytes
            )));
        }

        let interp = Interp { k, inputs: &inputs };
        let mut out = vec![0u8; out_bytes];
        let last = KSrc::Op(k.ops.len() - 1);
        for lin in 0..out_elems {
            let coords = unravel(lin, &k.out_shape);
            let value = interp.eval(last, &coords).map_err(|m| self.error(m))?;
            store_scalar(&mut out, k.dtype, lin, value);
        }
        args[n_inputs].write_from_host(&out)?;

        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner()) = Some(start.elapsed());
        Ok(())
    }

    fn elapsed(&self) -> Option<Duration> {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HostKernel {
    fn error(&self, message: String) -> ExecError {
        ExecError {
            device: "host".to_string(),
            kernel: self.kernel.name.clone(),
            message,
            transient: false,
        }
    }
}

/// Element-at-a-time evaluator over a kernel's op list. Values are widened
/// to f64 between ops; `Cast` applies the target dtype's conversion.
struct Interp<'a> {
    k: &'a ExecKernel,
    inputs: &'a [Vec<u8>],
}

impl Interp<'_> {
    fn src_shape(&self, src: KSrc) -> &[usize] {
        match src {
            KSrc::Op(j) => &self.k.ops[j].shape,
            KSrc::Ext(i) => &self.k.input_shapes[i],
        }
    }

    /// Evaluate a child, collapsing coordinates for scalar operands.
    fn child(&self, src: KSrc, coords: &[usize]) -> Result<f64, String> {
        if self.src_shape(src).is_empty() {
            self.eval(src, &[])
        } else {
            self.eval(src, coords)
        }
    }

    fn eval(&self, src: KSrc, coords: &[usize]) -> Result<f64, String> {
        match src {
            KSrc::Ext(i) => {
                let idx = ravel(coords, &self.k.input_shapes[i]);
                load_scalar(&self.inputs[i], self.k.input_dtypes[i], idx)
            }
            KSrc::Op(j) => {
                let op = &self.k.ops[j];
                match &op.kind {
                    OpKind::Const(c) => Ok(c.as_f64()),
                    OpKind::Contiguous => self.child(op.src[0], coords),
                    OpKind::View(chain) => {
                        let lin = chain.index(coords);
                        if lin < 0 {
                            return Err(format!("view resolved to negative offset {lin}"));
                        }
                        let shape = self.src_shape(op.src[0]).to_vec();
                        self.eval(op.src[0], &unravel(lin as usize, &shape))
                    }
                    OpKind::Cast(dtype) => Ok(cast_f64(self.child(op.src[0], coords)?, *dtype)),
                    OpKind::Neg => Ok(-self.child(op.src[0], coords)?),
                    OpKind::Recip => Ok(1.0 / self.child(op.src[0], coords)?),
                    OpKind::Sqrt => Ok(self.child(op.src[0], coords)?.sqrt()),
                    OpKind::Sin => Ok(self.child(op.src[0], coords)?.sin()),
                    OpKind::Log2 => Ok(self.child(op.src[0], coords)?.log2()),
                    OpKind::Exp2 => Ok(self.child(op.src[0], coords)?.exp2()),
                    OpKind::Add => {
                        Ok(self.child(op.src[0], coords)? + self.child(op.src[1], coords)?)
                    }
                    OpKind::Mul => {
                        Ok(self.child(op.src[0], coords)? * self.child(op.src[1], coords)?)
                    }
                    OpKind::Max => {
                        Ok(self.child(op.src[0], coords)?.max(self.child(op.src[1], coords)?))
                    }
                    OpKind::Rem => {
                        let a = self.child(op.src[0], coords)? as i64;
                        let b = self.child(op.src[1], coords)? as i64;
                        if b == 0 {
                            return Err("remainder by zero".to_string());
                        }
                        Ok((a % b) as f64)
                    }
                    OpKind::LessThan => Ok(
                        (self.child(op.src[0], coords)? < self.child(op.src[1], coords)?) as u8
                            as f64,
                    ),
                    OpKind::Where => {
                        if self.child(op.src[0], coords)? != 0.0 {
                            self.child(op.src[1], coords)
                        } else {
                            self.child(op.src[2], coords)
                        }
                    }
                    OpKind::Reduce { op: rop, axes } => self.reduce(*rop, axes, op.src[0], coords),
                    OpKind::Input { .. } | OpKind::Store => {
                        unreachable!("kernelization rewrites inputs and stores")
                    }
                }
            }
        }
    }

    fn reduce(
        &self,
        rop: ReduceOp,
        axes: &[usize],
        src: KSrc,
        out_coords: &[usize],
    ) -> Result<f64, String> {
        let shape = self.src_shape(src).to_vec();
        let sizes: Vec<usize> = axes.iter().map(|&a| shape[a]).collect();
        let mut acc = rop.identity();
        if sizes.iter().any(|&s| s == 0) {
            return Ok(acc);
        }
        let mut counter = vec![0usize; axes.len()];
        'odometer: loop {
            let mut full = Vec::with_capacity(shape.len());
            let mut oi = 0;
            for d in 0..shape.len() {
                if let Some(pos) = axes.iter().position(|&a| a == d) {
                    full.push(counter[pos]);
                } else {
                    full.push(out_coords[oi]);
                    oi += 1;
                }
            }
            let v = self.eval(src, &full)?;
            acc = match rop {
                ReduceOp::Sum => acc + v,
                ReduceOp::Max => acc.max(v),
            };
            let mut d = counter.len();
            loop {
                if d == 0 {
                    break 'odometer;
                }
                d -= 1;
                counter[d] += 1;
                if counter[d] < sizes[d] {
                    break;
                }
                counter[d] = 0;
            }
        }
        Ok(acc)
    }
}

fn ravel(coords: &[usize], shape: &[usize]) -> usize {
    coords
        .iter()
        .zip(contiguous_strides(shape))
        .map(|(&c, w)| c * w as usize)
        .sum()
}

fn load_scalar(bytes: &[u8], dtype: DType, idx: usize) -> Result<f64, String> {
    let size = dtype.size_in_bytes();
    let at = idx * size;
    let Some(chunk) = bytes.get(at..at + size) else {
        return Err(format!("read of element {idx} past buffer end"));
    };
    Ok(match dtype {
        DType::F32 => f32::from_ne_bytes(chunk.try_into().map_err(|_| "short read")?) as f64,
        DType::F64 => f64::from_ne_bytes(chunk.try_into().map_err(|_| "short read")?),
        DType::I32 => i32::from_ne_bytes(chunk.try_into().map_err(|_| "short read")?) as f64,
        DType::I64 => i64::from_ne_bytes(chunk.try_into().map_err(|_| "short read")?) as f64,
        DType::U8 => chunk[0] as f64,
        DType::Bool => (chunk[0] != 0) as u8 as f64,
    })
}

fn store_scalar(bytes: &mut [u8], dtype: DType, idx: usize, value: f64) {
    let size = dtype.size_in_bytes();
    let at = idx * size;
    match dtype {
        DType::F32 => bytes[at..at + 4].copy_from_slice(&(value as f32).to_ne_bytes()),
        DType::F64 => bytes[at..at + 8].copy_from_slice(&value.to_ne_bytes()),
        DType::I32 => bytes[at..at + 4].copy_from_slice(&(value as i32).to_ne_bytes()),
        DType::I64 => bytes[at..at + 8].copy_from_slice(&(value as i64).to_ne_bytes()),
        DType::U8 => bytes[at] = value as u8,
        DType::Bool => bytes[at] = (value != 0.0) as u8,
    }
}

fn cast_f64(value: f64, dtype: DType) -> f64 {
    match dtype {
        DType::F32 => value as f32 as f64,
        DType::F64 => value,
        DType::I32 => value as i32 as f64,
        DType::I64 => value as i64 as f64,
        DType::U8 => value as u8 as f64,
        DType::Bool => (value != 0.0) as u8 as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;
    use crate::graph::Graph;
    use crate::kernelize::{kernelize, KernelizePolicy};
    use crate::render::{CRenderer, Renderer};
    use crate::schedule::{schedule, BufferId, ScheduleItem, SchedulePlan};
    use crate::shape::expr::Bindings;
    use crate::shape::ShapeExpr;
    use rustc_hash::FxHashMap;

    fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
        dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
    }

    fn as_bytes(data: &[f32]) -> Vec<u8> {
        data.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn as_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Run a schedule on the host device and return the first output.
    fn run(plan: &SchedulePlan, inputs: &[Vec<f32>]) -> Vec<f32> {
        let device = HostDevice::new();
        let renderer = CRenderer::new();
        let mut buffers: FxHashMap<BufferId, Box<dyn DeviceBuffer>> = FxHashMap::default();
        for (i, data) in inputs.iter().enumerate() {
            let mut buf = device
                .alloc(data.len() * 4, crate::dtype::DType::F32)
                .unwrap();
            buf.write_from_host(&as_bytes(data)).unwrap();
            buffers.insert(BufferId(i), buf);
        }
        for item in &plan.items {
            match item {
                ScheduleItem::Alloc {
                    buffer,
                    dtype,
                    elements,
                } => {
                    let buf = device.alloc(elements * dtype.size_in_bytes(), *dtype).unwrap();
                    buffers.insert(*buffer, buf);
                }
                ScheduleItem::Launch { kernel } => {
                    let k = &plan.kernels[*kernel];
                    let kplan = KernelPlan::from_kernel(k);
                    let rendered = renderer.render(&kplan, device.profile()).unwrap();
                    let compiled = device.compiler().compile(&kplan, &rendered).unwrap();
                    let ids = k.args.clone();
                    let mut taken: Vec<Box<dyn DeviceBuffer>> = ids
                        .iter()
                        .map(|id| buffers.remove(id).unwrap())
                        .collect();
                    let mut refs: Vec<&mut dyn DeviceBuffer> =
                        taken.iter_mut().map(|b| b.as_mut()).collect();
                    compiled.launch(&mut refs).unwrap();
                    assert!(compiled.elapsed().is_some());
                    for (id, buf) in ids.into_iter().zip(taken) {
                        buffers.insert(id, buf);
                    }
                }
                ScheduleItem::Free { buffer } => {
                    buffers.remove(buffer);
                }
            }
        }
        let out = &buffers[&plan.outputs[0].1];
        as_f32(&out.read_to_host().unwrap())
    }

    fn pipeline(g: &Graph) -> SchedulePlan {
        let kg = kernelize(g, &KernelizePolicy::default()).unwrap();
        schedule(g, &kg, &Bindings::new()).unwrap()
    }

    #[test]
    fn test_add_then_reduce_sum() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[3]));
        let b = g.input(crate::dtype::DType::F32, shape(&[3]));
        let _ = (a + b).sum_all().as_output();
        let plan = pipeline(&g);
        let out = run(&plan, &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(out, vec![21.0]);
    }

    #[test]
    fn test_elementwise_chain() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4]));
        let b = g.input(crate::dtype::DType::F32, shape(&[4]));
        let _ = ((a - b) * a).as_output();
        let plan = pipeline(&g);
        let out = run(&plan, &[vec![1.0, 2.0, 3.0, 4.0], vec![4.0, 3.0, 2.0, 1.0]]);
        assert_eq!(out, vec![-3.0, -2.0, 3.0, 12.0]);
    }

    #[test]
    fn test_permute_view_load() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[2, 3]));
        let _ = a.permute(&[1, 0]).contiguous().as_output();
        let plan = pipeline(&g);
        let out = run(&plan, &[vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]]);
        assert_eq!(out, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_where_select() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4]));
        let b = g.input(crate::dtype::DType::F32, shape(&[4]));
        let cond = a.lt(b);
        let w = g.where_(cond.id, a.id, b.id).unwrap();
        g.mark_output(w);
        let plan = pipeline(&g);
        let out = run(&plan, &[vec![1.0, 5.0, 2.0, 8.0], vec![3.0, 3.0, 3.0, 3.0]]);
        assert_eq!(out, vec![1.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn test_max_reduce_over_axis() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[2, 3]));
        let _ = a.max_reduce(vec![1]).as_output();
        let plan = pipeline(&g);
        let out = run(&plan, &[vec![1.0, 7.0, 3.0, 9.0, 2.0, 4.0]]);
        assert_eq!(out, vec![7.0, 9.0]);
    }

    #[test]
    fn test_launch_checks_buffer_sizes() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4]));
        let _ = (a + a).as_output();
        let plan = pipeline(&g);
        let k = &plan.kernels[0];
        let device = HostDevice::new();
        let renderer = CRenderer::new();
        let kplan = KernelPlan::from_kernel(k);
        let rendered = renderer.render(&kplan, device.profile()).unwrap();
        let compiled = device.compiler().compile(&kplan, &rendered).unwrap();
        let mut input = device.alloc(16, crate::dtype::DType::F32).unwrap();
        // Output deliberately too small.
        let mut output = device.alloc(8, crate::dtype::DType::F32).unwrap();
        let mut refs: Vec<&mut dyn DeviceBuffer> = vec![input.as_mut(), output.as_mut()];
        let err = compiled.launch(&mut refs).unwrap_err();
        assert!(!err.is_transient());
    }
}
