//! C source renderer.
//!
//! Generates a plain C function with one loop nest per kernel plan. The
//! parallel axes become outer loops, the reduce axes inner loops around an
//! accumulator. Unrolled and vector axes become loops with a literal trip
//! count, an exact lowering of both transforms. Local promotion has no
//! counterpart in plain C (there is no work group to share memory across),
//! so plans carrying it are rejected.

use super::{ArgSpec, LaunchManifest, RenderRejection, RenderedKernel, Renderer};
use crate::backend::DeviceProfile;
use crate::dtype::DType;
use crate::graph::{OpKind, ReduceOp};
use crate::kernelize::KSrc;
use crate::opt::{AxisKind, KernelPlan};
use crate::schedule::ExecKernel;
use crate::shape::view::{View, ViewChain};
use crate::shape::contiguous_strides;

pub struct CRenderer {
    indent_size: usize,
}

impl CRenderer {
    pub fn new() -> Self {
        CRenderer { indent_size: 4 }
    }
}

impl Default for CRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for CRenderer {
    fn target(&self) -> &'static str {
        "c"
    }

    fn render(
        &self,
        plan: &KernelPlan,
        _profile: &DeviceProfile,
    ) -> Result<RenderedKernel, RenderRejection> {
        if plan.axes.iter().any(|a| a.kind == AxisKind::Local) {
            return Err(RenderRejection::UnsupportedAction {
                target: self.target(),
                action: "local promotion".to_string(),
            });
        }
        // The loop nest splits at the first reduce-space axis; an output
        // axis behind that point would be read before its loop opens.
        let n_out = plan.num_output_dims();
        let split = plan
            .axes
            .iter()
            .position(|a| a.logical >= n_out)
            .unwrap_or(plan.axes.len());
        if plan.axes[split..].iter().any(|a| a.logical < n_out) {
            return Err(RenderRejection::UnsupportedAction {
                target: self.target(),
                action: "an output axis inside the reduction nest".to_string(),
            });
        }

        let k = &plan.kernel;
        let mut src = String::new();
        src.push_str("#include <math.h>\n#include <limits.h>\n\n");
        src.push_str(&self.signature(k));
        src.push_str(" {\n");
        self.emit_body(plan, &mut src);
        src.push_str("}\n");

        let mut args: Vec<ArgSpec> = k
            .input_dtypes
            .iter()
            .map(|&dtype| ArgSpec {
                dtype,
                mutable: false,
            })
            .collect();
        args.push(ArgSpec {
            dtype: k.dtype,
            mutable: true,
        });
        Ok(RenderedKernel {
            source: src,
            manifest: LaunchManifest {
                entry_point: k.name.clone(),
                global_size: [plan.global_size(), 1, 1],
                local_size: None,
                args,
            },
        })
    }
}

impl CRenderer {
    fn indent(&self, level: usize) -> String {
        " ".repeat(level * self.indent_size)
    }

    fn signature(&self, k: &ExecKernel) -> String {
        // A store kernel can read the buffer it writes, so arguments are
        // deliberately not declared restrict.
        let mut params: Vec<String> = k
            .input_dtypes
            .iter()
            .enumerate()
            .map(|(i, dtype)| format!("const {}* in{}", dtype.c_name(), i))
            .collect();
        params.push(format!("{}* out0", k.dtype.c_name()));
        format!("void {}({})", k.name, params.join(", "))
    }

    fn emit_body(&self, plan: &KernelPlan, src: &mut String) {
        let n_out = plan.num_output_dims();
        let split = plan
            .axes
            .iter()
            .position(|a| a.logical >= n_out)
            .unwrap_or(plan.axes.len());
        let (parallel, reduce) = plan.axes.split_at(split);

        let mut level = 1;
        self.emit_axes(parallel, 0, src, &mut level);

        // Logical output coordinates and the output slot.
        let indent = self.indent(level);
        for d in 0..n_out {
            let expr = logical_coord(plan, d);
            src.push_str(&format!("{indent}const long i{d} = {expr};\n"));
        }
        let out_coords: Vec<String> = (0..n_out).map(|d| format!("i{d}")).collect();
        let out_idx = row_major(&out_coords, &plan.kernel.out_shape);
        src.push_str(&format!("{indent}const long out_idx = {out_idx};\n"));

        let k = &plan.kernel;
        let last = k.ops.len() - 1;
        match k.ops.iter().position(|op| op.kind.is_reduce()) {
            Some(ridx) => {
                let acc_dtype = k.ops[ridx].dtype;
                let (op, axes) = match &k.ops[ridx].kind {
                    OpKind::Reduce { op, axes } => (*op, axes.clone()),
                    _ => unreachable!(),
                };
                src.push_str(&format!(
                    "{indent}{} acc = {};\n",
                    acc_dtype.c_name(),
                    identity_literal(op, acc_dtype)
                ));
                self.emit_axes(reduce, split, src, &mut level);

                let inner = self.indent(level);
                for (j, _) in reduce_logicals(plan, n_out) {
                    let expr = logical_coord(plan, j);
                    src.push_str(&format!("{inner}const long i{j} = {expr};\n"));
                }
                // Source coordinates of the reduction: output coords with
                // the reduced axes spliced back in.
                let src_rank = k.reduce_sizes.len() + n_out;
                let mut coords = Vec::with_capacity(src_rank);
                let mut out_iter = 0..n_out;
                let mut red = 0;
                for j in 0..src_rank {
                    if axes.contains(&j) {
                        coords.push(format!("i{}", n_out + red));
                        red += 1;
                    } else {
                        let d = out_iter.next().unwrap_or(0);
                        coords.push(format!("i{d}"));
                    }
                }
                let value = self.expr(k, k.ops[ridx].src[0], &coords);
                let update = match op {
                    ReduceOp::Sum => format!("acc = acc + {value};"),
                    ReduceOp::Max => format!("acc = {};", max_call(acc_dtype, "acc", &value)),
                };
                src.push_str(&format!("{inner}{update}\n"));
                self.close_axes(reduce, src, &mut level);

                let indent = self.indent(level);
                let result = if last == ridx {
                    "acc".to_string()
                } else {
                    self.expr(k, KSrc::Op(last), &out_coords)
                };
                src.push_str(&format!("{indent}out0[out_idx] = {result};\n"));
            }
            None => {
                let result = self.expr(k, KSrc::Op(last), &out_coords);
                src.push_str(&format!("{indent}out0[out_idx] = {result};\n"));
            }
        }

        self.close_axes(parallel, src, &mut level);
    }

    /// Open one loop per axis. Unrolled and vector axes keep their literal
    /// trip count; a constant short loop is fully unrolled by any C
    /// compiler, so the lowering stays exact without body replication.
    fn emit_axes(
        &self,
        axes: &[crate::opt::Axis],
        base: usize,
        src: &mut String,
        level: &mut usize,
    ) {
        for (off, axis) in axes.iter().enumerate() {
            let var = format!("a{}", base + off);
            let indent = self.indent(*level);
            src.push_str(&format!(
                "{indent}for (long {var} = 0; {var} < {}; {var}++) {{\n",
                axis.size
            ));
            *level += 1;
        }
    }

    fn close_axes(&self, axes: &[crate::opt::Axis], src: &mut String, level: &mut usize) {
        for _ in axes {
            *level -= 1;
            src.push_str(&format!("{}}}\n", self.indent(*level)));
        }
    }

    /// Render the value of `src` as a C expression at `coords` (one
    /// coordinate per dimension of the producing op's shape).
    fn expr(&self, k: &ExecKernel, ksrc: KSrc, coords: &[String]) -> String {
        match ksrc {
            KSrc::Ext(i) => {
                let shape = &k.input_shapes[i];
                if shape.is_empty() {
                    format!("in{i}[0]")
                } else {
                    format!("in{i}[{}]", row_major(coords, shape))
                }
            }
            KSrc::Op(j) => {
                let op = &k.ops[j];
                match &op.kind {
                    OpKind::Const(c) => c.c_literal(),
                    OpKind::View(chain) => self.view_expr(k, op.src[0], chain, coords),
                    OpKind::Contiguous => self.expr(k, op.src[0], coords),
                    OpKind::Cast(dtype) => {
                        let x = self.child(k, op.src[0], coords);
                        if *dtype == DType::Bool {
                            format!("({x} != 0)")
                        } else {
                            format!("(({}){})", dtype.c_name(), x)
                        }
                    }
                    OpKind::Neg => format!("(-{})", self.child(k, op.src[0], coords)),
                    OpKind::Recip => {
                        let one = if op.dtype == DType::F32 { "1.0f" } else { "1.0" };
                        format!("({one} / {})", self.child(k, op.src[0], coords))
                    }
                    OpKind::Sqrt => self.math1(op.dtype, "sqrt", k, op.src[0], coords),
                    OpKind::Sin => self.math1(op.dtype, "sin", k, op.src[0], coords),
                    OpKind::Log2 => self.math1(op.dtype, "log2", k, op.src[0], coords),
                    OpKind::Exp2 => self.math1(op.dtype, "exp2", k, op.src[0], coords),
                    OpKind::Add => self.binary(k, op, "+", coords),
                    OpKind::Mul => self.binary(k, op, "*", coords),
                    OpKind::Rem => self.binary(k, op, "%", coords),
                    OpKind::LessThan => self.binary(k, op, "<", coords),
                    OpKind::Max => {
                        let a = self.child(k, op.src[0], coords);
                        let b = self.child(k, op.src[1], coords);
                        max_call(op.dtype, &a, &b)
                    }
                    OpKind::Where => {
                        let c = self.child(k, op.src[0], coords);
                        let a = self.child(k, op.src[1], coords);
                        let b = self.child(k, op.src[2], coords);
                        format!("({c} ? {a} : {b})")
                    }
                    // The single reduction is materialized into `acc`
                    // before any op that reads it runs.
                    OpKind::Reduce { .. } => "acc".to_string(),
                    OpKind::Input { .. } | OpKind::Store => {
                        unreachable!("kernelization rewrites inputs and stores")
                    }
                }
            }
        }
    }

    /// Child expression, collapsing coordinates for scalar operands.
    fn child(&self, k: &ExecKernel, ksrc: KSrc, coords: &[String]) -> String {
        if src_shape(k, ksrc).is_empty() {
            self.expr(k, ksrc, &[])
        } else {
            self.expr(k, ksrc, coords)
        }
    }

    fn binary(&self, k: &ExecKernel, op: &crate::schedule::ExecOp, sym: &str, coords: &[String]) -> String {
        let a = self.child(k, op.src[0], coords);
        let b = self.child(k, op.src[1], coords);
        format!("({a} {sym} {b})")
    }

    fn math1(&self, dtype: DType, name: &str, k: &ExecKernel, src: KSrc, coords: &[String]) -> String {
        let x = self.child(k, src, coords);
        if dtype == DType::F32 {
            format!("{name}f({x})")
        } else {
            format!("{name}({x})")
        }
    }

    /// A view reference: map `coords` through the chain to a linear offset
    /// in the source's contiguous layout.
    fn view_expr(&self, k: &ExecKernel, src: KSrc, chain: &ViewChain, coords: &[String]) -> String {
        let lin = chain_index(chain, coords);
        match src {
            // External inputs are contiguous; index them directly.
            KSrc::Ext(i) => format!("in{i}[{lin}]"),
            KSrc::Op(_) => {
                let shape = src_shape(k, src);
                let unraveled = unravel_exprs(&lin, shape);
                self.expr(k, src, &unraveled)
            }
        }
    }
}

fn src_shape(k: &ExecKernel, ksrc: KSrc) -> &[usize] {
    match ksrc {
        KSrc::Op(j) => &k.ops[j].shape,
        KSrc::Ext(i) => &k.input_shapes[i],
    }
}

/// Reduce-space logical dims present in the plan, with their first axis.
fn reduce_logicals(plan: &KernelPlan, n_out: usize) -> Vec<(usize, usize)> {
    let mut dims: Vec<(usize, usize)> = Vec::new();
    for (i, axis) in plan.axes.iter().enumerate() {
        if axis.logical >= n_out && !dims.iter().any(|&(d, _)| d == axis.logical) {
            dims.push((axis.logical, i));
        }
    }
    dims.sort();
    dims
}

/// Reconstruct logical dimension `d` from the plan's (possibly split) axes.
fn logical_coord(plan: &KernelPlan, d: usize) -> String {
    let terms: Vec<String> = plan
        .axes
        .iter()
        .enumerate()
        .filter(|(_, a)| a.logical == d)
        .map(|(i, a)| {
            if a.stride == 1 {
                format!("a{i}")
            } else {
                format!("a{i} * {}", a.stride)
            }
        })
        .collect();
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Row-major linearization of symbolic coordinates over a concrete shape.
fn row_major(coords: &[String], shape: &[usize]) -> String {
    let weights = contiguous_strides(shape);
    let terms: Vec<String> = coords
        .iter()
        .zip(&weights)
        .filter(|(_, &w)| w != 0)
        .map(|(c, &w)| if w == 1 { c.clone() } else { format!("{c} * {w}") })
        .collect();
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Symbolic offset of one strided view.
fn view_index(view: &View, coords: &[String]) -> String {
    let mut terms = Vec::new();
    if view.offset != 0 {
        terms.push(format!("{}", view.offset));
    }
    for (c, &s) in coords.iter().zip(&view.strides) {
        match s {
            0 => {}
            1 => terms.push(c.clone()),
            _ => terms.push(format!("{c} * {s}")),
        }
    }
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

/// Split a linear expression back into coordinates over `shape`.
fn unravel_exprs(lin: &str, shape: &[usize]) -> Vec<String> {
    let weights = contiguous_strides(shape);
    shape
        .iter()
        .zip(&weights)
        .map(|(&s, &w)| format!("((({lin}) / {w}) % {s})"))
        .collect()
}

/// Symbolic mirror of `ViewChain::index`: apply the chain innermost-last.
fn chain_index(chain: &ViewChain, coords: &[String]) -> String {
    let views = chain.views();
    let mut lin = view_index(views.last().expect("chain is never empty"), coords);
    for pair in views.windows(2).rev() {
        let inner = &pair[0];
        let inner_coords = unravel_exprs(&lin, &inner.shape);
        lin = view_index(inner, &inner_coords);
    }
    lin
}

fn identity_literal(op: ReduceOp, dtype: DType) -> String {
    match (op, dtype) {
        (ReduceOp::Sum, DType::F32) => "0.0f".to_string(),
        (ReduceOp::Sum, DType::F64) => "0.0".to_string(),
        (ReduceOp::Sum, _) => "0".to_string(),
        (ReduceOp::Max, DType::F32 | DType::F64) => "-INFINITY".to_string(),
        (ReduceOp::Max, DType::I32) => "INT_MIN".to_string(),
        (ReduceOp::Max, DType::I64) => "LLONG_MIN".to_string(),
        (ReduceOp::Max, DType::U8 | DType::Bool) => "0".to_string(),
    }
}

fn max_call(dtype: DType, a: &str, b: &str) -> String {
    match dtype {
        DType::F32 => format!("fmaxf({a}, {b})"),
        DType::F64 => format!("fmax({a}, {b})"),
        _ => format!("(({a} > {b}) ? {a} : {b})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceProfile;
    use crate::kernelize::{kernelize, KernelizePolicy};
    use crate::opt::OptAction;
    use crate::schedule::schedule;
    use crate::shape::expr::Bindings;
    use crate::shape::ShapeExpr;

    fn rendered_for(build: impl Fn(&crate::graph::Graph)) -> Vec<RenderedKernel> {
        let g = crate::graph::Graph::new();
        build(&g);
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        let plan = schedule(&g, &kg, &Bindings::new()).unwrap();
        let renderer = CRenderer::new();
        let profile = DeviceProfile::default();
        plan.kernels
            .iter()
            .map(|k| {
                renderer
                    .render(&KernelPlan::from_kernel(k), &profile)
                    .unwrap()
            })
            .collect()
    }

    fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
        dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
    }

    #[test]
    fn test_elementwise_source_structure() {
        let rendered = rendered_for(|g| {
            let a = g.input(crate::dtype::DType::F32, shape(&[8]));
            let b = g.input(crate::dtype::DType::F32, shape(&[8]));
            let _ = (a + b).as_output();
        });
        assert_eq!(rendered.len(), 1);
        let src = &rendered[0].source;
        assert!(src.contains("const float* in0"));
        assert!(src.contains("float* out0"));
        assert!(src.contains("out0[out_idx] = (in0["));
        assert_eq!(rendered[0].manifest.global_size, [8, 1, 1]);
        assert_eq!(rendered[0].manifest.args.len(), 3);
        assert!(rendered[0].manifest.args[2].mutable);
    }

    #[test]
    fn test_reduce_emits_accumulator() {
        let rendered = rendered_for(|g| {
            let a = g.input(crate::dtype::DType::F32, shape(&[4, 8]));
            let _ = a.sum(vec![1]).as_output();
        });
        let src = &rendered[0].source;
        assert!(src.contains("float acc = 0.0f;"));
        assert!(src.contains("acc = acc +"));
        assert!(src.contains("out0[out_idx] = acc;"));
    }

    #[test]
    fn test_local_promotion_rejected() {
        let g = crate::graph::Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[64]));
        let _ = (a + a).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        let plan = schedule(&g, &kg, &Bindings::new()).unwrap();
        let profile = DeviceProfile::default();
        let base = KernelPlan::from_kernel(&plan.kernels[0]);
        let promoted = base
            .apply(&OptAction::PromoteLocal { axis: 0 }, &profile)
            .unwrap();
        let err = CRenderer::new().render(&promoted, &profile).unwrap_err();
        assert!(matches!(err, RenderRejection::UnsupportedAction { .. }));
    }

    #[test]
    fn test_output_axis_after_reduce_rejected() {
        let g = crate::graph::Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4, 8]));
        let _ = a.sum(vec![1]).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        let plan = schedule(&g, &kg, &Bindings::new()).unwrap();
        let profile = DeviceProfile::default();
        let mut bad = KernelPlan::from_kernel(&plan.kernels[0]);
        // An output axis moved behind the reduce axis, as an unroll of the
        // full output extent would leave it if reordering allowed it.
        bad.axes[0].kind = AxisKind::Unrolled;
        bad.axes.swap(0, 1);
        let err = CRenderer::new().render(&bad, &profile).unwrap_err();
        assert!(matches!(err, RenderRejection::UnsupportedAction { .. }));
    }

    #[test]
    fn test_view_indexing_through_permute() {
        let rendered = rendered_for(|g| {
            let a = g.input(crate::dtype::DType::F32, shape(&[2, 3]));
            let _ = a.permute(&[1, 0]).contiguous().as_output();
        });
        let src = &rendered[0].source;
        // The permuted load uses the transposed stride, the store stays
        // row major over the new shape.
        assert!(src.contains("in0["));
        assert!(src.contains("out0[out_idx]"));
    }

    #[test]
    fn test_split_and_unroll_render() {
        let g = crate::graph::Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[64]));
        let _ = (a * a).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        let plan = schedule(&g, &kg, &Bindings::new()).unwrap();
        let profile = DeviceProfile::default();
        let base = KernelPlan::from_kernel(&plan.kernels[0]);
        let transformed = base
            .apply(&OptAction::Split { axis: 0, factor: 16 }, &profile)
            .unwrap()
            .apply(&OptAction::Unroll { axis: 1, factor: 4 }, &profile)
            .unwrap();
        let rendered = CRenderer::new().render(&transformed, &profile).unwrap();
        // Three loop levels and a recombined logical index.
        assert_eq!(rendered.source.matches("for (long a").count(), 3);
        assert!(rendered.source.contains("const long i0 = a0 * 16 + a1 * 4 + a2;"));
    }
}
