//! Linearizes the kernel DAG into an executable plan.
//!
//! The scheduler topologically sorts kernels (ties broken by creation order,
//! so identical graphs always produce identical plans), resolves symbolic
//! dimensions against caller bindings, and reference-counts buffer lifetimes:
//! every intermediate buffer is allocated before its producing launch and
//! freed exactly once, strictly after its last consuming launch.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::hash::{Hash, Hasher};

use log::debug;
use rustc_hash::{FxHashMap, FxHasher};

use crate::dtype::DType;
use crate::error::Result;
use crate::graph::{Graph, NodeId, OpKind};
use crate::kernelize::{ExtSrc, KSrc, KernelDest, KernelGraph};
use crate::shape::expr::Bindings;
use crate::shape::{num_elements, resolve_shape};

/// A device buffer slot in a plan. Ids below the graph's input count refer
/// to caller-owned input buffers; the rest are plan-owned intermediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

/// One step of the linear plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleItem {
    Alloc {
        buffer: BufferId,
        dtype: DType,
        elements: usize,
    },
    Launch {
        /// Index into [`SchedulePlan::kernels`].
        kernel: usize,
    },
    Free {
        buffer: BufferId,
    },
}

/// A kernel member op with shapes resolved to concrete sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOp {
    pub kind: OpKind,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub src: Vec<KSrc>,
}

/// A kernel ready for optimization, rendering and launch: concrete shapes
/// and bound buffer arguments (inputs in slot order, output last).
#[derive(Debug, Clone)]
pub struct ExecKernel {
    pub name: String,
    pub fingerprint: u64,
    pub ops: Vec<ExecOp>,
    /// Buffer bound to each input slot, then the output buffer.
    pub args: Vec<BufferId>,
    pub input_shapes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<DType>,
    pub out_shape: Vec<usize>,
    pub dtype: DType,
    /// Sizes of the reduced axes, if this kernel reduces.
    pub reduce_sizes: Vec<usize>,
}

impl ExecKernel {
    pub fn output_buffer(&self) -> BufferId {
        *self.args.last().expect("kernel has an output argument")
    }

    /// Total iteration points: output elements times reduction extent.
    pub fn iteration_points(&self) -> usize {
        num_elements(&self.out_shape) * self.reduce_sizes.iter().product::<usize>().max(1)
    }
}

/// The linear execution plan for one realize request.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub items: Vec<ScheduleItem>,
    pub kernels: Vec<ExecKernel>,
    /// Requested output node -> buffer holding its result.
    pub outputs: Vec<(NodeId, BufferId)>,
    pub num_inputs: usize,
    /// Structural fingerprint of (graph, kernels, bindings). Two requests
    /// with the same fingerprint produce byte-identical plans.
    pub fingerprint: u64,
}

/// Build a plan from a kernel graph.
pub fn schedule(graph: &Graph, kg: &KernelGraph, bindings: &Bindings) -> Result<SchedulePlan> {
    let n = kg.kernels.len();
    let num_inputs = graph.num_inputs();

    // Kahn's algorithm with a min-heap: among ready kernels, the earliest
    // created runs first. Creation order is itself topological, so this is
    // purely a determinism guarantee, not a correctness requirement.
    let mut indegree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, k) in kg.kernels.iter().enumerate() {
        for dep in &k.after {
            successors[dep.0].push(i);
            indegree[i] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &s in &successors[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push(Reverse(s));
            }
        }
    }
    debug_assert_eq!(order.len(), n, "kernel graph is acyclic");

    // Resolve shapes and assign buffers.
    let mut next_buffer = num_inputs;
    let mut kernel_buffer: FxHashMap<usize, BufferId> = FxHashMap::default();
    let mut kernels = Vec::with_capacity(n);
    for &ki in &order {
        let k = &kg.kernels[ki];
        let ops: Vec<ExecOp> = k
            .ops
            .iter()
            .map(|op| {
                Ok(ExecOp {
                    kind: op.kind.clone(),
                    dtype: op.dtype,
                    shape: resolve_shape(&op.shape, bindings)?,
                    src: op.src.clone(),
                })
            })
            .collect::<Result<_>>()?;
        let out_shape = resolve_shape(&k.shape, bindings)?;
        let mut args = Vec::with_capacity(k.inputs.len() + 1);
        let mut input_shapes = Vec::with_capacity(k.inputs.len());
        let mut input_dtypes = Vec::with_capacity(k.inputs.len());
        for input in &k.inputs {
            let buf = match input.src {
                ExtSrc::GraphInput(i) => BufferId(i),
                ExtSrc::Kernel(kid) => kernel_buffer[&kid.0],
            };
            args.push(buf);
            input_shapes.push(resolve_shape(&input.shape, bindings)?);
            input_dtypes.push(input.dtype);
        }
        let out_buf = match k.dest {
            KernelDest::GraphInput(i) => BufferId(i),
            KernelDest::Buffer => {
                let b = BufferId(next_buffer);
                next_buffer += 1;
                b
            }
        };
        args.push(out_buf);
        kernel_buffer.insert(ki, out_buf);

        let reduce_sizes = match k.reduce_op() {
            Some(op) => {
                let full = resolve_shape(
                    // The reduce's source shape carries the reduced axes.
                    &reduce_source_shape(k, op),
                    bindings,
                )?;
                match &op.kind {
                    OpKind::Reduce { axes, .. } => {
                        axes.iter().map(|&a| full[a]).collect()
                    }
                    _ => unreachable!(),
                }
            }
            None => Vec::new(),
        };

        kernels.push(ExecKernel {
            name: k.name.clone(),
            fingerprint: k.fingerprint,
            ops,
            args,
            input_shapes,
            input_dtypes,
            out_shape,
            dtype: k.dtype,
            reduce_sizes,
        });
    }

    // Reference-count intermediate buffers across launches.
    let output_buffers: Vec<(NodeId, BufferId)> = kg
        .outputs
        .iter()
        .map(|&(node, kid)| (node, kernel_buffer[&kid.0]))
        .collect();
    let mut last_use: FxHashMap<BufferId, usize> = FxHashMap::default();
    for (launch_idx, k) in kernels.iter().enumerate() {
        for &arg in &k.args {
            last_use.insert(arg, launch_idx);
        }
    }

    let mut items = Vec::new();
    for (launch_idx, k) in kernels.iter().enumerate() {
        // Allocate the output buffer right before its producing launch.
        let out = k.output_buffer();
        if out.0 >= num_inputs {
            items.push(ScheduleItem::Alloc {
                buffer: out,
                dtype: k.dtype,
                elements: num_elements(&k.out_shape).max(1),
            });
        }
        items.push(ScheduleItem::Launch { kernel: launch_idx });
        // Free every intermediate whose last use this launch was, unless it
        // holds a requested output.
        let mut frees: Vec<BufferId> = last_use
            .iter()
            .filter(|&(&buf, &last)| {
                last == launch_idx
                    && buf.0 >= num_inputs
                    && !output_buffers.iter().any(|&(_, ob)| ob == buf)
            })
            .map(|(&buf, _)| buf)
            .collect();
        frees.sort();
        for buf in frees {
            items.push(ScheduleItem::Free { buffer: buf });
        }
    }

    let fingerprint = plan_fingerprint(graph, kg, bindings);
    debug!(
        "scheduled {} kernels, {} items, fp {fingerprint:016x}",
        kernels.len(),
        items.len()
    );
    Ok(SchedulePlan {
        items,
        kernels,
        outputs: output_buffers,
        num_inputs,
        fingerprint,
    })
}

/// Shape of a reduce op's source inside the kernel (it carries the axes
/// being reduced).
fn reduce_source_shape<'k>(
    k: &'k crate::kernelize::KernelNode,
    reduce: &crate::kernelize::KernelOp,
) -> Vec<crate::shape::ShapeExpr> {
    match reduce.src[0] {
        KSrc::Op(i) => k.ops[i].shape.clone(),
        KSrc::Ext(i) => k.inputs[i].shape.clone(),
    }
}

/// Fingerprint of (graph structure, kernel structure, shape bindings).
/// Differing bindings fingerprint differently by construction.
fn plan_fingerprint(graph: &Graph, kg: &KernelGraph, bindings: &Bindings) -> u64 {
    let mut h = FxHasher::default();
    let roots: Vec<NodeId> = kg.outputs.iter().map(|&(n, _)| n).collect();
    graph.fingerprint(&roots).hash(&mut h);
    for k in &kg.kernels {
        k.fingerprint.hash(&mut h);
    }
    let mut keys: Vec<(&String, &i64)> = bindings.iter().collect();
    keys.sort();
    for (name, value) in keys {
        name.hash(&mut h);
        value.hash(&mut h);
    }
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ShapeError};
    use crate::graph::Graph;
    use crate::kernelize::{kernelize, KernelizePolicy};
    use crate::shape::ShapeExpr;

    fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
        dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
    }

    fn plan_for(g: &Graph) -> SchedulePlan {
        let kg = kernelize(g, &KernelizePolicy::default()).unwrap();
        schedule(g, &kg, &Bindings::new()).unwrap()
    }

    #[test]
    fn test_alloc_before_launch_free_after_last_use() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[8]));
        let b = g.input(crate::dtype::DType::F32, shape(&[8]));
        let x = (a + b).contiguous();
        let _ = (x * a).sum_all().as_output();
        let plan = plan_for(&g);

        // Track buffer states across the plan.
        let mut allocated: FxHashMap<BufferId, bool> = FxHashMap::default();
        for item in &plan.items {
            match item {
                ScheduleItem::Alloc { buffer, .. } => {
                    assert!(
                        allocated.insert(*buffer, true).is_none(),
                        "double alloc of {buffer:?}"
                    );
                }
                ScheduleItem::Launch { kernel } => {
                    for arg in &plan.kernels[*kernel].args {
                        if arg.0 >= plan.num_inputs {
                            assert_eq!(
                                allocated.get(arg),
                                Some(&true),
                                "launch uses unallocated or freed {arg:?}"
                            );
                        }
                    }
                }
                ScheduleItem::Free { buffer } => {
                    assert_eq!(allocated.insert(*buffer, false), Some(true));
                }
            }
        }
        // The intermediate (x) is freed; the output buffer is not.
        let freed: Vec<_> = plan
            .items
            .iter()
            .filter(|i| matches!(i, ScheduleItem::Free { .. }))
            .collect();
        assert_eq!(freed.len(), 1);
        let out_buf = plan.outputs[0].1;
        assert!(!plan
            .items
            .iter()
            .any(|i| matches!(i, ScheduleItem::Free { buffer } if *buffer == out_buf)));
    }

    #[test]
    fn test_unbound_variable() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, vec![ShapeExpr::var("n")]);
        let _ = (a + a).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        let err = schedule(&g, &kg, &Bindings::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Shape(ShapeError::UnboundVariable { .. })
        ));
        // Supplying the binding recovers.
        let mut bindings = Bindings::new();
        bindings.insert("n".to_string(), 16);
        let plan = schedule(&g, &kg, &bindings).unwrap();
        assert_eq!(plan.kernels[0].out_shape, vec![16]);
    }

    #[test]
    fn test_producers_precede_consumers() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4]));
        let b = g.input(crate::dtype::DType::F32, shape(&[4]));
        let x = (a + b).contiguous();
        let y = (x * b).contiguous();
        let _ = (y + x).as_output();
        let plan = plan_for(&g);
        let mut produced: Vec<BufferId> = (0..plan.num_inputs).map(BufferId).collect();
        for item in &plan.items {
            if let ScheduleItem::Launch { kernel } = item {
                let k = &plan.kernels[*kernel];
                let (inputs, out) = k.args.split_at(k.args.len() - 1);
                for arg in inputs {
                    assert!(produced.contains(arg), "consumer before producer");
                }
                produced.push(out[0]);
            }
        }
    }

    #[test]
    fn test_deterministic_ordering() {
        let build = || {
            let g = Graph::new();
            let a = g.input(crate::dtype::DType::F32, shape(&[4]));
            let b = g.input(crate::dtype::DType::F32, shape(&[4]));
            // Two independent subgraphs.
            let _ = (a + a).contiguous().as_output();
            let _ = (b * b).contiguous().as_output();
            plan_for(&g)
        };
        let p1 = build();
        let p2 = build();
        assert_eq!(p1.items, p2.items);
        assert_eq!(p1.fingerprint, p2.fingerprint);
        let names1: Vec<_> = p1.kernels.iter().map(|k| k.name.clone()).collect();
        let names2: Vec<_> = p2.kernels.iter().map(|k| k.name.clone()).collect();
        assert_eq!(names1, names2);
    }

    #[test]
    fn test_dependent_subgraph_scheduled_after() {
        let g = Graph::new();
        let a = g.input(crate::dtype::DType::F32, shape(&[4]));
        let x = (a + a).contiguous();
        let _ = (x * x).sum_all().as_output();
        let plan = plan_for(&g);
        // x's kernel launches before the consumer.
        let launches: Vec<usize> = plan
            .items
            .iter()
            .filter_map(|i| match i {
                ScheduleItem::Launch { kernel } => Some(*kernel),
                _ => None,
            })
            .collect();
        assert_eq!(launches, vec![0, 1]);
    }
}
