//! Kernel partitioning: cuts the operation graph into maximal fusable
//! kernels with explicit ordering edges.
//!
//! The traversal runs consumer-to-producer from the realize roots. A node
//! fuses into its consumer's kernel unless it sits behind a materialization
//! boundary: an explicit `Contiguous` marker, a second reduction (one
//! reduction per kernel), or a multi-consumer node whose recomputation is
//! judged more expensive than a store/load round trip. Boundary nodes become
//! kernels of their own and consumers read their buffer.
//!
//! Ordering beyond data dependencies is expressed with AFTER edges: stores
//! into caller-owned buffers are ordered against every reader and writer of
//! the same buffer and keep their program order among themselves.

use std::hash::{Hash, Hasher};

use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHasher};

use crate::dtype::DType;
use crate::error::{GraphCycleError, Result};
use crate::graph::{Graph, NodeId, OpKind};
use crate::shape::ShapeExpr;

/// Index of a kernel in its [`KernelGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub usize);

/// Where an external kernel input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtSrc {
    /// A caller-provided graph input buffer.
    GraphInput(usize),
    /// The output buffer of another kernel.
    Kernel(KernelId),
}

/// An external input slot of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInput {
    pub src: ExtSrc,
    pub dtype: DType,
    pub shape: Vec<ShapeExpr>,
}

/// Where a kernel's result lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDest {
    /// A fresh buffer owned by the schedule.
    Buffer,
    /// In-place write into a caller-owned input buffer.
    GraphInput(usize),
}

/// Reference to an operand inside a kernel: either a member op or an
/// external input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KSrc {
    Op(usize),
    Ext(usize),
}

/// One member operation of a fused kernel, with operands rewritten to local
/// references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOp {
    pub kind: OpKind,
    pub dtype: DType,
    pub shape: Vec<ShapeExpr>,
    pub src: Vec<KSrc>,
}

/// A fused subgraph compiled and executed as one unit.
#[derive(Debug, Clone)]
pub struct KernelNode {
    pub name: String,
    /// The graph node this kernel materializes.
    pub root: NodeId,
    /// Member ops in dependency order; the last op produces the output.
    pub ops: Vec<KernelOp>,
    pub inputs: Vec<KernelInput>,
    pub dest: KernelDest,
    pub dtype: DType,
    pub shape: Vec<ShapeExpr>,
    /// Ordering constraints: this kernel must run after all of these.
    /// Includes data dependencies and buffer hazards.
    pub after: Vec<KernelId>,
    /// Structural fingerprint over ops and input signatures. Stable across
    /// graphs; used for artifact caching and replay matching.
    pub fingerprint: u64,
}

impl KernelNode {
    /// The single reduction of this kernel, if any.
    pub fn reduce_op(&self) -> Option<&KernelOp> {
        self.ops.iter().find(|op| op.kind.is_reduce())
    }
}

/// The partitioned kernel DAG.
#[derive(Debug, Clone)]
pub struct KernelGraph {
    pub kernels: Vec<KernelNode>,
    /// Which kernel materializes each requested output node.
    pub outputs: Vec<(NodeId, KernelId)>,
}

/// Tunables for the recompute-versus-materialize decision.
#[derive(Debug, Clone)]
pub struct KernelizePolicy {
    /// Recompute a shared node when its estimated recompute cost is at most
    /// this fraction of the store/load cost.
    pub recompute_factor: f64,
    /// Assumed size for unbound shape variables when estimating costs.
    pub default_var_size: i64,
}

impl Default for KernelizePolicy {
    fn default() -> Self {
        KernelizePolicy {
            recompute_factor: 0.75,
            default_var_size: 256,
        }
    }
}

/// Partition the realized subgraph of `graph` into kernels.
pub fn kernelize(graph: &Graph, policy: &KernelizePolicy) -> Result<KernelGraph> {
    let mut roots: Vec<NodeId> = graph.outputs();
    for store in graph.stores() {
        if !roots.contains(&store) {
            roots.push(store);
        }
    }
    let mut k = Kernelizer {
        graph,
        policy,
        consumers: count_consumers(graph, &roots),
        materialized: FxHashMap::default(),
        kernels: Vec::new(),
        input_readers: FxHashMap::default(),
        input_writer: FxHashMap::default(),
        last_store: None,
    };
    let mut outputs = Vec::new();
    for &root in &roots {
        let kid = k.ensure_materialized(root)?;
        if graph.outputs().contains(&root) {
            outputs.push((root, kid));
        }
    }
    let kg = KernelGraph {
        kernels: k.kernels,
        outputs,
    };
    check_acyclic(&kg)?;
    debug!(
        "kernelized {} roots into {} kernels",
        roots.len(),
        kg.kernels.len()
    );
    Ok(kg)
}

/// Count consumers of every node reachable from the roots.
fn count_consumers(graph: &Graph, roots: &[NodeId]) -> FxHashMap<NodeId, usize> {
    let mut counts: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut stack: Vec<NodeId> = roots.to_vec();
    let mut seen: FxHashMap<NodeId, ()> = FxHashMap::default();
    while let Some(id) = stack.pop() {
        if seen.insert(id, ()).is_some() {
            continue;
        }
        for &src in &graph.node(id).src {
            *counts.entry(src).or_insert(0) += 1;
            stack.push(src);
        }
    }
    counts
}

struct Kernelizer<'g> {
    graph: &'g Graph,
    policy: &'g KernelizePolicy,
    consumers: FxHashMap<NodeId, usize>,
    /// Nodes already materialized by a kernel.
    materialized: FxHashMap<NodeId, KernelId>,
    kernels: Vec<KernelNode>,
    /// Kernels that read each caller-owned input buffer.
    input_readers: FxHashMap<usize, Vec<KernelId>>,
    /// Last kernel that wrote each caller-owned input buffer.
    input_writer: FxHashMap<usize, KernelId>,
    /// Previous store kernel, for program-order chaining.
    last_store: Option<KernelId>,
}

/// In-progress kernel state during one `build_kernel` call.
struct Builder {
    ops: Vec<KernelOp>,
    inputs: Vec<KernelInput>,
    /// Local memoization: graph node -> local reference, valid within this
    /// kernel only.
    local: FxHashMap<NodeId, KSrc>,
    has_reduce: bool,
    after: Vec<KernelId>,
}

impl Builder {
    fn ext(&mut self, src: ExtSrc, dtype: DType, shape: Vec<ShapeExpr>) -> KSrc {
        if let Some(pos) = self.inputs.iter().position(|i| i.src == src) {
            return KSrc::Ext(pos);
        }
        self.inputs.push(KernelInput { src, dtype, shape });
        KSrc::Ext(self.inputs.len() - 1)
    }

    fn push_after(&mut self, kid: KernelId) {
        if !self.after.contains(&kid) {
            self.after.push(kid);
        }
    }
}

impl<'g> Kernelizer<'g> {
    /// Materialize `node` as a kernel output, building the kernel if needed.
    fn ensure_materialized(&mut self, node: NodeId) -> Result<KernelId> {
        if let Some(&kid) = self.materialized.get(&node) {
            return Ok(kid);
        }
        self.build_kernel(node)
    }

    fn build_kernel(&mut self, root: NodeId) -> Result<KernelId> {
        let root_node = self.graph.node(root);
        let mut b = Builder {
            ops: Vec::new(),
            inputs: Vec::new(),
            local: FxHashMap::default(),
            has_reduce: false,
            after: Vec::new(),
        };

        // A store kernel computes its value subtree and writes into the
        // target input buffer; everything else materializes a fresh buffer.
        let (expr_root, dest) = match &root_node.kind {
            OpKind::Store => {
                let target = self.graph.node(root_node.src[0]);
                let index = match target.kind {
                    OpKind::Input { index } => index,
                    _ => unreachable!("store target is validated at construction"),
                };
                (root_node.src[1], KernelDest::GraphInput(index))
            }
            // Materializing a Contiguous marker computes its source.
            OpKind::Contiguous => (root_node.src[0], KernelDest::Buffer),
            _ => (root, KernelDest::Buffer),
        };

        let out = self.emit(expr_root, true, &mut b)?;
        // The output must be a member op; wrap bare external reads in a
        // copy so every kernel owns its final value.
        if let KSrc::Ext(slot) = out {
            let input = b.inputs[slot].clone();
            b.ops.push(KernelOp {
                kind: OpKind::Contiguous,
                dtype: input.dtype,
                shape: input.shape,
                src: vec![out],
            });
        }

        // Hazard ordering for in-place writes.
        if let KernelDest::GraphInput(index) = dest {
            if let Some(readers) = self.input_readers.get(&index) {
                for &r in readers {
                    b.push_after(r);
                }
            }
            if let Some(&w) = self.input_writer.get(&index) {
                b.push_after(w);
            }
            if let Some(prev) = self.last_store {
                b.push_after(prev);
            }
        }
        // Read-after-write for caller-owned buffers written by earlier
        // store kernels.
        let writers: Vec<KernelId> = b
            .inputs
            .iter()
            .filter_map(|input| match input.src {
                ExtSrc::GraphInput(i) => self.input_writer.get(&i).copied(),
                ExtSrc::Kernel(_) => None,
            })
            .collect();
        for w in writers {
            b.push_after(w);
        }

        let kid = KernelId(self.kernels.len());
        let last = b.ops.last().expect("kernel has at least one op");
        let (dtype, shape) = (last.dtype, last.shape.clone());
        let fingerprint = fingerprint_kernel(&b.ops, &b.inputs, &dest);
        let name = kernel_name(kid, &b.ops);
        trace!("built kernel {name} ({} ops, fp {fingerprint:016x})", b.ops.len());
        self.kernels.push(KernelNode {
            name,
            root,
            ops: b.ops,
            inputs: b.inputs,
            dest,
            dtype,
            shape,
            after: b.after,
            fingerprint,
        });

        // Bookkeeping for hazards and sharing.
        self.materialized.insert(root, kid);
        for input in &self.kernels[kid.0].inputs {
            if let ExtSrc::GraphInput(i) = input.src {
                self.input_readers.entry(i).or_default().push(kid);
            }
        }
        match dest {
            KernelDest::GraphInput(index) => {
                self.input_writer.insert(index, kid);
                self.last_store = Some(kid);
            }
            KernelDest::Buffer => {}
        }
        Ok(kid)
    }

    /// Emit `node` into the kernel under construction, recursing into
    /// sources. `is_root` suppresses boundary checks for the kernel's own
    /// output node.
    fn emit(&mut self, node_id: NodeId, is_root: bool, b: &mut Builder) -> Result<KSrc> {
        if let Some(&local) = b.local.get(&node_id) {
            return Ok(local);
        }
        let node = self.graph.node(node_id);

        // Already materialized elsewhere: read its buffer.
        if !is_root {
            if let Some(&kid) = self.materialized.get(&node_id) {
                b.push_after(kid);
                let src = b.ext(ExtSrc::Kernel(kid), node.dtype, node.shape);
                b.local.insert(node_id, src);
                return Ok(src);
            }
        }

        // Leaves.
        match &node.kind {
            OpKind::Input { index } => {
                let src = b.ext(ExtSrc::GraphInput(*index), node.dtype, node.shape);
                b.local.insert(node_id, src);
                return Ok(src);
            }
            OpKind::Const(_) => {
                b.ops.push(KernelOp {
                    kind: node.kind.clone(),
                    dtype: node.dtype,
                    shape: node.shape.clone(),
                    src: vec![],
                });
                let src = KSrc::Op(b.ops.len() - 1);
                b.local.insert(node_id, src);
                return Ok(src);
            }
            _ => {}
        }

        // Boundary checks for interior nodes.
        if !is_root && self.is_boundary(node_id, &node, b) {
            let kid = self.ensure_materialized(node_id)?;
            b.push_after(kid);
            let src = b.ext(ExtSrc::Kernel(kid), node.dtype, node.shape.clone());
            b.local.insert(node_id, src);
            return Ok(src);
        }

        // Fuse: emit sources first, then this op. The reduce flag is raised
        // before recursing so a nested second reduction cuts at a boundary.
        if node.kind.is_reduce() {
            b.has_reduce = true;
        }
        let mut srcs = Vec::with_capacity(node.src.len());
        for &s in &node.src {
            srcs.push(self.emit(s, false, b)?);
        }
        b.ops.push(KernelOp {
            kind: node.kind.clone(),
            dtype: node.dtype,
            shape: node.shape.clone(),
            src: srcs,
        });
        let src = KSrc::Op(b.ops.len() - 1);
        b.local.insert(node_id, src);
        Ok(src)
    }

    /// Should `node` become a kernel boundary instead of fusing?
    fn is_boundary(
        &self,
        node_id: NodeId,
        node: &crate::graph::OpNode,
        b: &Builder,
    ) -> bool {
        // Explicit materialization markers always cut.
        if matches!(node.kind, OpKind::Contiguous | OpKind::Store) {
            return true;
        }
        // One reduction per kernel: a second reduce cannot share the
        // accumulator's iteration space.
        if node.kind.is_reduce() && b.has_reduce {
            return true;
        }
        // Multi-consumer nodes: recompute when cheap, materialize when not.
        let shared = self.consumers.get(&node_id).copied().unwrap_or(0) > 1;
        if shared && !node.kind.is_leaf() && !node.kind.is_view() {
            let recompute = self.recompute_cost(node_id);
            let materialize = self.materialize_cost(node);
            let cut = recompute > materialize * self.policy.recompute_factor;
            trace!(
                "shared node {node_id:?}: recompute {recompute:.0} vs store/load {materialize:.0} -> {}",
                if cut { "materialize" } else { "recompute" }
            );
            return cut;
        }
        false
    }

    /// Estimated cost of recomputing the subtree per consumer: compute ops
    /// in the subtree weighted by iteration size.
    fn recompute_cost(&self, node_id: NodeId) -> f64 {
        let mut seen: FxHashMap<NodeId, ()> = FxHashMap::default();
        let mut stack = vec![node_id];
        let mut ops = 0usize;
        while let Some(id) = stack.pop() {
            if seen.insert(id, ()).is_some() {
                continue;
            }
            let node = self.graph.node(id);
            // Reading a materialized buffer ends the subtree.
            if self.materialized.contains_key(&id) || node.kind.is_leaf() {
                continue;
            }
            if !node.kind.is_view() {
                ops += 1;
            }
            stack.extend(node.src.iter().copied());
        }
        ops as f64 * self.elements(&self.graph.node(node_id).shape)
    }

    /// Cost of a store plus one load of the node's elements.
    fn materialize_cost(&self, node: &crate::graph::OpNode) -> f64 {
        2.0 * self.elements(&node.shape)
    }

    fn elements(&self, shape: &[ShapeExpr]) -> f64 {
        shape
            .iter()
            .map(|e| match e.as_const() {
                Some(v) => v as f64,
                None => self.policy.default_var_size as f64,
            })
            .product()
    }
}

fn kernel_name(kid: KernelId, ops: &[KernelOp]) -> String {
    let mut parts: Vec<&str> = ops
        .iter()
        .filter(|op| !matches!(op.kind, OpKind::Const(_) | OpKind::View(_)))
        .map(|op| op.kind.name())
        .collect();
    parts.dedup();
    if parts.is_empty() {
        parts.push("copy");
    }
    format!("k{}_{}", kid.0, parts.join("_"))
}

/// Stable structural fingerprint over a kernel's canonical form.
fn fingerprint_kernel(ops: &[KernelOp], inputs: &[KernelInput], dest: &KernelDest) -> u64 {
    let mut h = FxHasher::default();
    for op in ops {
        op.kind.hash(&mut h);
        op.dtype.hash(&mut h);
        op.shape.hash(&mut h);
        op.src.hash(&mut h);
    }
    for input in inputs {
        input.dtype.hash(&mut h);
        input.shape.hash(&mut h);
        // Input *positions* matter for structure, their producers do not.
        matches!(input.src, ExtSrc::GraphInput(_)).hash(&mut h);
    }
    matches!(dest, KernelDest::Buffer).hash(&mut h);
    h.finish()
}

/// Defensive cycle check over AFTER edges. A cycle here is an internal
/// invariant violation, never expected in correct operation.
fn check_acyclic(kg: &KernelGraph) -> Result<()> {
    let n = kg.kernels.len();
    let mut state = vec![0u8; n]; // 0 = unseen, 1 = on stack, 2 = done
    for start in 0..n {
        if state[start] != 0 {
            continue;
        }
        // Iterative DFS with explicit stack.
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        state[start] = 1;
        while let Some(&(k, edge)) = stack.last() {
            let after = &kg.kernels[k].after;
            if edge >= after.len() {
                state[k] = 2;
                stack.pop();
                continue;
            }
            stack.last_mut().expect("stack is non-empty").1 += 1;
            let next = after[edge].0;
            match state[next] {
                0 => {
                    state[next] = 1;
                    stack.push((next, 0));
                }
                1 => return Err(GraphCycleError { kernel: next }.into()),
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::graph::Graph;

    fn shape(dims: &[i64]) -> Vec<ShapeExpr> {
        dims.iter().map(|&d| ShapeExpr::Const(d)).collect()
    }

    #[test]
    fn test_elementwise_chain_fuses_to_one_kernel() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[4]));
        let b = g.input(DType::F32, shape(&[4]));
        let c = g.input(DType::F32, shape(&[4]));
        let _ = ((a + b) * c).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert_eq!(kg.kernels.len(), 1);
        assert_eq!(kg.kernels[0].inputs.len(), 3);
    }

    #[test]
    fn test_add_then_reduce_fuses() {
        // add -> sum over all elements: at most two kernels, here one.
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[3]));
        let b = g.input(DType::F32, shape(&[3]));
        let _ = (a + b).sum_all().as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert!(kg.kernels.len() <= 2);
        assert_eq!(kg.kernels.len(), 1);
        assert!(kg.kernels[0].reduce_op().is_some());
    }

    #[test]
    fn test_contiguous_cuts_fusion() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[4]));
        let b = g.input(DType::F32, shape(&[4]));
        let s = (a + b).contiguous();
        let _ = (s * s).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert_eq!(kg.kernels.len(), 2);
        // The consumer kernel reads the producer's buffer.
        let consumer = &kg.kernels[1];
        assert!(consumer
            .inputs
            .iter()
            .any(|i| matches!(i.src, ExtSrc::Kernel(KernelId(0)))));
        assert!(consumer.after.contains(&KernelId(0)));
    }

    #[test]
    fn test_second_reduce_becomes_boundary() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[4, 4]));
        let row = a.sum(vec![1]);
        let _ = row.sum(vec![0]).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert_eq!(kg.kernels.len(), 2);
    }

    #[test]
    fn test_cheap_shared_node_is_recomputed() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[4]));
        let b = g.input(DType::F32, shape(&[4]));
        let s = a + b; // one op: recompute is cheaper than store+load
        let _ = (s * s).as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert_eq!(kg.kernels.len(), 1);
    }

    #[test]
    fn test_expensive_shared_node_is_materialized() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[64]));
        // A deep elementwise chain shared by two consumers.
        let mut x = a.sqrt();
        for _ in 0..8 {
            x = x.sqrt();
        }
        let y = x + x.sin();
        let z = x * x.exp2();
        let _ = y.as_output();
        let _ = z.as_output();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        assert!(kg.kernels.len() >= 3, "expected shared chain to materialize");
    }

    #[test]
    fn test_store_ordering_edges() {
        let g = Graph::new();
        let a = g.input(DType::F32, shape(&[4]));
        let b = g.input(DType::F32, shape(&[4]));
        // Read a, then overwrite a, then read it again.
        let first = (a + b).contiguous();
        let _ = first.as_output();
        g.store(a.id, (a * b).id).unwrap();
        let kg = kernelize(&g, &KernelizePolicy::default()).unwrap();
        // The store kernel must be AFTER the reader of `a`.
        let store = kg
            .kernels
            .iter()
            .find(|k| matches!(k.dest, KernelDest::GraphInput(_)))
            .expect("store kernel exists");
        let reader = kg
            .kernels
            .iter()
            .enumerate()
            .find(|(_, k)| matches!(k.dest, KernelDest::Buffer))
            .map(|(i, _)| KernelId(i))
            .unwrap();
        assert!(store.after.contains(&reader));
    }

    #[test]
    fn test_deterministic_partitioning() {
        let build = || {
            let g = Graph::new();
            let a = g.input(DType::F32, shape(&[8]));
            let b = g.input(DType::F32, shape(&[8]));
            let x = (a + b).contiguous();
            let _ = (x * a).sum_all().as_output();
            kernelize(&g, &KernelizePolicy::default()).unwrap()
        };
        let kg1 = build();
        let kg2 = build();
        assert_eq!(kg1.kernels.len(), kg2.kernels.len());
        for (k1, k2) in kg1.kernels.iter().zip(&kg2.kernels) {
            assert_eq!(k1.fingerprint, k2.fingerprint);
            assert_eq!(k1.name, k2.name);
        }
    }
}
