//! The operation graph: an acyclic, deduplicated IR of tensor operations.
//!
//! Nodes live in an arena owned by a [`Graph`] and are identified by
//! [`NodeId`]. A content-addressed interner maps each node's canonical form
//! to a single arena slot, so structurally identical nodes share one id by
//! construction. Nodes are never mutated after creation; `realize` requests
//! only mark outputs on the graph.

pub mod op;
mod node_view;

pub use node_view::NodeView;
pub use op::{OpKind, ReduceOp};

use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use rustc_hash::{FxHashMap, FxHasher};

use crate::dtype::{Const, DType};
use crate::error::{DtypeError, Error, Result, ShapeError};
use crate::shape::view::{View, ViewChain};
use crate::shape::ShapeExpr;

/// Stable index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// One immutable IR node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpNode {
    pub kind: OpKind,
    pub dtype: DType,
    pub shape: Vec<ShapeExpr>,
    pub src: Vec<NodeId>,
}

struct GraphInner {
    nodes: Vec<OpNode>,
    interner: FxHashMap<OpNode, NodeId>,
    outputs: Vec<NodeId>,
    /// Store nodes in program order. These are side effects and must keep
    /// their relative order across kernelization.
    stores: Vec<NodeId>,
    n_inputs: usize,
}

/// A lazily-built operation graph.
///
/// Construction is cheap and purely functional: every op returns the id of a
/// canonical node and computes nothing. The interner sits behind a lock so
/// graphs may be built from multiple threads.
pub struct Graph {
    inner: RwLock<GraphInner>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            inner: RwLock::new(GraphInner {
                nodes: Vec::new(),
                interner: FxHashMap::default(),
                outputs: Vec::new(),
                stores: Vec::new(),
                n_inputs: 0,
            }),
        }
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone of the node for `id`.
    pub fn node(&self, id: NodeId) -> OpNode {
        self.inner.read().unwrap().nodes[id.0 as usize].clone()
    }

    pub fn outputs(&self) -> Vec<NodeId> {
        self.inner.read().unwrap().outputs.clone()
    }

    pub fn stores(&self) -> Vec<NodeId> {
        self.inner.read().unwrap().stores.clone()
    }

    pub fn num_inputs(&self) -> usize {
        self.inner.read().unwrap().n_inputs
    }

    fn view(&self, id: NodeId) -> NodeView<'_> {
        NodeView { id, graph: self }
    }

    /// Intern a node: return the canonical id, creating the arena slot only
    /// if no structurally identical node exists.
    fn intern(&self, node: OpNode) -> NodeId {
        let mut inner = self.inner.write().unwrap();
        if let Some(&id) = inner.interner.get(&node) {
            return id;
        }
        let id = NodeId(inner.nodes.len() as u32);
        inner.interner.insert(node.clone(), id);
        inner.nodes.push(node);
        id
    }

    // ------------------------------------------------------------------
    // Leaves
    // ------------------------------------------------------------------

    /// Declare a caller-provided input buffer.
    pub fn input(&self, dtype: DType, shape: Vec<ShapeExpr>) -> NodeView<'_> {
        let index = {
            let mut inner = self.inner.write().unwrap();
            let index = inner.n_inputs;
            inner.n_inputs += 1;
            index
        };
        let id = self.intern(OpNode {
            kind: OpKind::Input { index },
            dtype,
            shape,
            src: vec![],
        });
        self.view(id)
    }

    /// A rank-0 scalar constant.
    pub fn constant(&self, value: impl Into<Const>) -> NodeView<'_> {
        let value = value.into();
        let id = self.intern(OpNode {
            kind: OpKind::Const(value),
            dtype: value.dtype(),
            shape: vec![],
            src: vec![],
        });
        self.view(id)
    }

    // ------------------------------------------------------------------
    // Elementwise
    // ------------------------------------------------------------------

    fn unary(&self, op: OpKind, a: NodeId) -> Result<NodeId> {
        let node = self.node(a);
        let dtype = match &op {
            OpKind::Cast(to) => *to,
            OpKind::Neg => {
                if node.dtype == DType::Bool || node.dtype == DType::U8 {
                    return Err(DtypeError::Unsupported {
                        op: op.name(),
                        dtype: node.dtype,
                    }
                    .into());
                }
                node.dtype
            }
            // Transcendentals are float-only; cast explicitly first.
            _ => {
                if !node.dtype.is_float() {
                    return Err(DtypeError::Unsupported {
                        op: op.name(),
                        dtype: node.dtype,
                    }
                    .into());
                }
                node.dtype
            }
        };
        // Cast folding: a cast of a constant is a constant, a cast to the
        // same dtype is the node itself.
        if let OpKind::Cast(to) = &op {
            if *to == node.dtype {
                return Ok(a);
            }
            if let OpKind::Const(c) = &node.kind {
                return Ok(self.constant(c.cast(*to)).id);
            }
        }
        Ok(self.intern(OpNode {
            kind: op,
            dtype,
            shape: node.shape,
            src: vec![a],
        }))
    }

    fn binary(&self, op: OpKind, a: NodeId, b: NodeId) -> Result<NodeId> {
        let (na, nb) = (self.node(a), self.node(b));
        let dtype = na
            .dtype
            .promote(nb.dtype)
            .ok_or(DtypeError::NoPromotion {
                lhs: na.dtype,
                rhs: nb.dtype,
            })?;
        let out_dtype = if matches!(op, OpKind::LessThan) {
            DType::Bool
        } else {
            dtype
        };
        if matches!(op, OpKind::Rem) && !dtype.is_int() {
            return Err(DtypeError::Unsupported {
                op: op.name(),
                dtype,
            }
            .into());
        }
        let shape = broadcast_shapes(&na.shape, &nb.shape)?;
        let a = self.coerce(a, &na, dtype, &shape)?;
        let b = self.coerce(b, &nb, dtype, &shape)?;
        Ok(self.intern(OpNode {
            kind: op,
            dtype: out_dtype,
            shape,
            src: vec![a, b],
        }))
    }

    /// Cast and broadcast an operand to the result dtype and shape.
    /// Promotion inserts an explicit Cast node; broadcasting inserts an
    /// explicit expand view. Nothing is coerced silently inside a kernel.
    fn coerce(
        &self,
        id: NodeId,
        node: &OpNode,
        dtype: DType,
        shape: &[ShapeExpr],
    ) -> Result<NodeId> {
        let mut id = id;
        if node.dtype != dtype {
            id = self.unary(OpKind::Cast(dtype), id)?;
        }
        // Rank-0 scalars broadcast without a view.
        if node.shape.is_empty() || node.shape == shape {
            return Ok(id);
        }
        let target = concrete_dims(shape)?;
        let from = concrete_dims(&self.node(id).shape)?;
        // Pad with leading 1s, then expand.
        let mut padded = vec![1usize; target.len() - from.len()];
        padded.extend(&from);
        let reshaped = View::contiguous(from)
            .reshape(&padded)
            .expect("padding with unit axes always reshapes");
        let expanded = reshaped.expand(&target)?;
        Ok(self.apply_view(id, expanded))
    }

    pub fn add(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Add, a, b)
    }

    pub fn mul(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Mul, a, b)
    }

    pub fn maximum(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Max, a, b)
    }

    pub fn rem(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Rem, a, b)
    }

    pub fn less_than(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(OpKind::LessThan, a, b)
    }

    pub fn sub(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let neg = self.unary(OpKind::Neg, b)?;
        self.binary(OpKind::Add, a, neg)
    }

    pub fn div(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let recip = self.unary(OpKind::Recip, b)?;
        self.binary(OpKind::Mul, a, recip)
    }

    pub fn neg(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Neg, a)
    }

    pub fn recip(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Recip, a)
    }

    pub fn sqrt(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Sqrt, a)
    }

    pub fn sin(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Sin, a)
    }

    pub fn log2(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Log2, a)
    }

    pub fn exp2(&self, a: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Exp2, a)
    }

    pub fn cast(&self, a: NodeId, dtype: DType) -> Result<NodeId> {
        self.unary(OpKind::Cast(dtype), a)
    }

    /// `cond ? then : else`.
    pub fn where_(&self, cond: NodeId, then: NodeId, otherwise: NodeId) -> Result<NodeId> {
        let nc = self.node(cond);
        if nc.dtype != DType::Bool {
            return Err(DtypeError::Unsupported {
                op: "where",
                dtype: nc.dtype,
            }
            .into());
        }
        let (nt, ne) = (self.node(then), self.node(otherwise));
        let dtype = nt
            .dtype
            .promote(ne.dtype)
            .ok_or(DtypeError::NoPromotion {
                lhs: nt.dtype,
                rhs: ne.dtype,
            })?;
        let shape = broadcast_shapes(&nc.shape, &broadcast_shapes(&nt.shape, &ne.shape)?)?;
        let cond = self.coerce(cond, &nc, DType::Bool, &shape)?;
        let then = self.coerce(then, &nt, dtype, &shape)?;
        let otherwise = self.coerce(otherwise, &ne, dtype, &shape)?;
        Ok(self.intern(OpNode {
            kind: OpKind::Where,
            dtype,
            shape,
            src: vec![cond, then, otherwise],
        }))
    }

    // ------------------------------------------------------------------
    // Reductions
    // ------------------------------------------------------------------

    pub fn reduce(&self, a: NodeId, op: ReduceOp, axes: Vec<usize>) -> Result<NodeId> {
        let node = self.node(a);
        let ndim = node.shape.len();
        let mut axes = axes;
        axes.sort_unstable();
        axes.dedup();
        for &axis in &axes {
            if axis >= ndim {
                return Err(ShapeError::ReduceAxisOutOfRange { axis, ndim }.into());
            }
        }
        let shape: Vec<ShapeExpr> = node
            .shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, e)| e.clone())
            .collect();
        Ok(self.intern(OpNode {
            kind: OpKind::Reduce { op, axes },
            dtype: node.dtype,
            shape,
            src: vec![a],
        }))
    }

    pub fn sum(&self, a: NodeId, axes: Vec<usize>) -> Result<NodeId> {
        self.reduce(a, ReduceOp::Sum, axes)
    }

    pub fn max_reduce(&self, a: NodeId, axes: Vec<usize>) -> Result<NodeId> {
        self.reduce(a, ReduceOp::Max, axes)
    }

    /// Reduce over every axis, producing a rank-0 scalar.
    pub fn sum_all(&self, a: NodeId) -> Result<NodeId> {
        let ndim = self.node(a).shape.len();
        self.reduce(a, ReduceOp::Sum, (0..ndim).collect())
    }

    // ------------------------------------------------------------------
    // Movement ops
    // ------------------------------------------------------------------

    /// Push `outer` onto the view of `a`, composing with an existing view
    /// node so consecutive movement ops never deepen the graph.
    fn apply_view(&self, a: NodeId, outer: View) -> NodeId {
        let node = self.node(a);
        let (chain, src) = match &node.kind {
            OpKind::View(chain) => {
                let mut chain = chain.clone();
                chain.push(outer);
                (chain, node.src[0])
            }
            _ => (ViewChain::new(outer), a),
        };
        let shape = chain.shape().iter().map(|&d| ShapeExpr::from(d)).collect();
        self.intern(OpNode {
            kind: OpKind::View(chain),
            dtype: node.dtype,
            shape,
            src: vec![src],
        })
    }

    /// Concrete dims of `a`, required by movement ops.
    fn movement_dims(&self, a: NodeId) -> Result<Vec<usize>> {
        concrete_dims(&self.node(a).shape)
    }

    pub fn reshape(&self, a: NodeId, new_shape: Vec<usize>) -> Result<NodeId> {
        let dims = self.movement_dims(a)?;
        // Reshape acts on the node's logical space, which is contiguous.
        let view = View::contiguous(dims.clone())
            .reshape(&new_shape)
            .ok_or(ShapeError::ReshapeMismatch {
                from: dims,
                to: new_shape,
            })?;
        Ok(self.apply_view(a, view))
    }

    pub fn permute(&self, a: NodeId, perm: &[usize]) -> Result<NodeId> {
        let dims = self.movement_dims(a)?;
        let view = View::contiguous(dims).permute(perm)?;
        Ok(self.apply_view(a, view))
    }

    pub fn expand(&self, a: NodeId, new_shape: Vec<usize>) -> Result<NodeId> {
        let dims = self.movement_dims(a)?;
        let view = View::contiguous(dims).expand(&new_shape)?;
        Ok(self.apply_view(a, view))
    }

    pub fn shrink(&self, a: NodeId, ranges: &[(usize, usize)]) -> Result<NodeId> {
        let dims = self.movement_dims(a)?;
        let view = View::contiguous(dims).shrink(ranges)?;
        Ok(self.apply_view(a, view))
    }

    /// Force a materialization boundary: downstream consumers read a real
    /// buffer instead of fusing into the producer.
    pub fn contiguous(&self, a: NodeId) -> NodeId {
        let node = self.node(a);
        if matches!(node.kind, OpKind::Contiguous) {
            return a;
        }
        self.intern(OpNode {
            kind: OpKind::Contiguous,
            dtype: node.dtype,
            shape: node.shape,
            src: vec![a],
        })
    }

    // ------------------------------------------------------------------
    // Side effects and outputs
    // ------------------------------------------------------------------

    /// Write `value` into the caller-owned buffer of `target` (which must be
    /// an input node of the same shape and dtype).
    pub fn store(&self, target: NodeId, value: NodeId) -> Result<NodeId> {
        let (nt, nv) = (self.node(target), self.node(value));
        if !matches!(nt.kind, OpKind::Input { .. }) {
            return Err(Error::StoreTarget(target));
        }
        if nt.dtype != nv.dtype {
            return Err(DtypeError::NoPromotion {
                lhs: nt.dtype,
                rhs: nv.dtype,
            }
            .into());
        }
        if nt.shape != nv.shape {
            return Err(ShapeError::RankMismatch {
                expected: nt.shape.len(),
                got: nv.shape.len(),
            }
            .into());
        }
        let id = self.intern(OpNode {
            kind: OpKind::Store,
            dtype: nv.dtype,
            shape: nv.shape,
            src: vec![target, value],
        });
        self.inner.write().unwrap().stores.push(id);
        Ok(id)
    }

    /// Mark a node for materialization. The node itself is untouched.
    pub fn mark_output(&self, id: NodeId) {
        let mut inner = self.inner.write().unwrap();
        if !inner.outputs.contains(&id) {
            inner.outputs.push(id);
        }
    }

    // ------------------------------------------------------------------
    // Fingerprinting
    // ------------------------------------------------------------------

    /// Structural fingerprint of the subgraph reachable from `roots`.
    ///
    /// Arena ids are remapped to a canonical traversal numbering, so two
    /// graphs built in the same shape fingerprint identically regardless of
    /// interning history.
    pub fn fingerprint(&self, roots: &[NodeId]) -> u64 {
        let inner = self.inner.read().unwrap();
        let mut order: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut hasher = FxHasher::default();
        for &root in roots {
            Self::fingerprint_visit(&inner.nodes, root, &mut order, &mut hasher);
        }
        roots.len().hash(&mut hasher);
        hasher.finish()
    }

    fn fingerprint_visit(
        nodes: &[OpNode],
        id: NodeId,
        order: &mut FxHashMap<NodeId, usize>,
        hasher: &mut FxHasher,
    ) {
        if order.contains_key(&id) {
            return;
        }
        let node = &nodes[id.0 as usize];
        for &src in &node.src {
            Self::fingerprint_visit(nodes, src, order, hasher);
        }
        let seq = order.len();
        order.insert(id, seq);
        seq.hash(hasher);
        node.kind.hash(hasher);
        node.dtype.hash(hasher);
        node.shape.hash(hasher);
        for src in &node.src {
            order[src].hash(hasher);
        }
    }
}

/// Resolve a shape whose dims must all be constant.
fn concrete_dims(shape: &[ShapeExpr]) -> Result<Vec<usize>> {
    shape
        .iter()
        .map(|e| {
            e.as_const()
                .map(|v| v as usize)
                .ok_or_else(|| ShapeError::SymbolicMovement.into())
        })
        .collect()
}

/// NumPy-style broadcast over symbolic shapes. Dims must be syntactically
/// equal, or one side a literal 1. Symbolic dims never broadcast against
/// differing constants.
fn broadcast_shapes(lhs: &[ShapeExpr], rhs: &[ShapeExpr]) -> Result<Vec<ShapeExpr>> {
    let ndim = lhs.len().max(rhs.len());
    let mut out = Vec::with_capacity(ndim);
    for i in 0..ndim {
        let l = lhs
            .len()
            .checked_sub(ndim - i)
            .map(|j| &lhs[j])
            .unwrap_or(&ShapeExpr::Const(1));
        let r = rhs
            .len()
            .checked_sub(ndim - i)
            .map(|j| &rhs[j])
            .unwrap_or(&ShapeExpr::Const(1));
        let dim = if l == r {
            l.clone()
        } else if l.as_const() == Some(1) {
            r.clone()
        } else if r.as_const() == Some(1) {
            l.clone()
        } else {
            return Err(ShapeError::BroadcastMismatch {
                lhs: lhs.iter().map(|e| e.to_string()).collect(),
                rhs: rhs.iter().map(|e| e.to_string()).collect(),
            }
            .into());
        };
        out.push(dim);
    }
    Ok(out)
}
