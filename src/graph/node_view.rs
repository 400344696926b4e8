//! Chainable handle for building graphs.

use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use super::{Graph, NodeId, OpNode, ReduceOp};
use crate::dtype::DType;
use crate::error::Result;
use crate::shape::ShapeExpr;

/// A lightweight handle to a node, carrying its graph.
///
/// Operator overloads panic on construction errors for ergonomics; the
/// fallible `Graph` methods are available when shapes or dtypes are not
/// known to match.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    pub id: NodeId,
    pub graph: &'a Graph,
}

impl std::fmt::Debug for NodeView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeView").field("id", &self.id).finish()
    }
}

impl<'a> NodeView<'a> {
    fn wrap(&self, id: NodeId) -> NodeView<'a> {
        NodeView {
            id,
            graph: self.graph,
        }
    }

    pub fn node(&self) -> OpNode {
        self.graph.node(self.id)
    }

    pub fn dtype(&self) -> DType {
        self.node().dtype
    }

    pub fn shape(&self) -> Vec<ShapeExpr> {
        self.node().shape
    }

    // --- elementwise ---

    pub fn recip(self) -> NodeView<'a> {
        self.wrap(self.graph.recip(self.id).expect("recip"))
    }

    pub fn sqrt(self) -> NodeView<'a> {
        self.wrap(self.graph.sqrt(self.id).expect("sqrt"))
    }

    pub fn sin(self) -> NodeView<'a> {
        self.wrap(self.graph.sin(self.id).expect("sin"))
    }

    pub fn log2(self) -> NodeView<'a> {
        self.wrap(self.graph.log2(self.id).expect("log2"))
    }

    pub fn exp2(self) -> NodeView<'a> {
        self.wrap(self.graph.exp2(self.id).expect("exp2"))
    }

    pub fn cast(self, dtype: DType) -> NodeView<'a> {
        self.wrap(self.graph.cast(self.id, dtype).expect("cast"))
    }

    pub fn maximum(self, rhs: NodeView<'a>) -> NodeView<'a> {
        self.wrap(self.graph.maximum(self.id, rhs.id).expect("maximum"))
    }

    pub fn lt(self, rhs: NodeView<'a>) -> NodeView<'a> {
        self.wrap(self.graph.less_than(self.id, rhs.id).expect("lt"))
    }

    pub fn try_add(self, rhs: NodeView<'a>) -> Result<NodeView<'a>> {
        Ok(self.wrap(self.graph.add(self.id, rhs.id)?))
    }

    // --- reductions ---

    pub fn sum(self, axes: Vec<usize>) -> NodeView<'a> {
        self.wrap(self.graph.sum(self.id, axes).expect("sum"))
    }

    pub fn sum_all(self) -> NodeView<'a> {
        self.wrap(self.graph.sum_all(self.id).expect("sum_all"))
    }

    pub fn max_reduce(self, axes: Vec<usize>) -> NodeView<'a> {
        self.wrap(self.graph.max_reduce(self.id, axes).expect("max_reduce"))
    }

    pub fn reduce(self, op: ReduceOp, axes: Vec<usize>) -> NodeView<'a> {
        self.wrap(self.graph.reduce(self.id, op, axes).expect("reduce"))
    }

    // --- movement ---

    pub fn reshape(self, new_shape: Vec<usize>) -> NodeView<'a> {
        self.wrap(self.graph.reshape(self.id, new_shape).expect("reshape"))
    }

    pub fn permute(self, perm: &[usize]) -> NodeView<'a> {
        self.wrap(self.graph.permute(self.id, perm).expect("permute"))
    }

    pub fn expand(self, new_shape: Vec<usize>) -> NodeView<'a> {
        self.wrap(self.graph.expand(self.id, new_shape).expect("expand"))
    }

    pub fn shrink(self, ranges: &[(usize, usize)]) -> NodeView<'a> {
        self.wrap(self.graph.shrink(self.id, ranges).expect("shrink"))
    }

    pub fn contiguous(self) -> NodeView<'a> {
        self.wrap(self.graph.contiguous(self.id))
    }

    /// Mark this node for materialization and return it.
    pub fn as_output(self) -> NodeView<'a> {
        self.graph.mark_output(self.id);
        self
    }
}

impl<'a> Add for NodeView<'a> {
    type Output = NodeView<'a>;
    fn add(self, rhs: Self) -> Self::Output {
        self.wrap(self.graph.add(self.id, rhs.id).expect("add"))
    }
}

impl<'a> Sub for NodeView<'a> {
    type Output = NodeView<'a>;
    fn sub(self, rhs: Self) -> Self::Output {
        self.wrap(self.graph.sub(self.id, rhs.id).expect("sub"))
    }
}

impl<'a> Mul for NodeView<'a> {
    type Output = NodeView<'a>;
    fn mul(self, rhs: Self) -> Self::Output {
        self.wrap(self.graph.mul(self.id, rhs.id).expect("mul"))
    }
}

impl<'a> Div for NodeView<'a> {
    type Output = NodeView<'a>;
    fn div(self, rhs: Self) -> Self::Output {
        self.wrap(self.graph.div(self.id, rhs.id).expect("div"))
    }
}

impl<'a> Rem for NodeView<'a> {
    type Output = NodeView<'a>;
    fn rem(self, rhs: Self) -> Self::Output {
        self.wrap(self.graph.rem(self.id, rhs.id).expect("rem"))
    }
}

impl<'a> Neg for NodeView<'a> {
    type Output = NodeView<'a>;
    fn neg(self) -> Self::Output {
        self.wrap(self.graph.neg(self.id).expect("neg"))
    }
}
