//! Operation kinds of the graph IR.

use crate::dtype::{Const, DType};
use crate::shape::view::ViewChain;

/// Reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    /// Identity element for the accumulator, widened to f64.
    pub fn identity(&self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }
}

/// The operation of a graph node.
///
/// The operator set is deliberately small: subtraction is `Add(a, Neg(b))`,
/// division is `Mul(a, Recip(b))`. Operands live in the node's `src` list so
/// the tree structure stays uniform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A caller-provided buffer, identified by its position in the input list.
    Input { index: usize },
    /// An inlined scalar constant.
    Const(Const),

    // --- Elementwise unary ---
    Neg,
    Recip,
    Sqrt,
    Sin,
    Log2,
    Exp2,
    /// Convert to another dtype. `src[0]` is the value.
    Cast(DType),

    // --- Elementwise binary ---
    Add,
    Mul,
    Max,
    Rem,
    LessThan,

    /// Ternary select: `src[0] ? src[1] : src[2]`.
    Where,

    /// Reduce `src[0]` over `axes` with `op`. Reduced axes are removed from
    /// the output shape.
    Reduce { op: ReduceOp, axes: Vec<usize> },

    /// A movement op: reinterpret `src[0]` through a view chain without
    /// touching data. Consecutive views are composed at creation.
    View(ViewChain),

    /// Explicit materialization boundary: the value of `src[0]` must land in
    /// a real buffer here. Fusion never crosses it.
    Contiguous,

    /// Write `src[1]` into the caller-owned buffer of input `src[0]`.
    /// A program-order side effect; ordering against readers of the same
    /// buffer is preserved with AFTER edges.
    Store,
}

impl OpKind {
    pub fn is_elementwise_unary(&self) -> bool {
        matches!(
            self,
            OpKind::Neg
                | OpKind::Recip
                | OpKind::Sqrt
                | OpKind::Sin
                | OpKind::Log2
                | OpKind::Exp2
                | OpKind::Cast(_)
        )
    }

    pub fn is_elementwise_binary(&self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Mul | OpKind::Max | OpKind::Rem | OpKind::LessThan
        )
    }

    /// Elementwise ops produce one output element per iteration point and
    /// fuse freely with each other.
    pub fn is_elementwise(&self) -> bool {
        self.is_elementwise_unary() || self.is_elementwise_binary() || matches!(self, OpKind::Where)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, OpKind::Reduce { .. })
    }

    pub fn is_view(&self) -> bool {
        matches!(self, OpKind::View(_))
    }

    /// Leaf nodes carry no computation of their own.
    pub fn is_leaf(&self) -> bool {
        matches!(self, OpKind::Input { .. } | OpKind::Const(_))
    }

    /// Short name used in kernel names and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "input",
            OpKind::Const(_) => "const",
            OpKind::Neg => "neg",
            OpKind::Recip => "recip",
            OpKind::Sqrt => "sqrt",
            OpKind::Sin => "sin",
            OpKind::Log2 => "log2",
            OpKind::Exp2 => "exp2",
            OpKind::Cast(_) => "cast",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Max => "max",
            OpKind::Rem => "rem",
            OpKind::LessThan => "lt",
            OpKind::Where => "where",
            OpKind::Reduce {
                op: ReduceOp::Sum, ..
            } => "sum",
            OpKind::Reduce {
                op: ReduceOp::Max, ..
            } => "rmax",
            OpKind::View(_) => "view",
            OpKind::Contiguous => "contiguous",
            OpKind::Store => "store",
        }
    }
}
