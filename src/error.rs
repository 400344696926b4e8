//! Error taxonomy for the compilation pipeline.
//!
//! Construction-time errors (`ShapeError`, `DtypeError`) surface immediately
//! to the caller. `GraphCycleError` is a defensive internal-invariant check.
//! Compile rejections are absorbed by the optimizer as infinite cost and only
//! become fatal once every variant is exhausted. Execution errors distinguish
//! transient resource contention (retryable) from everything else.

use crate::dtype::DType;

/// Shape errors raised while building or scheduling a graph.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShapeError {
    #[error("cannot broadcast shapes {lhs:?} and {rhs:?}")]
    BroadcastMismatch { lhs: Vec<String>, rhs: Vec<String> },

    #[error("rank mismatch: expected {expected} dimensions, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("invalid permutation {perm:?} for {ndim} dimensions")]
    BadPermutation { perm: Vec<usize>, ndim: usize },

    #[error("cannot expand {from:?} to {to:?}")]
    ExpandMismatch { from: Vec<usize>, to: Vec<usize> },

    #[error("invalid slice [{start}, {end}) on axis {axis} of size {size}")]
    BadSlice {
        axis: usize,
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("cannot reshape {from:?} to {to:?}")]
    ReshapeMismatch { from: Vec<usize>, to: Vec<usize> },

    #[error("movement op on symbolic shape requires concrete dimensions")]
    SymbolicMovement,

    #[error("reduce axis {axis} out of range for rank {ndim}")]
    ReduceAxisOutOfRange { axis: usize, ndim: usize },

    #[error("shape variable '{name}' has no binding")]
    UnboundVariable { name: String },

    #[error("dimension resolved to negative value {dim}")]
    NegativeDim { dim: i64 },
}

/// Dtype errors raised while building a graph. Never silently coerced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DtypeError {
    #[error("no promotion between {lhs} and {rhs}")]
    NoPromotion { lhs: DType, rhs: DType },

    #[error("operation '{op}' does not support dtype {dtype}")]
    Unsupported { op: &'static str, dtype: DType },
}

/// Internal-invariant violation: the kernel graph acquired a cycle.
/// This is defensive only; correct operation never produces it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cycle detected in kernel graph involving kernel {kernel}")]
pub struct GraphCycleError {
    pub kernel: usize,
}

/// A backend rejected a kernel variant at compile time. The optimizer treats
/// this as infinite cost for the variant; it is fatal only when no variant
/// compiles.
#[derive(Debug, Clone, thiserror::Error)]
#[error("backend '{backend}' failed to compile kernel '{kernel}': {message}")]
pub struct CompileError {
    pub backend: String,
    pub kernel: String,
    pub message: String,
}

/// Device memory allocation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to allocate {bytes} bytes on device '{device}': {message}")]
pub struct AllocError {
    pub device: String,
    pub bytes: usize,
    pub message: String,
}

/// Device execution failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("kernel '{kernel}' failed on device '{device}': {message}")]
pub struct ExecError {
    pub device: String,
    pub kernel: String,
    pub message: String,
    /// Transient resource contention may be retried with backoff;
    /// correctness and driver failures must not be.
    pub transient: bool,
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Top-level error for the pipeline entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Dtype(#[from] DtypeError),

    #[error(transparent)]
    GraphCycle(#[from] GraphCycleError),

    #[error("all kernel variants rejected for '{kernel}': last error: {last}")]
    VariantsExhausted { kernel: String, last: CompileError },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("node {0:?} is not an output of the realize request")]
    NotAnOutput(crate::graph::NodeId),

    #[error("store target {0:?} is not an input buffer")]
    StoreTarget(crate::graph::NodeId),

    #[error("input {index} has {got} elements, expected {expected}")]
    InputSizeMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
