//! Compiles lazy tensor computation graphs into fused, tuned kernels and
//! runs them on pluggable backends.
//!
//! Building a graph computes nothing: ops intern immutable nodes into an
//! arena and structurally identical nodes share one id. `realize` drives
//! the pipeline end to end: the graph is partitioned into maximal fusable
//! kernels, linearized into a schedule with exact buffer lifetimes, each
//! kernel's loop structure is tuned by beam search against a cost model,
//! the winners are rendered to source, compiled through a two-layer
//! artifact cache and executed. Repeating an identical request replays the
//! captured plan without recompiling anything.
//!
//! ```
//! use weft::{Bindings, Config, DType, Executor, Graph, HostTensor, ShapeExpr};
//!
//! let g = Graph::new();
//! let a = g.input(DType::F32, vec![ShapeExpr::Const(3)]);
//! let b = g.input(DType::F32, vec![ShapeExpr::Const(3)]);
//! let sum = (a + b).sum_all().as_output();
//!
//! let mut exec = Executor::new(Config::default())?;
//! let mut inputs = vec![
//!     HostTensor::from_f32(vec![3], &[1.0, 2.0, 3.0]),
//!     HostTensor::from_f32(vec![3], &[4.0, 5.0, 6.0]),
//! ];
//! let out = exec.realize(&g, &mut inputs, &Bindings::new())?;
//! assert_eq!(out.get(sum.id)?.to_f32(), vec![21.0]);
//! # Ok::<(), weft::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod kernelize;
pub mod opt;
pub mod render;
pub mod runtime;
pub mod schedule;
pub mod shape;

pub use backend::{Device, DeviceProfile, HostDevice};
pub use config::{Config, CostMode, RetryPolicy};
pub use dtype::{Const, DType};
pub use error::{Error, Result};
pub use graph::{Graph, NodeId, NodeView, OpKind, ReduceOp};
pub use runtime::{Executor, HostTensor, Realized};
pub use shape::{Bindings, ShapeExpr};
