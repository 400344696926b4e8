//! Iteration-structure plans for a single kernel.
//!
//! A plan wraps a resolved kernel with an ordered list of axes describing
//! how its iteration space is walked. Optimization actions transform the
//! axes only; the member op sequence is never touched, so every plan of a
//! kernel computes the same values.

use crate::backend::DeviceProfile;
use crate::schedule::ExecKernel;
use crate::shape::num_elements;

/// How an axis is realized in the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisKind {
    /// Parallel output axis (grid dimension or outer loop).
    Global,
    /// Output axis promoted to the local work group.
    Local,
    /// Sequential accumulator axis of the kernel's reduction.
    Reduce,
    /// Fully unrolled loop body.
    Unrolled,
    /// Vectorized innermost axis.
    Vector,
}

/// One axis of the iteration space.
///
/// Splitting keeps track of the logical dimension an axis came from: the
/// logical index along dimension `logical` is the sum of `var * stride`
/// over all axes sharing that `logical`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Axis {
    pub size: usize,
    pub kind: AxisKind,
    /// Logical dimension covered: output dims first, then reduce dims.
    pub logical: usize,
    /// Multiplier of this axis variable within the logical index.
    pub stride: usize,
}

/// One optimization step applied to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptAction {
    /// Split an axis into an outer axis of `size / factor` and an inner
    /// axis of `factor`.
    Split { axis: usize, factor: usize },
    /// Permute the axis order.
    Reorder { perm: Vec<usize> },
    /// Promote a global output axis to the local work group.
    PromoteLocal { axis: usize },
    /// Unroll `factor` iterations of an axis.
    Unroll { axis: usize, factor: usize },
    /// Vectorize the innermost axis by `width`.
    Vectorize { width: usize },
}

impl std::fmt::Display for OptAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptAction::Split { axis, factor } => write!(f, "split(ax{axis}, {factor})"),
            OptAction::Reorder { perm } => write!(f, "reorder({perm:?})"),
            OptAction::PromoteLocal { axis } => write!(f, "local(ax{axis})"),
            OptAction::Unroll { axis, factor } => write!(f, "unroll(ax{axis}, {factor})"),
            OptAction::Vectorize { width } => write!(f, "vectorize({width})"),
        }
    }
}

/// A kernel plus its iteration structure and the actions that produced it.
#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub kernel: ExecKernel,
    pub axes: Vec<Axis>,
    pub actions: Vec<OptAction>,
}

impl KernelPlan {
    /// The untransformed plan: one global axis per output dimension, one
    /// reduce axis per reduced dimension, in order.
    pub fn from_kernel(kernel: &ExecKernel) -> Self {
        let mut axes = Vec::new();
        for (d, &size) in kernel.out_shape.iter().enumerate() {
            axes.push(Axis {
                size,
                kind: AxisKind::Global,
                logical: d,
                stride: 1,
            });
        }
        let n_out = kernel.out_shape.len();
        for (d, &size) in kernel.reduce_sizes.iter().enumerate() {
            axes.push(Axis {
                size,
                kind: AxisKind::Reduce,
                logical: n_out + d,
                stride: 1,
            });
        }
        KernelPlan {
            kernel: kernel.clone(),
            axes,
            actions: Vec::new(),
        }
    }

    pub fn num_output_dims(&self) -> usize {
        self.kernel.out_shape.len()
    }

    /// Product of the parallel (global + local) axis sizes.
    pub fn global_size(&self) -> usize {
        self.axes
            .iter()
            .filter(|a| matches!(a.kind, AxisKind::Global | AxisKind::Local))
            .map(|a| a.size)
            .product::<usize>()
            .max(1)
    }

    /// Product of the local axis sizes, 1 when nothing is promoted.
    pub fn local_size(&self) -> usize {
        self.axes
            .iter()
            .filter(|a| a.kind == AxisKind::Local)
            .map(|a| a.size)
            .product::<usize>()
            .max(1)
    }

    /// Apply one action, returning `None` when it is illegal on this plan
    /// or this device. Illegal actions are skipped by the search, never
    /// errors.
    pub fn apply(&self, action: &OptAction, profile: &DeviceProfile) -> Option<KernelPlan> {
        let mut next = self.clone();
        match action {
            OptAction::Split { axis, factor } => {
                let ax = self.axes.get(*axis)?;
                if *factor < 2 || ax.size <= *factor || ax.size % *factor != 0 {
                    return None;
                }
                if matches!(ax.kind, AxisKind::Unrolled | AxisKind::Vector) {
                    return None;
                }
                let outer = Axis {
                    size: ax.size / factor,
                    kind: ax.kind,
                    logical: ax.logical,
                    stride: ax.stride * factor,
                };
                let inner = Axis {
                    size: *factor,
                    kind: ax.kind,
                    logical: ax.logical,
                    stride: ax.stride,
                };
                next.axes.splice(*axis..=*axis, [outer, inner]);
            }
            OptAction::Reorder { perm } => {
                if perm.len() != self.axes.len() {
                    return None;
                }
                let mut seen = vec![false; perm.len()];
                for &p in perm {
                    if p >= perm.len() || seen[p] {
                        return None;
                    }
                    seen[p] = true;
                }
                let reordered: Vec<Axis> = perm.iter().map(|&p| self.axes[p].clone()).collect();
                // The accumulator nest stays innermost: once the reduce
                // space starts, no output-dimension axis may follow,
                // whatever kind unrolling has turned it into.
                let n_out = self.num_output_dims();
                let first_reduce = reordered
                    .iter()
                    .position(|a| a.logical >= n_out)
                    .unwrap_or(reordered.len());
                if reordered[first_reduce..].iter().any(|a| a.logical < n_out) {
                    return None;
                }
                next.axes = reordered;
            }
            OptAction::PromoteLocal { axis } => {
                let ax = self.axes.get(*axis)?;
                if ax.kind != AxisKind::Global {
                    return None;
                }
                let local_elems = self.local_size() * ax.size;
                if local_elems > profile.max_work_group_size {
                    return None;
                }
                if local_elems * self.kernel.dtype.size_in_bytes() > profile.local_memory_size {
                    return None;
                }
                next.axes[*axis].kind = AxisKind::Local;
            }
            OptAction::Unroll { axis, factor } => {
                let ax = self.axes.get(*axis)?;
                if !matches!(ax.kind, AxisKind::Global | AxisKind::Reduce) {
                    return None;
                }
                if *factor < 2 || *factor > 16 || ax.size % *factor != 0 {
                    return None;
                }
                if *factor == ax.size {
                    next.axes[*axis].kind = AxisKind::Unrolled;
                } else {
                    let outer = Axis {
                        size: ax.size / factor,
                        kind: ax.kind,
                        logical: ax.logical,
                        stride: ax.stride * factor,
                    };
                    let inner = Axis {
                        size: *factor,
                        kind: AxisKind::Unrolled,
                        logical: ax.logical,
                        stride: ax.stride,
                    };
                    next.axes.splice(*axis..=*axis, [outer, inner]);
                }
            }
            OptAction::Vectorize { width } => {
                // Only the innermost axis, and only when it walks the
                // fastest-varying output dimension with unit stride, so
                // vector loads and stores stay contiguous.
                let last = self.axes.len().checked_sub(1)?;
                let ax = &self.axes[last];
                let n_out = self.num_output_dims();
                if ax.kind != AxisKind::Global
                    || ax.stride != 1
                    || n_out == 0
                    || ax.logical != n_out - 1
                {
                    return None;
                }
                if *width < 2 || ax.size % *width != 0 {
                    return None;
                }
                if !profile.supports_simd_width(self.kernel.dtype, *width) {
                    return None;
                }
                if ax.size == *width {
                    next.axes[last].kind = AxisKind::Vector;
                } else {
                    let outer = Axis {
                        size: ax.size / width,
                        kind: AxisKind::Global,
                        logical: ax.logical,
                        stride: *width,
                    };
                    let inner = Axis {
                        size: *width,
                        kind: AxisKind::Vector,
                        logical: ax.logical,
                        stride: 1,
                    };
                    next.axes.splice(last..=last, [outer, inner]);
                }
            }
        }
        next.actions.push(action.clone());
        Some(next)
    }

    /// Enumerate candidate actions for the search, in a fixed order so
    /// tie-breaking is deterministic.
    pub fn candidate_actions(&self, profile: &DeviceProfile) -> Vec<OptAction> {
        let mut actions = Vec::new();
        for axis in 0..self.axes.len() {
            for &factor in &profile.preferred_tile_sizes {
                actions.push(OptAction::Split { axis, factor });
            }
            actions.push(OptAction::PromoteLocal { axis });
            for factor in [2, 4, 8] {
                actions.push(OptAction::Unroll { axis, factor });
            }
        }
        for width in profile.available_simd_widths(self.kernel.dtype) {
            if width > 1 {
                actions.push(OptAction::Vectorize { width });
            }
        }
        // Adjacent swaps cover reorderings incrementally.
        for i in 0..self.axes.len().saturating_sub(1) {
            let mut perm: Vec<usize> = (0..self.axes.len()).collect();
            perm.swap(i, i + 1);
            actions.push(OptAction::Reorder { perm });
        }
        actions
    }

    /// Verify the axes still cover the kernel's iteration space exactly.
    /// Used by debug assertions in the search.
    pub fn covers_iteration_space(&self) -> bool {
        let axis_product: usize = self.axes.iter().map(|a| a.size).product();
        let expected = num_elements(&self.kernel.out_shape)
            * self.kernel.reduce_sizes.iter().product::<usize>().max(1);
        axis_product == expected.max(1)
    }
}
