//! Strided views over linear buffers.
//!
//! A `View` maps a multi-index in its shape to a linear offset into an
//! underlying buffer. Movement operations (reshape, permute, expand, shrink)
//! produce new views without touching data. Consecutive views are composed
//! into one where the combined mapping stays affine; otherwise they stack
//! into a `ViewChain` that applies them in sequence.

use crate::error::ShapeError;
use crate::shape::{contiguous_strides, num_elements};

/// A single strided view: `linear = offset + sum(idx[i] * strides[i])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    pub shape: Vec<usize>,
    pub strides: Vec<isize>,
    pub offset: isize,
}

impl View {
    /// Contiguous row-major view over `shape`.
    pub fn contiguous(shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        View {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == contiguous_strides(&self.shape)
    }

    /// Linear offset for a multi-index.
    pub fn index(&self, idx: &[usize]) -> isize {
        debug_assert_eq!(idx.len(), self.shape.len());
        self.offset
            + idx
                .iter()
                .zip(&self.strides)
                .map(|(&i, &s)| i as isize * s)
                .sum::<isize>()
    }

    /// Permute the axes. `perm` must be a permutation of `0..ndim`.
    pub fn permute(&self, perm: &[usize]) -> Result<View, ShapeError> {
        if perm.len() != self.shape.len() {
            return Err(ShapeError::BadPermutation {
                perm: perm.to_vec(),
                ndim: self.shape.len(),
            });
        }
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            if p >= perm.len() || seen[p] {
                return Err(ShapeError::BadPermutation {
                    perm: perm.to_vec(),
                    ndim: self.shape.len(),
                });
            }
            seen[p] = true;
        }
        Ok(View {
            shape: perm.iter().map(|&p| self.shape[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
            offset: self.offset,
        })
    }

    /// Broadcast size-1 axes up to `new_shape` with stride 0.
    pub fn expand(&self, new_shape: &[usize]) -> Result<View, ShapeError> {
        if new_shape.len() != self.shape.len() {
            return Err(ShapeError::ExpandMismatch {
                from: self.shape.clone(),
                to: new_shape.to_vec(),
            });
        }
        let mut strides = self.strides.clone();
        for (i, (&old, &new)) in self.shape.iter().zip(new_shape).enumerate() {
            if old == new {
                continue;
            }
            if old == 1 {
                strides[i] = 0;
            } else {
                return Err(ShapeError::ExpandMismatch {
                    from: self.shape.clone(),
                    to: new_shape.to_vec(),
                });
            }
        }
        Ok(View {
            shape: new_shape.to_vec(),
            strides,
            offset: self.offset,
        })
    }

    /// Restrict each axis to `[start, end)`.
    pub fn shrink(&self, ranges: &[(usize, usize)]) -> Result<View, ShapeError> {
        if ranges.len() != self.shape.len() {
            return Err(ShapeError::RankMismatch {
                expected: self.shape.len(),
                got: ranges.len(),
            });
        }
        let mut offset = self.offset;
        let mut shape = Vec::with_capacity(ranges.len());
        for (i, &(start, end)) in ranges.iter().enumerate() {
            if start > end || end > self.shape[i] {
                return Err(ShapeError::BadSlice {
                    axis: i,
                    start,
                    end,
                    size: self.shape[i],
                });
            }
            offset += start as isize * self.strides[i];
            shape.push(end - start);
        }
        Ok(View {
            shape,
            strides: self.strides.clone(),
            offset,
        })
    }

    /// Reshape. Succeeds directly on contiguous views; on strided views it
    /// succeeds when axis groups can be split/merged without data movement.
    pub fn reshape(&self, new_shape: &[usize]) -> Option<View> {
        if num_elements(new_shape) != self.num_elements() {
            return None;
        }
        if self.shape == new_shape {
            return Some(self.clone());
        }
        if self.is_contiguous() {
            return Some(View::contiguous(new_shape.to_vec()));
        }
        // Strided reshape: greedily match groups of old axes whose strides
        // are themselves contiguous against groups of new axes.
        merge_reshape(&self.shape, &self.strides, new_shape).map(|strides| View {
            shape: new_shape.to_vec(),
            strides,
            offset: self.offset,
        })
    }

    /// Algebraically merge `outer` (a view built over this view's logical,
    /// contiguous index space) with this view. Returns `None` when the
    /// combined mapping is not expressible as a single strided view.
    pub fn compose(&self, outer: &View) -> Option<View> {
        // Inner contiguous: outer strides already address raw memory,
        // shifted by the inner offset.
        if self.is_contiguous() {
            return Some(View {
                shape: outer.shape.clone(),
                strides: outer.strides.clone(),
                offset: self.offset + outer.offset,
            });
        }
        // Outer identity: nothing to do.
        if outer.is_contiguous() && outer.shape == self.shape {
            return Some(self.clone());
        }
        // Each outer axis must address exactly one inner axis: its stride is
        // a multiple of that axis's contiguous weight and its extent stays
        // inside the axis block. This covers permutes, expands and shrinks
        // of arbitrary strided inners.
        let weights = contiguous_strides(&self.shape);
        let mut strides = Vec::with_capacity(outer.shape.len());
        for (i, &size) in outer.shape.iter().enumerate() {
            let st = outer.strides[i];
            if st == 0 || size == 1 {
                strides.push(0);
                continue;
            }
            let axis = find_axis(&weights, &self.shape, st, size)?;
            let mult = st / weights[axis];
            strides.push(mult * self.strides[axis]);
        }
        // The outer offset selects a starting coordinate in the inner space.
        let mut offset = self.offset;
        let mut rem = outer.offset;
        for (j, &w) in weights.iter().enumerate() {
            let c = rem / w;
            rem %= w;
            if c != 0 {
                if c < 0 || c as usize >= self.shape[j] {
                    return None;
                }
                offset += c * self.strides[j];
            }
        }
        if rem != 0 {
            return None;
        }
        Some(View {
            shape: outer.shape.clone(),
            strides,
            offset,
        })
    }
}

/// Find the inner axis an outer axis of stride `st` and extent `size` walks
/// over, given the inner's contiguous weights.
fn find_axis(weights: &[isize], shape: &[usize], st: isize, size: usize) -> Option<usize> {
    for (j, &w) in weights.iter().enumerate() {
        if w == 0 || st % w != 0 {
            continue;
        }
        let mult = st / w;
        if mult <= 0 {
            continue;
        }
        // Walking (size-1) steps of mult must stay within the axis.
        if mult as usize * (size - 1) < shape[j] {
            return Some(j);
        }
    }
    None
}

/// Strided reshape by matching contiguously-strided axis groups.
fn merge_reshape(shape: &[usize], strides: &[isize], new_shape: &[usize]) -> Option<Vec<isize>> {
    // Drop size-1 axes, they carry no stride information.
    let old: Vec<(usize, isize)> = shape
        .iter()
        .zip(strides)
        .filter(|(&s, _)| s != 1)
        .map(|(&s, &st)| (s, st))
        .collect();

    let mut result = vec![0isize; new_shape.len()];
    let mut oi = 0;
    let mut ni = 0;
    while ni < new_shape.len() {
        if new_shape[ni] == 1 {
            result[ni] = 0;
            ni += 1;
            continue;
        }
        if oi >= old.len() {
            return None;
        }
        // Accumulate old axes until sizes match the product of new axes.
        let mut old_prod = old[oi].0;
        let mut oj = oi + 1;
        let mut new_prod = new_shape[ni];
        let mut nj = ni + 1;
        while old_prod != new_prod {
            if old_prod < new_prod {
                if oj >= old.len() {
                    return None;
                }
                old_prod *= old[oj].0;
                oj += 1;
            } else {
                if nj >= new_shape.len() {
                    return None;
                }
                new_prod *= new_shape[nj];
                nj += 1;
            }
        }
        // The old group must be internally contiguous.
        for k in oi..oj - 1 {
            if old[k].1 != old[k + 1].1 * old[k + 1].0 as isize {
                return None;
            }
        }
        // Assign strides to the new group, innermost first.
        let mut acc = old[oj - 1].1;
        for k in (ni..nj).rev() {
            if new_shape[k] == 1 {
                result[k] = 0;
                continue;
            }
            result[k] = acc;
            acc *= new_shape[k] as isize;
        }
        oi = oj;
        ni = nj;
    }
    if oi != old.len() { None } else { Some(result) }
}

/// A sequence of views applied innermost-first. Most chains collapse to a
/// single view via `push`; the general case keeps the stack and applies it
/// index by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewChain {
    views: Vec<View>,
}

impl ViewChain {
    pub fn new(view: View) -> Self {
        ViewChain { views: vec![view] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.views.last().expect("chain is never empty").shape
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn is_single(&self) -> bool {
        self.views.len() == 1
    }

    /// Append a view over the current logical shape, merging when possible.
    pub fn push(&mut self, outer: View) {
        let last = self.views.last_mut().expect("chain is never empty");
        if let Some(merged) = last.compose(&outer) {
            *last = merged;
        } else {
            self.views.push(outer);
        }
    }

    /// Map a multi-index in the outermost shape to a raw linear offset.
    pub fn index(&self, idx: &[usize]) -> isize {
        let mut lin = self.views.last().expect("chain is never empty").index(idx);
        for pair in self.views.windows(2).rev() {
            let inner = &pair[0];
            // The linear position addresses the inner view's logical space.
            let coords = unravel(lin as usize, &inner.shape);
            lin = inner.index(&coords);
        }
        lin
    }
}

/// Convert a linear index into a multi-index over `shape` (row major).
pub fn unravel(mut lin: usize, shape: &[usize]) -> Vec<usize> {
    let mut idx = vec![0usize; shape.len()];
    for (i, &s) in shape.iter().enumerate().rev() {
        if s > 0 {
            idx[i] = lin % s;
            lin /= s;
        }
    }
    idx
}
