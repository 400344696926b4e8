//! JIT replay cache.
//!
//! After a full realize the executor captures two things. Keyed by graph
//! structure alone, the symbolic kernel partition together with the action
//! list the search settled on per kernel; keyed by structure plus bindings,
//! the fully bound plan with its compiled kernels. A repeat request with
//! identical bindings replays the bound entry bit-identically. A request
//! that changes only the scalar bindings rebinds the captured partition:
//! shapes are re-resolved and the captured actions re-applied, skipping
//! kernelize and the search. Only a structural change falls back to the
//! full path.

use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::backend::CompiledKernel;
use crate::kernelize::KernelGraph;
use crate::opt::OptAction;
use crate::schedule::SchedulePlan;

/// Binding-independent capture of one realized graph.
pub struct CapturedSearch {
    /// The kernel partition with symbolic shapes.
    pub partition: KernelGraph,
    /// Chosen action list per kernel fingerprint.
    pub tuned: FxHashMap<u64, Vec<OptAction>>,
}

/// A plan frozen at capture time under one set of bindings, ready to
/// replay as-is.
pub struct CapturedPlan {
    pub plan: SchedulePlan,
    /// Compiled kernel per `plan.kernels` entry, in the same order.
    pub kernels: Vec<Arc<dyn CompiledKernel>>,
}

#[derive(Default)]
pub struct JitCache {
    searches: FxHashMap<u64, Arc<CapturedSearch>>,
    bound: FxHashMap<(u64, u64), Arc<CapturedPlan>>,
    hits: usize,
    misses: usize,
}

impl JitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// The plan captured under exactly these bindings, if any. A hit here
    /// replays without touching the pipeline at all.
    pub fn lookup_bound(&mut self, structural: u64, bindings: u64) -> Option<Arc<CapturedPlan>> {
        let captured = self.bound.get(&(structural, bindings))?;
        self.hits += 1;
        debug!("jit replay hit {structural:016x}/{bindings:016x}");
        Some(Arc::clone(captured))
    }

    /// The structural capture for this graph, if any. Counts the replay
    /// miss when there is none; call after [`lookup_bound`] came up empty.
    ///
    /// [`lookup_bound`]: JitCache::lookup_bound
    pub fn lookup_search(&mut self, structural: u64) -> Option<Arc<CapturedSearch>> {
        match self.searches.get(&structural) {
            Some(captured) => {
                self.hits += 1;
                debug!("jit rebind hit {structural:016x}");
                Some(Arc::clone(captured))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn capture_search(
        &mut self,
        structural: u64,
        partition: KernelGraph,
        tuned: FxHashMap<u64, Vec<OptAction>>,
    ) {
        self.searches
            .insert(structural, Arc::new(CapturedSearch { partition, tuned }));
        debug!("jit captured search {structural:016x}");
    }

    pub fn capture_bound(
        &mut self,
        structural: u64,
        bindings: u64,
        plan: SchedulePlan,
        kernels: Vec<Arc<dyn CompiledKernel>>,
    ) {
        debug_assert_eq!(plan.kernels.len(), kernels.len());
        self.bound
            .insert((structural, bindings), Arc::new(CapturedPlan { plan, kernels }));
        debug!("jit captured plan {structural:016x}/{bindings:016x}");
    }

    pub fn clear(&mut self) {
        self.searches.clear();
        self.bound.clear();
    }
}
