//! Source generation for optimized kernel plans.
//!
//! A renderer turns a [`KernelPlan`] into source text plus a launch
//! manifest. Rejection is a value, never a panic: a renderer that cannot
//! express a plan returns a structured [`RenderRejection`] and the search
//! treats the variant as infinitely expensive. A renderer may lower an
//! unsupported transform to a supported equivalent only when the lowering
//! is exact (vectorize to unroll, for example); it must never silently
//! emit wrong code.

mod c;

pub use c::CRenderer;

use crate::backend::DeviceProfile;
use crate::dtype::DType;
use crate::opt::KernelPlan;

/// Why a plan could not be rendered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderRejection {
    #[error("the {target} target cannot express {action}")]
    UnsupportedAction {
        target: &'static str,
        action: String,
    },

    #[error("work group of {requested} exceeds device limit {limit}")]
    GroupSizeExceeded { requested: usize, limit: usize },

    #[error("local tile of {requested} bytes exceeds device limit {limit}")]
    LocalMemoryExceeded { requested: usize, limit: usize },
}

/// One buffer argument of a rendered kernel, in call order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArgSpec {
    pub dtype: DType,
    /// Whether the kernel writes through this argument.
    pub mutable: bool,
}

/// Everything a backend needs to compile and launch the source.
#[derive(Debug, Clone)]
pub struct LaunchManifest {
    pub entry_point: String,
    pub global_size: [usize; 3],
    pub local_size: Option<[usize; 3]>,
    pub args: Vec<ArgSpec>,
}

/// Rendered source plus its launch manifest.
#[derive(Debug, Clone)]
pub struct RenderedKernel {
    pub source: String,
    pub manifest: LaunchManifest,
}

/// Turns kernel plans into backend source.
pub trait Renderer {
    /// Identifier used in cache keys and diagnostics.
    fn target(&self) -> &'static str;

    fn render(
        &self,
        plan: &KernelPlan,
        profile: &DeviceProfile,
    ) -> Result<RenderedKernel, RenderRejection>;
}
