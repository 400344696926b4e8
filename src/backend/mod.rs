//! Device abstraction.
//!
//! Backends expose four object-safe traits: a [`Device`] owning memory and
//! a compiler, [`DeviceBuffer`] for device memory, [`BackendCompiler`]
//! turning rendered kernels into executable form, and [`CompiledKernel`]
//! for launches. Capabilities are described up front by a
//! [`DeviceProfile`]; nothing in the pipeline inspects a backend's type at
//! runtime, it only reads the profile it was configured with.

pub mod host;
mod registry;

pub use host::HostDevice;
pub use registry::{get_device, init, register, reset_for_tests};

use std::time::Duration;

use crate::dtype::DType;
use crate::error::{AllocError, CompileError, ExecError};
use crate::opt::KernelPlan;
use crate::render::RenderedKernel;

/// Supported vector width for one dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub dtype: DType,
    pub width: usize,
}

impl SimdCapability {
    pub fn new(dtype: DType, width: usize) -> Self {
        Self { dtype, width }
    }
}

/// Hardware characteristics consulted by the optimizer and renderers.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Number of compute units (cores, CUs, SMs).
    pub compute_units: usize,
    /// Maximum work group size.
    pub max_work_group_size: usize,
    /// Local memory per work group in bytes.
    pub local_memory_size: usize,
    /// Warp or wavefront size.
    pub warp_size: usize,
    /// Preferred split factors for loop tiling.
    pub preferred_tile_sizes: Vec<usize>,
    /// Supported vector widths per dtype.
    pub simd_capabilities: Vec<SimdCapability>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            compute_units: 16,
            max_work_group_size: 1024,
            local_memory_size: 32768,
            warp_size: 32,
            preferred_tile_sizes: vec![16, 32, 64, 128],
            simd_capabilities: vec![
                SimdCapability::new(DType::F32, 4),
                SimdCapability::new(DType::F64, 2),
                SimdCapability::new(DType::I32, 4),
                SimdCapability::new(DType::I64, 2),
            ],
        }
    }
}

impl DeviceProfile {
    /// Maximum vector width for a dtype, 1 when nothing is declared.
    pub fn simd_width(&self, dtype: DType) -> usize {
        self.simd_capabilities
            .iter()
            .filter(|c| c.dtype == dtype)
            .map(|c| c.width)
            .max()
            .unwrap_or(1)
    }

    pub fn supports_simd_width(&self, dtype: DType, width: usize) -> bool {
        width <= self.simd_width(dtype)
    }

    /// Powers of two up to the maximum width.
    pub fn available_simd_widths(&self, dtype: DType) -> Vec<usize> {
        let max = self.simd_width(dtype);
        let mut widths = Vec::new();
        let mut w = 1;
        while w <= max {
            widths.push(w);
            w *= 2;
        }
        widths
    }
}

/// A compute device.
pub trait Device: Send + Sync {
    /// Stable identifier, also used in cache keys ("host", "c", ...).
    fn name(&self) -> &str;

    fn profile(&self) -> &DeviceProfile;

    fn compiler(&self) -> &dyn BackendCompiler;

    /// Allocate an uninitialized (zeroed) buffer of `bytes`.
    fn alloc(&self, bytes: usize, dtype: DType) -> Result<Box<dyn DeviceBuffer>, AllocError>;

    /// Block until every enqueued launch has completed.
    fn synchronize(&self) -> Result<(), ExecError>;
}

/// Memory owned by a device.
pub trait DeviceBuffer: Send {
    fn byte_len(&self) -> usize;

    fn dtype(&self) -> DType;

    fn write_from_host(&mut self, data: &[u8]) -> Result<(), ExecError>;

    fn read_to_host(&self) -> Result<Vec<u8>, ExecError>;
}

/// Compiles rendered kernels for one device.
pub trait BackendCompiler: Send + Sync {
    /// Compiler identity and version, mixed into artifact cache keys so a
    /// toolchain upgrade invalidates stale artifacts.
    fn version(&self) -> &str;

    fn compile(
        &self,
        plan: &KernelPlan,
        rendered: &RenderedKernel,
    ) -> Result<Box<dyn CompiledKernel>, CompileError>;
}

/// An executable kernel.
pub trait CompiledKernel: Send + Sync {
    fn entry_point(&self) -> &str;

    /// Enqueue one launch. Buffers follow the manifest's argument order:
    /// inputs first, the output last.
    fn launch(&self, args: &mut [&mut (dyn DeviceBuffer + '_)]) -> Result<(), ExecError>;

    /// Wall time of the most recent completed launch.
    fn elapsed(&self) -> Option<Duration>;
}
