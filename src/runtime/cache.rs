//! Compiled-kernel artifact cache.
//!
//! Two layers. The in-memory layer maps a cache key to a live compiled
//! kernel and lasts for the process. The optional disk layer persists the
//! rendered source plus a JSON metadata sidecar across sessions; entries
//! written by a different crate version or compiler version are stale and
//! dropped on load. Corruption on disk is recoverable by construction:
//! a bad entry is deleted and the kernel recompiled.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};

use crate::backend::{CompiledKernel, Device};
use crate::error::Result;
use crate::opt::{KernelPlan, OptAction};
use crate::render::{ArgSpec, LaunchManifest, RenderedKernel};

/// Everything that distinguishes one compiled artifact from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub fingerprint: u64,
    /// Hash of the concrete shapes the source bakes in. The structural
    /// fingerprint is binding-independent, so two bindings of one kernel
    /// must not share an artifact.
    pub shape_hash: u64,
    pub backend: String,
    pub actions: Vec<OptAction>,
    pub compiler_version: String,
}

impl CacheKey {
    pub fn new(plan: &KernelPlan, backend: &str, compiler_version: &str) -> Self {
        let mut h = FxHasher::default();
        plan.kernel.input_shapes.hash(&mut h);
        plan.kernel.out_shape.hash(&mut h);
        plan.kernel.reduce_sizes.hash(&mut h);
        CacheKey {
            fingerprint: plan.kernel.fingerprint,
            shape_hash: h.finish(),
            backend: backend.to_string(),
            actions: plan.actions.clone(),
            compiler_version: compiler_version.to_string(),
        }
    }

    fn hash_value(&self) -> u64 {
        let mut h = FxHasher::default();
        self.fingerprint.hash(&mut h);
        self.shape_hash.hash(&mut h);
        self.backend.hash(&mut h);
        self.actions.hash(&mut h);
        self.compiler_version.hash(&mut h);
        h.finish()
    }

    /// File stem for the disk layer.
    fn file_stem(&self) -> String {
        format!("{:016x}", self.hash_value())
    }
}

/// JSON sidecar stored next to the source blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskArtifact {
    entry_point: String,
    global_size: [usize; 3],
    local_size: Option<[usize; 3]>,
    args: Vec<ArgSpec>,
    backend: String,
    /// Crate version that wrote the entry; any mismatch invalidates it.
    weft_version: String,
}

pub fn weft_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Default disk location, overridable through the config.
pub fn default_cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "weft").map(|dirs| dirs.cache_dir().join("kernels"))
}

pub struct ArtifactCache {
    memory: FxHashMap<u64, Arc<dyn CompiledKernel>>,
    disk_dir: Option<PathBuf>,
    hits: usize,
    misses: usize,
}

impl ArtifactCache {
    pub fn new(disk_dir: Option<PathBuf>) -> Self {
        ArtifactCache {
            memory: FxHashMap::default(),
            disk_dir,
            hits: 0,
            misses: 0,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Fetch the compiled kernel for `key`, compiling (and populating both
    /// layers) on a miss.
    pub fn get_or_compile(
        &mut self,
        key: &CacheKey,
        plan: &KernelPlan,
        rendered: &RenderedKernel,
        device: &dyn Device,
    ) -> Result<Arc<dyn CompiledKernel>> {
        let hash = key.hash_value();
        if let Some(kernel) = self.memory.get(&hash) {
            self.hits += 1;
            debug!("artifact cache hit (memory): {}", plan.kernel.name);
            return Ok(Arc::clone(kernel));
        }

        let rendered = match self.load_disk(key) {
            Some(from_disk) => {
                self.hits += 1;
                debug!("artifact cache hit (disk): {}", plan.kernel.name);
                from_disk
            }
            None => {
                self.misses += 1;
                self.store_disk(key, rendered);
                rendered.clone()
            }
        };

        let compiled: Arc<dyn CompiledKernel> =
            Arc::from(device.compiler().compile(plan, &rendered)?);
        self.memory.insert(hash, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn entry_paths(&self, key: &CacheKey) -> Option<(PathBuf, PathBuf)> {
        let dir = self.disk_dir.as_ref()?.join(&key.backend);
        let stem = key.file_stem();
        Some((dir.join(format!("{stem}.json")), dir.join(format!("{stem}.src"))))
    }

    fn load_disk(&self, key: &CacheKey) -> Option<RenderedKernel> {
        let (meta_path, src_path) = self.entry_paths(key)?;
        let meta_str = std::fs::read_to_string(&meta_path).ok()?;
        let meta: DiskArtifact = match serde_json::from_str(&meta_str) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("dropping corrupt cache entry {}: {err}", meta_path.display());
                drop_entry(&meta_path, &src_path);
                return None;
            }
        };
        if meta.weft_version != weft_version() || meta.backend != key.backend {
            debug!(
                "dropping stale cache entry {} (written by {})",
                meta_path.display(),
                meta.weft_version
            );
            drop_entry(&meta_path, &src_path);
            return None;
        }
        let source = match std::fs::read_to_string(&src_path) {
            Ok(source) => source,
            Err(err) => {
                warn!("dropping cache entry without source {}: {err}", src_path.display());
                drop_entry(&meta_path, &src_path);
                return None;
            }
        };
        Some(RenderedKernel {
            source,
            manifest: LaunchManifest {
                entry_point: meta.entry_point,
                global_size: meta.global_size,
                local_size: meta.local_size,
                args: meta.args,
            },
        })
    }

    fn store_disk(&self, key: &CacheKey, rendered: &RenderedKernel) {
        let Some((meta_path, src_path)) = self.entry_paths(key) else {
            return;
        };
        let meta = DiskArtifact {
            entry_point: rendered.manifest.entry_point.clone(),
            global_size: rendered.manifest.global_size,
            local_size: rendered.manifest.local_size,
            args: rendered.manifest.args.clone(),
            backend: key.backend.clone(),
            weft_version: weft_version().to_string(),
        };
        // A failed write only costs a future recompile.
        if let Err(err) = self.try_store(&meta_path, &src_path, &meta, &rendered.source) {
            warn!("failed to write cache entry {}: {err}", meta_path.display());
        }
    }

    fn try_store(
        &self,
        meta_path: &Path,
        src_path: &Path,
        meta: &DiskArtifact,
        source: &str,
    ) -> std::io::Result<()> {
        if let Some(parent) = meta_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(meta_path, json)?;
        std::fs::write(src_path, source)?;
        debug!("wrote cache entry {}", meta_path.display());
        Ok(())
    }
}

fn drop_entry(meta_path: &Path, src_path: &Path) {
    let _ = std::fs::remove_file(meta_path);
    let _ = std::fs::remove_file(src_path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceProfile, HostDevice};
    use crate::dtype::DType;
    use crate::graph::OpKind;
    use crate::kernelize::KSrc;
    use crate::render::{CRenderer, Renderer};
    use crate::schedule::{BufferId, ExecKernel, ExecOp};

    fn plan() -> KernelPlan {
        KernelPlan::from_kernel(&ExecKernel {
            name: "k0_add".into(),
            fingerprint: 99,
            ops: vec![ExecOp {
                kind: OpKind::Add,
                dtype: DType::F32,
                shape: vec![8],
                src: vec![KSrc::Ext(0), KSrc::Ext(1)],
            }],
            args: vec![BufferId(0), BufferId(1), BufferId(2)],
            input_shapes: vec![vec![8], vec![8]],
            input_dtypes: vec![DType::F32, DType::F32],
            out_shape: vec![8],
            dtype: DType::F32,
            reduce_sizes: Vec::new(),
        })
    }

    #[test]
    fn test_memory_hit_after_miss() {
        let device = HostDevice::new();
        let plan = plan();
        let rendered = CRenderer::new()
            .render(&plan, &DeviceProfile::default())
            .unwrap();
        let key = CacheKey::new(&plan, "host", device.compiler().version());
        let mut cache = ArtifactCache::new(None);
        cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (0, 1));
        cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn test_disk_roundtrip_and_version_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let device = HostDevice::new();
        let plan = plan();
        let rendered = CRenderer::new()
            .render(&plan, &DeviceProfile::default())
            .unwrap();
        let key = CacheKey::new(&plan, "host", device.compiler().version());

        {
            let mut cache = ArtifactCache::new(Some(dir.path().to_path_buf()));
            cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
            assert_eq!(cache.misses(), 1);
        }
        // A fresh cache (new process) hits the disk layer.
        {
            let mut cache = ArtifactCache::new(Some(dir.path().to_path_buf()));
            cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
            assert_eq!((cache.hits(), cache.misses()), (1, 0));
        }
        // Rewrite the metadata with a bogus version; the entry is dropped
        // and recompiled, never fatal.
        let meta_path = dir
            .path()
            .join("host")
            .join(format!("{:016x}.json", key.hash_value()));
        let mut meta: DiskArtifact =
            serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.weft_version = "0.0.0-stale".to_string();
        std::fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();
        {
            let mut cache = ArtifactCache::new(Some(dir.path().to_path_buf()));
            cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
            assert_eq!((cache.hits(), cache.misses()), (0, 1));
        }
    }

    #[test]
    fn test_corrupt_metadata_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let device = HostDevice::new();
        let plan = plan();
        let rendered = CRenderer::new()
            .render(&plan, &DeviceProfile::default())
            .unwrap();
        let key = CacheKey::new(&plan, "host", device.compiler().version());
        let mut cache = ArtifactCache::new(Some(dir.path().to_path_buf()));
        cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();

        let meta_path = dir
            .path()
            .join("host")
            .join(format!("{:016x}.json", key.hash_value()));
        std::fs::write(&meta_path, "{ not json").unwrap();
        let mut cache = ArtifactCache::new(Some(dir.path().to_path_buf()));
        cache.get_or_compile(&key, &plan, &rendered, &device).unwrap();
        assert_eq!(cache.misses(), 1);
        assert!(!meta_path.exists() || serde_json::from_str::<DiskArtifact>(
            &std::fs::read_to_string(&meta_path).unwrap()
        )
        .is_ok());
    }

    #[test]
    fn test_key_distinguishes_actions() {
        let base = plan();
        let profile = DeviceProfile::default();
        let split = base
            .apply(&crate::opt::OptAction::Split { axis: 0, factor: 2 }, &profile)
            .unwrap();
        let k1 = CacheKey::new(&base, "host", "v1");
        let k2 = CacheKey::new(&split, "host", "v1");
        assert_ne!(k1.hash_value(), k2.hash_value());
    }

    #[test]
    fn test_key_distinguishes_concrete_sizes() {
        // One symbolic kernel bound at two sizes shares a fingerprint but
        // compiles to different source, so the keys must differ.
        let base = plan();
        let mut rebound = base.clone();
        rebound.kernel.out_shape = vec![16];
        rebound.kernel.input_shapes = vec![vec![16], vec![16]];
        assert_eq!(base.kernel.fingerprint, rebound.kernel.fingerprint);
        let k1 = CacheKey::new(&base, "host", "v1");
        let k2 = CacheKey::new(&rebound, "host", "v1");
        assert_ne!(k1.hash_value(), k2.hash_value());
    }
}
