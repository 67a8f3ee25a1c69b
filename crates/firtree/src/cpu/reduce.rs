//! Reduce engine: runs reduce kernels over a grid, collecting emitted
//! elements into a lock-free set.

use super::jit::{CompiledReduce, CpuJit};
use crate::error::RenderError;
use crate::kernel::KernelSampler;
use crate::linker::{link_sampler, ParamSlot};
use crate::lockfree::LockFreeSet;
use crate::sampler::{Extent, Sampler};
use super::renderer::strip_partition;
use firtree_ir::KernelTarget;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, error};

struct ReduceCache {
    version: u64,
    static_hash: u64,
    compiled: Arc<CompiledReduce>,
    slots: Vec<ParamSlot>,
}

struct EngineState {
    kernel: Option<KernelSampler>,
    cache: Option<ReduceCache>,
}

/// Drives a reduce-target kernel over an output grid.
pub struct CpuReduceEngine {
    jit: CpuJit,
    state: Mutex<EngineState>,
}

impl CpuReduceEngine {
    pub fn new() -> CpuReduceEngine {
        CpuReduceEngine {
            jit: CpuJit::new(),
            state: Mutex::new(EngineState { kernel: None, cache: None }),
        }
    }

    /// Attach a reduce kernel. Non-reduce kernels are rejected.
    pub fn set_kernel(&self, kernel: Option<KernelSampler>) -> Result<(), RenderError> {
        if let Some(kernel) = &kernel {
            if kernel.target() != Some(KernelTarget::Reduce) {
                return Err(RenderError::NotReduce);
            }
        }
        let mut state = self.state.lock();
        state.kernel = kernel;
        state.cache = None;
        Ok(())
    }

    pub fn kernel(&self) -> Option<KernelSampler> {
        self.state.lock().kernel.clone()
    }

    /// Run the kernel over a `width`×`height` grid spanning `extent`,
    /// appending every emitted element to `set`. Element order in the set
    /// is unspecified.
    pub fn run(&self, set: &LockFreeSet, extent: Extent, width: u32, height: u32) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let kernel = self.state.lock().kernel.clone().ok_or(RenderError::NoSampler)?;
        let _render_guard = kernel.lock_render();
        if !kernel.is_valid() {
            return Err(RenderError::InvalidSampler);
        }

        let Some(compiled) = self.compiled_for(&kernel) else {
            return Ok(());
        };
        if compiled.element_lanes > 0 && compiled.element_lanes * 4 != set.element_size() {
            return Err(RenderError::SinkElementMismatch {
                sink: set.element_size(),
                kernel: compiled.element_lanes * 4,
            });
        }

        let func = compiled.func;
        let sink = set as *const LockFreeSet as usize;
        strip_partition(extent, height).into_par_iter().for_each(|strip| {
            unsafe { func(sink as *mut std::ffi::c_void, width, strip.n_rows, strip.extent.as_ptr()) };
        });
        Ok(())
    }

    fn compiled_for(&self, kernel: &KernelSampler) -> Option<Arc<CompiledReduce>> {
        let sampler = Sampler::Kernel(kernel.clone());
        let version = sampler.module_version();
        let mut hasher = DefaultHasher::new();
        sampler.hash_static(&mut hasher);
        let static_hash = hasher.finish();

        let mut state = self.state.lock();
        let stale = match &state.cache {
            Some(cache) => cache.version != version || cache.static_hash != static_hash,
            None => true,
        };
        if stale {
            state.cache = None;
            let linked = match link_sampler(&sampler) {
                Ok(linked) => linked,
                Err(err) => {
                    error!(%err, "linking failed for a valid reduce kernel");
                    return None;
                }
            };
            let compiled = match self.jit.compile_reduce(&linked) {
                Ok(compiled) => Arc::new(compiled),
                Err(err) => {
                    error!(%err, "JIT compilation failed; no reduce function produced");
                    return None;
                }
            };
            debug!(version, "reduce function (re)compiled");
            state.cache = Some(ReduceCache {
                version,
                static_hash,
                compiled,
                slots: linked.param_slots,
            });
        }

        let cache = state.cache.as_ref().unwrap();
        for slot in &cache.slots {
            if let Some(lanes) = slot.provider.argument(&slot.name).and_then(|v| v.to_lanes()) {
                unsafe { cache.compiled.params.write(slot.offset, &lanes) };
            }
        }
        Some(cache.compiled.clone())
    }
}

impl Default for CpuReduceEngine {
    fn default() -> CpuReduceEngine {
        CpuReduceEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn rejects_render_kernels() {
        let engine = CpuReduceEngine::new();
        let compiled = StdArc::new(firtree_kernel::CompiledKernel::compile(
            "kernel vec4 f() { return vec4(1.0); }",
        ));
        let kernel = KernelSampler::with_kernel(compiled, None).unwrap();
        assert!(matches!(engine.set_kernel(Some(kernel)), Err(RenderError::NotReduce)));
    }
}
