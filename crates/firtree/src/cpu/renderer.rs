//! Tiled CPU renderer.
//!
//! Slices the output rectangle into 8-row strips and fans them out over
//! the rayon worker pool; each strip invokes the JIT-compiled render
//! function with its own sub-extent. The compiled function is cached per
//! `(format, module version, static hash)` and re-materialised whenever the
//! provider graph's link-time inputs change.

use super::jit::{CompiledRender, CpuJit};
use super::STRIP_HEIGHT;
use crate::error::RenderError;
use crate::format::BufferFormat;
use crate::linker::{link_sampler, ParamSlot};
use crate::sampler::{Extent, Sampler};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, error};

/// One dispatched strip of output rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Strip {
    pub start_row: u32,
    pub n_rows: u32,
    pub extent: Extent,
}

/// Partition `num_rows` rows of `extent` into strips of up to
/// [`STRIP_HEIGHT`] rows. The strip extents tile the input exactly:
/// pairwise disjoint in y and unioning back to `extent`.
pub fn strip_partition(extent: Extent, num_rows: u32) -> Vec<Strip> {
    let dy = extent[3] / num_rows as f32;
    let jobs = num_rows.div_ceil(STRIP_HEIGHT);
    (0..jobs)
        .map(|job| {
            let start_row = job * STRIP_HEIGHT;
            let n_rows = (start_row + STRIP_HEIGHT).min(num_rows) - start_row;
            Strip {
                start_row,
                n_rows,
                extent: [
                    extent[0],
                    extent[1] + dy * start_row as f32,
                    extent[2],
                    dy * n_rows as f32,
                ],
            }
        })
        .collect()
}

struct RenderCache {
    format: BufferFormat,
    version: u64,
    static_hash: u64,
    compiled: Arc<CompiledRender>,
    slots: Vec<ParamSlot>,
}

struct RendererState {
    sampler: Option<Sampler>,
    cache: Option<RenderCache>,
}

/// Renders a sampler graph into pixel buffers.
pub struct CpuRenderer {
    jit: CpuJit,
    state: Mutex<RendererState>,
}

impl CpuRenderer {
    pub fn new() -> CpuRenderer {
        CpuRenderer {
            jit: CpuJit::new(),
            state: Mutex::new(RendererState { sampler: None, cache: None }),
        }
    }

    pub fn set_sampler(&self, sampler: Option<Sampler>) {
        let mut state = self.state.lock();
        state.sampler = sampler;
        state.cache = None;
    }

    pub fn sampler(&self) -> Option<Sampler> {
        self.state.lock().sampler.clone()
    }

    fn static_hash(sampler: &Sampler) -> u64 {
        let mut hasher = DefaultHasher::new();
        sampler.hash_static(&mut hasher);
        hasher.finish()
    }

    /// Render into a packed pixel buffer.
    ///
    /// A graph that fails to link or JIT despite being valid is a
    /// programmer error: it is logged and the buffer is left untouched.
    pub fn render_into_buffer(
        &self,
        extent: Extent,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        stride: u32,
        format: BufferFormat,
    ) -> Result<(), RenderError> {
        if !format.is_renderable() {
            return Err(RenderError::UnsupportedFormat(format));
        }
        let bpp = format.bytes_per_pixel().expect("renderable format is packed");
        if stride < width * bpp {
            return Err(RenderError::BadStride { stride, width });
        }
        let need = stride as usize * height as usize;
        if buffer.len() < need {
            return Err(RenderError::BufferTooSmall { need, got: buffer.len() });
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        let sampler = self.state.lock().sampler.clone().ok_or(RenderError::NoSampler)?;
        if let Sampler::Kernel(kernel) = &sampler {
            if kernel.target() == Some(firtree_ir::KernelTarget::Reduce) {
                return Err(RenderError::NotRender);
            }
        }
        // Serialise against reconfiguration for the whole render: the
        // cached pointer must not be invalidated under running strips.
        let _render_guard = match &sampler {
            Sampler::Kernel(k) => Some(k.lock_render()),
            Sampler::Buffer(_) => None,
        };
        if !sampler.is_valid() {
            return Err(RenderError::InvalidSampler);
        }

        let Some(compiled) = self.compiled_for(&sampler, format) else {
            // Treat a missing function pointer as "nothing to do".
            return Ok(());
        };

        let func = compiled.func;
        let base = buffer.as_mut_ptr() as usize;
        strip_partition(extent, height).into_par_iter().for_each(|strip| {
            let ptr = (base + strip.start_row as usize * stride as usize) as *mut u8;
            unsafe { func(ptr, width, strip.n_rows, stride, strip.extent.as_ptr()) };
        });
        Ok(())
    }

    /// Fetch or rebuild the cached render function, then refresh the
    /// dynamic parameter buffer. Returns `None` when linking or code
    /// generation fails.
    fn compiled_for(&self, sampler: &Sampler, format: BufferFormat) -> Option<Arc<CompiledRender>> {
        let version = sampler.module_version();
        let static_hash = Self::static_hash(sampler);

        let mut state = self.state.lock();
        let stale = match &state.cache {
            Some(cache) => {
                cache.format != format || cache.version != version || cache.static_hash != static_hash
            }
            None => true,
        };
        if stale {
            state.cache = None;
            let linked = match link_sampler(sampler) {
                Ok(linked) => linked,
                Err(err) => {
                    error!(%err, "linking failed for a valid sampler graph");
                    return None;
                }
            };
            let compiled = match self.jit.compile_render(&linked, format) {
                Ok(compiled) => Arc::new(compiled),
                Err(err) => {
                    error!(%err, "JIT compilation failed; no render function produced");
                    return None;
                }
            };
            debug!(?format, version, "render function (re)compiled");
            state.cache = Some(RenderCache {
                format,
                version,
                static_hash,
                compiled,
                slots: linked.param_slots,
            });
        }

        let cache = state.cache.as_ref().unwrap();
        // Push current dynamic argument values into the parameter buffer.
        // The render lock is held, so no strips are reading it.
        for slot in &cache.slots {
            if let Some(lanes) = slot.provider.argument(&slot.name).and_then(|v| v.to_lanes()) {
                unsafe { cache.compiled.params.write(slot.offset, &lanes) };
            }
        }
        Some(cache.compiled.clone())
    }
}

impl Default for CpuRenderer {
    fn default() -> CpuRenderer {
        CpuRenderer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Strips tile the extent exactly: disjoint in y, unioning to the
    // original, with every strip 8 rows except possibly the last.
    #[test]
    fn strip_partition_is_exact() {
        for (rows, extent) in [(1u32, [0.0, 0.0, 4.0, 4.0]), (8, [1.0, 2.0, 3.0, 4.0]), (21, [-2.0, -8.0, 16.0, 12.0])] {
            let strips = strip_partition(extent, rows);
            assert_eq!(strips.len(), rows.div_ceil(8) as usize);
            assert_eq!(strips.iter().map(|s| s.n_rows).sum::<u32>(), rows);
            let dy = extent[3] / rows as f32;
            let mut y = extent[1];
            for strip in &strips {
                assert_eq!(strip.extent[0], extent[0]);
                assert_eq!(strip.extent[2], extent[2]);
                assert!((strip.extent[1] - y).abs() < 1e-4, "strips must abut");
                assert!((strip.extent[3] - dy * strip.n_rows as f32).abs() < 1e-4);
                y += strip.extent[3];
            }
            assert!((y - (extent[1] + extent[3])).abs() < 1e-3, "strips must union to the extent");
        }
    }

    #[test]
    fn renders_reject_bad_geometry() {
        let renderer = CpuRenderer::new();
        let mut buf = [0u8; 64];
        assert!(matches!(
            renderer.render_into_buffer([0.0, 0.0, 4.0, 4.0], &mut buf, 4, 4, 8, BufferFormat::Argb32),
            Err(RenderError::BadStride { .. })
        ));
        assert!(matches!(
            renderer.render_into_buffer([0.0, 0.0, 4.0, 4.0], &mut buf, 4, 4, 16, BufferFormat::L8),
            Err(RenderError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            renderer.render_into_buffer([0.0, 0.0, 4.0, 4.0], &mut buf, 4, 4, 16, BufferFormat::Argb32),
            Err(RenderError::NoSampler)
        ));
    }
}
