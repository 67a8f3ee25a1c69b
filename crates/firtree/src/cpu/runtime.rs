//! Host-side runtime for JIT-compiled kernels.
//!
//! Generated code resolves a handful of external symbols at link time: the
//! transcendental math functions Cranelift has no instruction for, buffer
//! sampling, and the reduce `emit` sink. The symbols are registered on the
//! `JITBuilder` before any module is created, mirroring a lazy function
//! creator.

use crate::lockfree::LockFreeSet;
use crate::sampler::PixelBuffer;
use cranelift_jit::JITBuilder;
use std::cell::UnsafeCell;
use tracing::error;

extern "C" fn ft_sinf(x: f32) -> f32 {
    x.sin()
}

extern "C" fn ft_cosf(x: f32) -> f32 {
    x.cos()
}

extern "C" fn ft_tanf(x: f32) -> f32 {
    x.tan()
}

extern "C" fn ft_asinf(x: f32) -> f32 {
    x.asin()
}

extern "C" fn ft_acosf(x: f32) -> f32 {
    x.acos()
}

extern "C" fn ft_atanf(x: f32) -> f32 {
    x.atan()
}

extern "C" fn ft_atan2f(y: f32, x: f32) -> f32 {
    y.atan2(x)
}

extern "C" fn ft_powf(x: f32, y: f32) -> f32 {
    x.powf(y)
}

extern "C" fn ft_expf(x: f32) -> f32 {
    x.exp()
}

extern "C" fn ft_logf(x: f32) -> f32 {
    x.ln()
}

extern "C" fn ft_exp2f(x: f32) -> f32 {
    x.exp2()
}

extern "C" fn ft_log2f(x: f32) -> f32 {
    x.log2()
}

/// Nearest-pixel buffer sampling. `buffer` is a `PixelBuffer` whose owning
/// `Arc` is pinned by the compiled artifact.
unsafe extern "C" fn ft_sample_buffer(buffer: *const PixelBuffer, x: f32, y: f32, out: *mut f32) {
    let rgba = (*buffer).read_pixel(x.floor() as i64, y.floor() as i64);
    std::ptr::copy_nonoverlapping(rgba.as_ptr(), out, 4);
}

/// Reduce `emit`: append `lanes` f32s to the lock-free sink.
unsafe extern "C" fn ft_emit(sink: *mut LockFreeSet, data: *const f32, lanes: u32) {
    let set = &*sink;
    if set.element_size() != lanes as usize * 4 {
        error!(
            expected = set.element_size(),
            got = lanes * 4,
            "emit element size does not match the sink; element dropped"
        );
        return;
    }
    set.insert_raw(data as *const u8);
}

/// Unary f32 shims, by symbol name.
pub(crate) const UNARY_SHIMS: &[(&str, extern "C" fn(f32) -> f32)] = &[
    ("ft_sinf", ft_sinf),
    ("ft_cosf", ft_cosf),
    ("ft_tanf", ft_tanf),
    ("ft_asinf", ft_asinf),
    ("ft_acosf", ft_acosf),
    ("ft_atanf", ft_atanf),
    ("ft_expf", ft_expf),
    ("ft_logf", ft_logf),
    ("ft_exp2f", ft_exp2f),
    ("ft_log2f", ft_log2f),
];

/// Binary f32 shims, by symbol name.
pub(crate) const BINARY_SHIMS: &[(&str, extern "C" fn(f32, f32) -> f32)] =
    &[("ft_atan2f", ft_atan2f), ("ft_powf", ft_powf)];

pub(crate) const SAMPLE_BUFFER_SYMBOL: &str = "ft_sample_buffer";
pub(crate) const EMIT_SYMBOL: &str = "ft_emit";

/// Register every runtime symbol on a fresh `JITBuilder`.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for (name, f) in UNARY_SHIMS {
        builder.symbol(*name, *f as *const u8);
    }
    for (name, f) in BINARY_SHIMS {
        builder.symbol(*name, *f as *const u8);
    }
    builder.symbol(
        SAMPLE_BUFFER_SYMBOL,
        ft_sample_buffer as unsafe extern "C" fn(*const PixelBuffer, f32, f32, *mut f32) as *const u8,
    );
    builder.symbol(
        EMIT_SYMBOL,
        ft_emit as unsafe extern "C" fn(*mut LockFreeSet, *const f32, u32) as *const u8,
    );
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Storage for dynamic kernel parameters.
///
/// The buffer's address is baked into generated code as a constant, so the
/// render entry points keep their five-argument C ABI while dynamic
/// arguments stay changeable without a re-link. Writes happen only while
/// the owning provider's render lock is held and no render is in flight.
pub(crate) struct ParamBuffer {
    cells: UnsafeCell<Box<[f32]>>,
}

unsafe impl Send for ParamBuffer {}
unsafe impl Sync for ParamBuffer {}

impl ParamBuffer {
    pub fn new(lanes: u32) -> ParamBuffer {
        ParamBuffer {
            cells: UnsafeCell::new(vec![0.0; lanes as usize].into_boxed_slice()),
        }
    }

    pub fn base_ptr(&self) -> *const f32 {
        unsafe { (*self.cells.get()).as_ptr() }
    }

    /// # Safety
    /// The caller must hold the provider's render lock, serialising this
    /// against readers of the buffer.
    pub unsafe fn write(&self, offset: u32, lanes: &[f32]) {
        let cells = &mut *self.cells.get();
        cells[offset as usize..offset as usize + lanes.len()].copy_from_slice(lanes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_shim_appends_matching_elements() {
        let set = LockFreeSet::new(8);
        let data = [1.0f32, 2.0];
        unsafe { ft_emit(&set as *const _ as *mut LockFreeSet, data.as_ptr(), 2) };
        assert_eq!(set.len(), 1);
        // Mismatched element size is dropped, not UB.
        unsafe { ft_emit(&set as *const _ as *mut LockFreeSet, data.as_ptr(), 1) };
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sample_shim_converts_pixels() {
        let word: u32 = 0x80 << 24 | 0x40 << 16 | 0x20 << 8 | 0xff; // RGBA32
        let buf = PixelBuffer::new(word.to_ne_bytes().to_vec(), 1, 1, 4, crate::BufferFormat::Rgba32).unwrap();
        let mut out = [0.0f32; 4];
        unsafe { ft_sample_buffer(&buf, 0.5, 0.5, out.as_mut_ptr()) };
        assert!((out[0] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(out[3], 1.0);
        // Outside the buffer: transparent black.
        unsafe { ft_sample_buffer(&buf, -1.0, 0.0, out.as_mut_ptr()) };
        assert_eq!(out, [0.0; 4]);
    }
}
