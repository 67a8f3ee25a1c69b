//! Samplers: sources of colour samples.
//!
//! A sampler is either an image buffer or a kernel with bound arguments
//! (see [`KernelSampler`](crate::KernelSampler)). Each carries an affine
//! transform that is composed into its parent's `sample` calls at link
//! time, an extent, and the change-notification signals.

use crate::affine::AffineTransform;
use crate::format::BufferFormat;
use crate::kernel::KernelSampler;
use crate::signal::SamplerSignals;
use parking_lot::Mutex;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Axis-aligned rectangle `(x, y, width, height)`.
pub type Extent = [f32; 4];

/// The extent of a sampler defined everywhere.
pub const INFINITE_EXTENT: Extent = [-f32::MAX * 0.5, -f32::MAX * 0.5, f32::MAX, f32::MAX];

pub fn extent_is_infinite(e: Extent) -> bool {
    e[2] >= f32::MAX * 0.5 || e[3] >= f32::MAX * 0.5
}

/// Union of two extents. An empty extent (zero area) is the identity.
pub fn extent_union(a: Extent, b: Extent) -> Extent {
    if a[2] <= 0.0 || a[3] <= 0.0 {
        return b;
    }
    if b[2] <= 0.0 || b[3] <= 0.0 {
        return a;
    }
    let x0 = a[0].min(b[0]);
    let y0 = a[1].min(b[1]);
    let x1 = (a[0] + a[2]).max(b[0] + b[2]);
    let y1 = (a[1] + a[3]).max(b[1] + b[3]);
    [x0, y0, x1 - x0, y1 - y0]
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owned pixel buffer with its memory layout.
#[derive(Debug)]
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    format: BufferFormat,
}

impl PixelBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, stride: u32, format: BufferFormat) -> Option<PixelBuffer> {
        let needed = match format {
            BufferFormat::I420Fourcc | BufferFormat::Yv12Fourcc => {
                // Y plane at full stride plus two half-resolution planes.
                stride as usize * height as usize
                    + 2 * ((stride as usize / 2) * (height as usize).div_ceil(2))
            }
            _ => {
                let bpp = format.bytes_per_pixel()?;
                if stride < width * bpp {
                    return None;
                }
                stride as usize * height as usize
            }
        };
        if data.len() < needed {
            return None;
        }
        Some(PixelBuffer { data, width, height, stride, format })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Nearest-pixel read, as non-premultiplied RGBA in [0, 1]. Outside the
    /// buffer the sampler is transparent black.
    pub(crate) fn read_pixel(&self, px: i64, py: i64) -> [f32; 4] {
        if px < 0 || py < 0 || px >= self.width as i64 || py >= self.height as i64 {
            return [0.0; 4];
        }
        let (x, y) = (px as usize, py as usize);
        let stride = self.stride as usize;
        let norm = |v: u8| v as f32 / 255.0;
        let rgba = match self.format {
            BufferFormat::RgbaF32Premultiplied => {
                let offset = y * stride + x * 16;
                let mut out = [0.0f32; 4];
                for (i, lane) in out.iter_mut().enumerate() {
                    let bytes: [u8; 4] = self.data[offset + i * 4..offset + i * 4 + 4].try_into().unwrap();
                    *lane = f32::from_ne_bytes(bytes);
                }
                out
            }
            BufferFormat::L8 => {
                let l = norm(self.data[y * stride + x]);
                [l, l, l, 1.0]
            }
            BufferFormat::I420Fourcc | BufferFormat::Yv12Fourcc => {
                return self.read_planar_yuv(x, y);
            }
            BufferFormat::Rgb24 | BufferFormat::Bgr24 => {
                let offset = y * stride + x * 3;
                let (b0, b1, b2) = (self.data[offset], self.data[offset + 1], self.data[offset + 2]);
                match self.format {
                    BufferFormat::Rgb24 => [norm(b0), norm(b1), norm(b2), 1.0],
                    _ => [norm(b2), norm(b1), norm(b0), 1.0],
                }
            }
            _ => {
                let offset = y * stride + x * 4;
                let word = u32::from_ne_bytes(self.data[offset..offset + 4].try_into().unwrap());
                let byte = |shift: u32| ((word >> shift) & 0xff) as f32 / 255.0;
                use crate::format::PackKind;
                match self.format.pack_spec() {
                    Some(spec) => match spec.kind {
                        PackKind::Word32 { r, g, b, a, has_alpha } => {
                            let alpha = if has_alpha { byte(a) } else { 1.0 };
                            [byte(r), byte(g), byte(b), alpha]
                        }
                        _ => [0.0; 4],
                    },
                    None => [0.0; 4],
                }
            }
        };
        if self.format.is_premultiplied() && rgba[3] > 0.0 {
            [rgba[0] / rgba[3], rgba[1] / rgba[3], rgba[2] / rgba[3], rgba[3]]
        } else {
            rgba
        }
    }

    /// BT.601 conversion for the planar 4:2:0 formats.
    fn read_planar_yuv(&self, x: usize, y: usize) -> [f32; 4] {
        let stride = self.stride as usize;
        let half_stride = stride / 2;
        let y_plane = stride * self.height as usize;
        let chroma_plane = half_stride * (self.height as usize).div_ceil(2);
        let luma = self.data[y * stride + x] as f32;
        let chroma_offset = (y / 2) * half_stride + x / 2;
        let (u, v) = match self.format {
            BufferFormat::I420Fourcc => (
                self.data[y_plane + chroma_offset] as f32,
                self.data[y_plane + chroma_plane + chroma_offset] as f32,
            ),
            _ => (
                self.data[y_plane + chroma_plane + chroma_offset] as f32,
                self.data[y_plane + chroma_offset] as f32,
            ),
        };
        let c = luma - 16.0;
        let d = u - 128.0;
        let e = v - 128.0;
        let clamp = |v: f32| (v / 255.0).clamp(0.0, 1.0);
        [
            clamp(1.164 * c + 1.596 * e),
            clamp(1.164 * c - 0.392 * d - 0.813 * e),
            clamp(1.164 * c + 2.017 * d),
            1.0,
        ]
    }
}

struct BufferSamplerState {
    buffer: Arc<PixelBuffer>,
    transform: AffineTransform,
}

struct BufferSamplerInner {
    signals: SamplerSignals,
    state: Mutex<BufferSamplerState>,
    version: AtomicU64,
}

/// A sampler backed by a pixel buffer. Cheap to clone; clones share the
/// underlying buffer.
#[derive(Clone)]
pub struct BufferSampler {
    inner: Arc<BufferSamplerInner>,
}

impl BufferSampler {
    pub fn new(buffer: PixelBuffer) -> BufferSampler {
        BufferSampler {
            inner: Arc::new(BufferSamplerInner {
                signals: SamplerSignals::default(),
                state: Mutex::new(BufferSamplerState {
                    buffer: Arc::new(buffer),
                    transform: AffineTransform::IDENTITY,
                }),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the underlying pixels. The sampled buffer address is baked
    /// into linked code, so this invalidates modules, not just contents.
    pub fn set_buffer(&self, buffer: PixelBuffer) {
        {
            let mut state = self.inner.state.lock();
            state.buffer = Arc::new(buffer);
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.signals.module_changed.emit();
        self.inner.signals.contents_changed.emit();
        self.inner.signals.extents_changed.emit();
    }

    pub fn buffer(&self) -> Arc<PixelBuffer> {
        self.inner.state.lock().buffer.clone()
    }

    pub fn extent(&self) -> Extent {
        let state = self.inner.state.lock();
        [0.0, 0.0, state.buffer.width as f32, state.buffer.height as f32]
    }

    pub fn transform(&self) -> AffineTransform {
        self.inner.state.lock().transform
    }

    /// The transform is composed into parents' `sample` calls at link
    /// time, so changing it dirties modules as well.
    pub fn set_transform(&self, transform: AffineTransform) {
        self.inner.state.lock().transform = transform;
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.signals.transform_changed.emit();
        self.inner.signals.module_changed.emit();
    }

    pub fn signals(&self) -> &SamplerSignals {
        &self.inner.signals
    }

    pub fn module_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Any sampler: a kernel with bound arguments or a pixel buffer.
#[derive(Clone)]
pub enum Sampler {
    Kernel(KernelSampler),
    Buffer(BufferSampler),
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sampler::Kernel(_) => f.write_str("Sampler::Kernel(..)"),
            Sampler::Buffer(_) => f.write_str("Sampler::Buffer(..)"),
        }
    }
}

impl Sampler {
    pub fn extent(&self) -> Extent {
        match self {
            Sampler::Kernel(k) => k.extent(),
            Sampler::Buffer(b) => b.extent(),
        }
    }

    pub fn transform(&self) -> AffineTransform {
        match self {
            Sampler::Kernel(k) => k.transform(),
            Sampler::Buffer(b) => b.transform(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Sampler::Kernel(k) => k.is_valid(),
            Sampler::Buffer(_) => true,
        }
    }

    pub fn signals(&self) -> &SamplerSignals {
        match self {
            Sampler::Kernel(k) => k.signals(),
            Sampler::Buffer(b) => b.signals(),
        }
    }

    /// Monotonic version, bumped whenever linked modules derived from this
    /// sampler become stale.
    pub fn module_version(&self) -> u64 {
        match self {
            Sampler::Kernel(k) => k.module_version(),
            Sampler::Buffer(b) => b.module_version(),
        }
    }

    /// Stable identity for cycle detection and cache keys.
    pub(crate) fn id(&self) -> usize {
        match self {
            Sampler::Kernel(k) => k.id(),
            Sampler::Buffer(b) => b.id(),
        }
    }

    /// Whether `id` is this sampler or one of its transitive children.
    pub(crate) fn contains(&self, id: usize) -> bool {
        if self.id() == id {
            return true;
        }
        match self {
            Sampler::Kernel(k) => k.any_child(|child| child.contains(id)),
            Sampler::Buffer(_) => false,
        }
    }

    /// Hash everything that participates in link-time specialisation:
    /// kernel identities, static argument values, transforms and source
    /// buffers.
    pub(crate) fn hash_static(&self, h: &mut impl Hasher) {
        for lane in self.transform().to_elements() {
            h.write_u32(lane.to_bits());
        }
        match self {
            Sampler::Kernel(k) => k.hash_static_parts(h),
            Sampler::Buffer(b) => {
                h.write_usize(b.id());
                h.write_u64(b.module_version());
            }
        }
    }
}

impl From<KernelSampler> for Sampler {
    fn from(k: KernelSampler) -> Sampler {
        Sampler::Kernel(k)
    }
}

impl From<BufferSampler> for Sampler {
    fn from(b: BufferSampler) -> Sampler {
        Sampler::Buffer(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_union_behaviour() {
        let a = [0.0, 0.0, 2.0, 2.0];
        let b = [1.0, 1.0, 4.0, 1.0];
        assert_eq!(extent_union(a, b), [0.0, 0.0, 5.0, 2.0]);
        assert_eq!(extent_union([0.0; 4], b), b);
    }

    #[test]
    fn buffer_sampler_reads_pixels() {
        // 2x1 RGBA32 (word = R<<24|G<<16|B<<8|A): red, then
        // half-transparent white.
        let red: u32 = 0xff << 24 | 0xff;
        let white: u32 = 0xff << 24 | 0xff << 16 | 0xff << 8 | 0x80;
        let mut data = Vec::new();
        data.extend_from_slice(&red.to_ne_bytes());
        data.extend_from_slice(&white.to_ne_bytes());
        let buf = PixelBuffer::new(data, 2, 1, 8, BufferFormat::Rgba32).unwrap();
        assert_eq!(buf.read_pixel(0, 0), [1.0, 0.0, 0.0, 1.0]);
        let px = buf.read_pixel(1, 0);
        assert_eq!(px[0], 1.0);
        assert!((px[3] - 128.0 / 255.0).abs() < 1e-6);
        // Outside the extent: transparent black.
        assert_eq!(buf.read_pixel(2, 0), [0.0; 4]);
        assert_eq!(buf.read_pixel(0, -1), [0.0; 4]);
    }

    #[test]
    fn buffer_sampler_extent_matches_dimensions() {
        let buf = PixelBuffer::new(vec![0; 16], 2, 2, 8, BufferFormat::Argb32).unwrap();
        let sampler = BufferSampler::new(buf);
        assert_eq!(sampler.extent(), [0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn set_transform_bumps_module_version() {
        let buf = PixelBuffer::new(vec![0; 16], 2, 2, 8, BufferFormat::Argb32).unwrap();
        let sampler = BufferSampler::new(buf);
        let v0 = sampler.module_version();
        sampler.set_transform(AffineTransform::scale(2.0, 2.0));
        assert!(sampler.module_version() > v0);
    }
}
