//! Pixel buffer formats.

/// Memory formats a pixel buffer can be in.
///
/// The 32-bit names spell the packed native-endian word from most to least
/// significant byte (`Argb32` pixels are `0xAARRGGBB` words). `_PREMULTIPLIED`
/// variants carry alpha premultiplied into the colour channels; `X` channels
/// are ignored on read and written as `0xFF`.
///
/// The declaration order is stable: it is the index into the render
/// dispatch table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferFormat {
    Argb32,
    Argb32Premultiplied,
    Xrgb32,
    Rgba32,
    Rgba32Premultiplied,
    Abgr32,
    Abgr32Premultiplied,
    Xbgr32,
    Bgra32,
    Bgra32Premultiplied,
    Rgb24,
    Bgr24,
    Rgbx32,
    Bgrx32,
    /// 8-bit luminance. Sample-source only.
    L8,
    /// Planar YUV 4:2:0 (Y, U, V planes). Sample-source only.
    I420Fourcc,
    /// Planar YUV 4:2:0 (Y, V, U planes). Sample-source only.
    Yv12Fourcc,
    /// Four f32 channels in R, G, B, A order, premultiplied.
    RgbaF32Premultiplied,
}

/// How a renderable format packs one pixel.
#[derive(Copy, Clone, Debug)]
pub(crate) enum PackKind {
    /// Native-endian 32-bit word; per-channel left shifts for r, g, b and
    /// (when present) a. Without alpha, `0xFF` is written at the alpha
    /// shift.
    Word32 { r: u32, g: u32, b: u32, a: u32, has_alpha: bool },
    /// Three bytes in memory order; per-channel byte offsets for r, g, b.
    Bytes3 { r: u32, g: u32, b: u32 },
    /// Four f32 channels in R, G, B, A memory order.
    F32x4,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct PackSpec {
    pub bytes_per_pixel: u32,
    pub premultiplied: bool,
    pub kind: PackKind,
}

impl BufferFormat {
    /// Every format, in dispatch-table order.
    pub const ALL: [BufferFormat; 18] = [
        BufferFormat::Argb32,
        BufferFormat::Argb32Premultiplied,
        BufferFormat::Xrgb32,
        BufferFormat::Rgba32,
        BufferFormat::Rgba32Premultiplied,
        BufferFormat::Abgr32,
        BufferFormat::Abgr32Premultiplied,
        BufferFormat::Xbgr32,
        BufferFormat::Bgra32,
        BufferFormat::Bgra32Premultiplied,
        BufferFormat::Rgb24,
        BufferFormat::Bgr24,
        BufferFormat::Rgbx32,
        BufferFormat::Bgrx32,
        BufferFormat::L8,
        BufferFormat::I420Fourcc,
        BufferFormat::Yv12Fourcc,
        BufferFormat::RgbaF32Premultiplied,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BufferFormat::Argb32 => "ARGB32",
            BufferFormat::Argb32Premultiplied => "ARGB32_PREMULTIPLIED",
            BufferFormat::Xrgb32 => "XRGB32",
            BufferFormat::Rgba32 => "RGBA32",
            BufferFormat::Rgba32Premultiplied => "RGBA32_PREMULTIPLIED",
            BufferFormat::Abgr32 => "ABGR32",
            BufferFormat::Abgr32Premultiplied => "ABGR32_PREMULTIPLIED",
            BufferFormat::Xbgr32 => "XBGR32",
            BufferFormat::Bgra32 => "BGRA32",
            BufferFormat::Bgra32Premultiplied => "BGRA32_PREMULTIPLIED",
            BufferFormat::Rgb24 => "RGB24",
            BufferFormat::Bgr24 => "BGR24",
            BufferFormat::Rgbx32 => "RGBX32",
            BufferFormat::Bgrx32 => "BGRX32",
            BufferFormat::L8 => "L8",
            BufferFormat::I420Fourcc => "I420_FOURCC",
            BufferFormat::Yv12Fourcc => "YV12_FOURCC",
            BufferFormat::RgbaF32Premultiplied => "RGBA_F32_PREMULTIPLIED",
        }
    }

    /// Exported symbol name of the render entry point for this format, or
    /// `None` for sample-source-only formats.
    pub fn render_function_name(self) -> Option<String> {
        self.is_renderable()
            .then(|| format!("render_FIRTREE_FORMAT_{}", self.name()))
    }

    pub fn is_renderable(self) -> bool {
        !matches!(
            self,
            BufferFormat::L8 | BufferFormat::I420Fourcc | BufferFormat::Yv12Fourcc
        )
    }

    /// Whether the colour channels carry premultiplied alpha.
    pub fn is_premultiplied(self) -> bool {
        matches!(
            self,
            BufferFormat::Argb32Premultiplied
                | BufferFormat::Rgba32Premultiplied
                | BufferFormat::Abgr32Premultiplied
                | BufferFormat::Bgra32Premultiplied
                | BufferFormat::RgbaF32Premultiplied
        )
    }

    /// Bytes per pixel for packed formats; `None` for planar ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        Some(match self {
            BufferFormat::Rgb24 | BufferFormat::Bgr24 => 3,
            BufferFormat::L8 => 1,
            BufferFormat::RgbaF32Premultiplied => 16,
            BufferFormat::I420Fourcc | BufferFormat::Yv12Fourcc => return None,
            _ => 4,
        })
    }

    pub(crate) fn pack_spec(self) -> Option<PackSpec> {
        let premultiplied = self.is_premultiplied();
        let kind = match self {
            BufferFormat::Argb32 | BufferFormat::Argb32Premultiplied => {
                PackKind::Word32 { r: 16, g: 8, b: 0, a: 24, has_alpha: true }
            }
            BufferFormat::Xrgb32 => PackKind::Word32 { r: 16, g: 8, b: 0, a: 24, has_alpha: false },
            BufferFormat::Rgba32 | BufferFormat::Rgba32Premultiplied => {
                PackKind::Word32 { r: 24, g: 16, b: 8, a: 0, has_alpha: true }
            }
            BufferFormat::Abgr32 | BufferFormat::Abgr32Premultiplied => {
                PackKind::Word32 { r: 0, g: 8, b: 16, a: 24, has_alpha: true }
            }
            BufferFormat::Xbgr32 => PackKind::Word32 { r: 0, g: 8, b: 16, a: 24, has_alpha: false },
            BufferFormat::Bgra32 | BufferFormat::Bgra32Premultiplied => {
                PackKind::Word32 { r: 8, g: 16, b: 24, a: 0, has_alpha: true }
            }
            BufferFormat::Rgbx32 => PackKind::Word32 { r: 24, g: 16, b: 8, a: 0, has_alpha: false },
            BufferFormat::Bgrx32 => PackKind::Word32 { r: 8, g: 16, b: 24, a: 0, has_alpha: false },
            BufferFormat::Rgb24 => PackKind::Bytes3 { r: 0, g: 1, b: 2 },
            BufferFormat::Bgr24 => PackKind::Bytes3 { r: 2, g: 1, b: 0 },
            BufferFormat::RgbaF32Premultiplied => PackKind::F32x4,
            BufferFormat::L8 | BufferFormat::I420Fourcc | BufferFormat::Yv12Fourcc => return None,
        };
        Some(PackSpec {
            bytes_per_pixel: self.bytes_per_pixel().unwrap(),
            premultiplied,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_order_is_stable() {
        assert_eq!(BufferFormat::ALL[0], BufferFormat::Argb32);
        assert_eq!(BufferFormat::ALL[10], BufferFormat::Rgb24);
        assert_eq!(BufferFormat::ALL[17], BufferFormat::RgbaF32Premultiplied);
        for (i, f) in BufferFormat::ALL.iter().enumerate() {
            assert_eq!(*f as u32, i as u32);
        }
    }

    #[test]
    fn render_targets_exclude_sample_only_formats() {
        assert!(!BufferFormat::L8.is_renderable());
        assert!(!BufferFormat::I420Fourcc.is_renderable());
        assert!(!BufferFormat::Yv12Fourcc.is_renderable());
        assert_eq!(
            BufferFormat::Argb32Premultiplied.render_function_name().unwrap(),
            "render_FIRTREE_FORMAT_ARGB32_PREMULTIPLIED"
        );
        assert_eq!(BufferFormat::L8.render_function_name(), None);
    }
}
