//! End-to-end render and reduce scenarios through the JIT.

use firtree::{
    BufferFormat, BufferSampler, CpuReduceEngine, CpuRenderer, KernelSampler, LockFreeSet,
    PixelBuffer, AffineTransform, Sampler,
};
use glam::Vec4;

fn provider(source: &str) -> KernelSampler {
    let kernel = KernelSampler::new();
    assert!(
        kernel.compile_from_source(source, None),
        "compile failed: {}",
        kernel
            .compiled_kernel()
            .map(|c| c.compile_log().to_string())
            .unwrap_or_default()
    );
    kernel
}

fn renderer_for(kernel: KernelSampler) -> CpuRenderer {
    let renderer = CpuRenderer::new();
    renderer.set_sampler(Some(Sampler::Kernel(kernel)));
    renderer
}

fn read_f32_pixel(buffer: &[u8], stride: usize, x: usize, y: usize) -> [f32; 4] {
    let offset = y * stride + x * 16;
    let mut out = [0.0f32; 4];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = f32::from_ne_bytes(buffer[offset + i * 4..offset + i * 4 + 4].try_into().unwrap());
    }
    out
}

fn assert_close(a: [f32; 4], b: [f32; 4]) {
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-4, "{:?} != {:?}", a, b);
    }
}

// Checker pattern: alternating colours along x.
#[test]
fn checker_pattern_renders_argb32_premultiplied() {
    let kernel = provider(
        "kernel vec4 checker(static float size, vec4 a, vec4 b) {\n\
         \tvec2 dc = mod(destCoord(), 2.0 * size);\n\
         \treturn mix(a, b, step(size, dc.x));\n\
         }\n",
    );
    kernel.set_value("size", 1.0f32).unwrap();
    kernel.set_value("a", Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
    kernel.set_value("b", Vec4::new(0.0, 1.0, 0.0, 1.0)).unwrap();

    let renderer = renderer_for(kernel);
    let mut pixels = vec![0u8; 16 * 4];
    renderer
        .render_into_buffer(
            [0.0, 0.0, 4.0, 4.0],
            &mut pixels,
            4,
            4,
            16,
            BufferFormat::Argb32Premultiplied,
        )
        .unwrap();

    let word = |x: usize, y: usize| {
        u32::from_ne_bytes(pixels[y * 16 + x * 4..y * 16 + x * 4 + 4].try_into().unwrap())
    };
    // Top-left is colour `a` (opaque red), top-right is `b` (opaque green).
    assert_eq!(word(0, 0), 0xffff0000);
    assert_eq!(word(3, 0), 0xff00ff00);
    // The pattern alternates every `size` pixels along x.
    assert_eq!(word(1, 0), 0xff00ff00);
    assert_eq!(word(2, 0), 0xffff0000);
    // And is constant along y.
    assert_eq!(word(0, 3), 0xffff0000);
}

// A bound buffer sampler modulated by a dynamic colour.
#[test]
fn tint_samples_bound_buffer() {
    let kernel = provider("kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }");
    // 2x2 RGBA32 buffer of opaque white.
    let data = vec![0xffu8; 2 * 2 * 4];
    let buffer = BufferSampler::new(PixelBuffer::new(data, 2, 2, 8, BufferFormat::Rgba32).unwrap());
    kernel.set_sampler("s", buffer).unwrap();
    kernel.set_value("c", Vec4::new(0.5, 0.5, 0.5, 1.0)).unwrap();

    let renderer = renderer_for(kernel);
    let mut pixels = vec![0u8; 2 * 32];
    renderer
        .render_into_buffer(
            [0.0, 0.0, 2.0, 2.0],
            &mut pixels,
            2,
            2,
            32,
            BufferFormat::RgbaF32Premultiplied,
        )
        .unwrap();

    for y in 0..2 {
        for x in 0..2 {
            assert_close(read_f32_pixel(&pixels, 32, x, y), [0.5, 0.5, 0.5, 1.0]);
        }
    }
}

// The child's affine transform is composed into the sample call: with a
// 2x scale, a destination coordinate of (3.5, 5.5) reads the child at
// (7, 11).
#[test]
fn sampler_transform_composes_into_sample() {
    // 16x16 f32 buffer where pixel (x, y) stores (x/16, y/16, 0, 1).
    let (w, h) = (16u32, 16u32);
    let mut data = Vec::with_capacity((w * h * 16) as usize);
    for y in 0..h {
        for x in 0..w {
            for lane in [x as f32 / 16.0, y as f32 / 16.0, 0.0, 1.0] {
                data.extend_from_slice(&lane.to_ne_bytes());
            }
        }
    }
    let child = BufferSampler::new(
        PixelBuffer::new(data, w, h, w * 16, BufferFormat::RgbaF32Premultiplied).unwrap(),
    );
    child.set_transform(AffineTransform::from_elements([2.0, 0.0, 0.0, 2.0, 0.0, 0.0]));

    let kernel = provider("kernel vec4 f(sampler s) { return sample(s, destCoord()); }");
    kernel.set_sampler("s", child).unwrap();

    let renderer = renderer_for(kernel);
    let mut pixels = vec![0u8; 16];
    renderer
        .render_into_buffer(
            [3.0, 5.0, 1.0, 1.0],
            &mut pixels,
            1,
            1,
            16,
            BufferFormat::RgbaF32Premultiplied,
        )
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [7.0 / 16.0, 11.0 / 16.0, 0.0, 1.0]);
}

// Dynamic arguments change without re-linking; the next render sees the
// new value.
#[test]
fn dynamic_arguments_update_between_renders() {
    let kernel = provider("kernel vec4 fill(vec4 c) { return c; }");
    kernel.set_value("c", Vec4::new(0.25, 0.0, 0.0, 1.0)).unwrap();
    let version_before = kernel.module_version();

    let renderer = renderer_for(kernel.clone());
    let mut pixels = vec![0u8; 16];
    let extent = [0.0, 0.0, 1.0, 1.0];
    renderer
        .render_into_buffer(extent, &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [0.25, 0.0, 0.0, 1.0]);

    kernel.set_value("c", Vec4::new(0.0, 0.75, 0.0, 1.0)).unwrap();
    // A dynamic rebind does not dirty the module.
    assert_eq!(kernel.module_version(), version_before);
    renderer
        .render_into_buffer(extent, &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [0.0, 0.75, 0.0, 1.0]);
}

// Static arguments force a re-link; the new constant is baked in.
#[test]
fn static_argument_changes_take_effect() {
    let kernel = provider("kernel vec4 f(static float k) { return vec4(k, 0.0, 0.0, 1.0); }");
    kernel.set_value("k", 0.25f32).unwrap();
    let renderer = renderer_for(kernel.clone());
    let mut pixels = vec![0u8; 16];
    let extent = [0.0, 0.0, 1.0, 1.0];
    renderer
        .render_into_buffer(extent, &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [0.25, 0.0, 0.0, 1.0]);

    let version_before = kernel.module_version();
    kernel.set_value("k", 0.5f32).unwrap();
    assert!(kernel.module_version() > version_before);
    renderer
        .render_into_buffer(extent, &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [0.5, 0.0, 0.0, 1.0]);
}

// Control flow, helper calls and builtins all survive the JIT.
#[test]
fn loops_and_helpers_execute() {
    let kernel = provider(
        "float gain(float x) { return x * 0.25; }\n\
         kernel vec4 f() {\n\
         \tfloat acc = 0.0;\n\
         \tfor (int i = 0; i < 4; ++i) { acc += gain(1.0); }\n\
         \tfloat b = (acc >= 1.0) ? 0.5 : 0.0;\n\
         \treturn vec4(acc, sqrt(4.0) / 4.0, b, 1.0);\n\
         }\n",
    );
    let renderer = renderer_for(kernel);
    let mut pixels = vec![0u8; 16];
    renderer
        .render_into_buffer([0.0, 0.0, 1.0, 1.0], &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [1.0, 0.5, 0.5, 1.0]);
}

// Reduce accumulation: one emitted element per pixel of a 10x10 grid, all
// distinct and covering the grid. Order is unspecified.
#[test]
fn reduce_emits_one_element_per_pixel() {
    let kernel = provider("kernel void grid() { emit(destCoord()); }");
    let engine = CpuReduceEngine::new();
    engine.set_kernel(Some(kernel)).unwrap();

    let set = LockFreeSet::for_element::<[f32; 2]>();
    engine.run(&set, [0.0, 0.0, 10.0, 10.0], 10, 10).unwrap();

    assert_eq!(set.len(), 100);
    let mut seen: Vec<(u32, u32)> = set
        .iter_as::<[f32; 2]>()
        .map(|p| ((p[0] - 0.5) as u32, (p[1] - 0.5) as u32))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 100, "all emitted coordinates must be distinct");
    assert_eq!(seen.first(), Some(&(0, 0)));
    assert_eq!(seen.last(), Some(&(9, 9)));
}

// A graph with an unbound sampler parameter must not render.
#[test]
fn invalid_graph_is_rejected_at_render_time() {
    let kernel = provider("kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }");
    kernel.set_value("c", Vec4::ONE).unwrap();
    let renderer = renderer_for(kernel);
    let mut pixels = vec![0u8; 16];
    assert!(matches!(
        renderer.render_into_buffer([0.0, 0.0, 1.0, 1.0], &mut pixels, 1, 1, 16, BufferFormat::Argb32),
        Err(firtree::RenderError::InvalidSampler)
    ));
    // The buffer is untouched.
    assert!(pixels.iter().all(|b| *b == 0));
}

// Kernel samplers nest: a kernel sampling another kernel.
#[test]
fn kernel_graphs_nest() {
    let fill = provider("kernel vec4 fill(static vec4 c) { return c; }");
    fill.set_value("c", Vec4::new(0.5, 0.25, 0.0, 1.0)).unwrap();
    let double = provider("kernel vec4 double(sampler s) { return sample(s, destCoord()) * 2.0; }");
    double.set_sampler("s", Sampler::Kernel(fill)).unwrap();

    let renderer = renderer_for(double);
    let mut pixels = vec![0u8; 16];
    renderer
        .render_into_buffer([0.0, 0.0, 1.0, 1.0], &mut pixels, 1, 1, 16, BufferFormat::RgbaF32Premultiplied)
        .unwrap();
    assert_close(read_f32_pixel(&pixels, 16, 0, 0), [1.0, 0.5, 0.0, 1.0]);
}
