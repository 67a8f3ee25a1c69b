//! Linker-level properties over whole sampler graphs.

use firtree::ir;
use firtree::{link_sampler, BufferFormat, BufferSampler, KernelSampler, PixelBuffer, Sampler};
use glam::Vec4;

fn provider(source: &str) -> KernelSampler {
    let kernel = KernelSampler::new();
    assert!(kernel.compile_from_source(source, None));
    kernel
}

/// Replace `_<32 hex digits>` name suffixes so dumps from two links can be
/// compared structurally.
fn normalize_uuids(dump: &str) -> String {
    let bytes = dump.as_bytes();
    let mut out = String::with_capacity(dump.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '_' {
            let rest = &bytes[i + 1..];
            let hex_len = rest
                .iter()
                .take_while(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
                .count();
            if hex_len >= 32 {
                out.push_str("_UUID");
                i += 1 + hex_len;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

// Linking the same configuration twice yields identical optimised IR,
// modulo the unique name suffixes.
#[test]
fn linking_is_idempotent_on_configuration() {
    let tint = provider("kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }");
    let fill = provider("kernel vec4 fill(static vec4 c) { return premultiply(c); }");
    fill.set_value("c", Vec4::new(0.5, 0.5, 0.5, 0.5)).unwrap();
    tint.set_sampler("s", Sampler::Kernel(fill)).unwrap();
    tint.set_value("c", Vec4::ONE).unwrap();
    let root = Sampler::Kernel(tint);

    let mut first = link_sampler(&root).unwrap();
    let mut second = link_sampler(&root).unwrap();
    assert_eq!(first.static_hash, second.static_hash);

    ir::optimize_module(&mut first.module);
    ir::optimize_module(&mut second.module);
    assert_eq!(
        normalize_uuids(&first.module.to_string()),
        normalize_uuids(&second.module.to_string())
    );
}

// samplerExtent folds to a constant holding the child's extent.
#[test]
fn sampler_extent_folds_to_a_constant() {
    let kernel = provider("kernel vec4 f(sampler s) { return samplerExtent(s); }");
    let data = vec![0u8; 6 * 4 * 4];
    let child = BufferSampler::new(PixelBuffer::new(data, 6, 4, 24, BufferFormat::Argb32).unwrap());
    kernel.set_sampler("s", child).unwrap();

    let mut linked = link_sampler(&Sampler::Kernel(kernel)).unwrap();
    ir::optimize_module(&mut linked.module);
    let root = linked.module.function(&linked.root).unwrap();
    assert!(root.inst_ids().any(|id| matches!(
        root.inst(id).op,
        ir::Op::Const(ir::ConstValue::Vec4(e)) if e == [0.0, 0.0, 6.0, 4.0]
    )));
}

// After optimisation, a static multiplier leaves no parameter-buffer
// access behind: the only load_param belongs to the dynamic argument.
#[test]
fn static_multiplier_leaves_no_parameter_loads() {
    let kernel = provider("kernel vec4 f(static float k, vec4 c) { return c * k; }");
    kernel.set_value("k", 3.0f32).unwrap();
    kernel.set_value("c", Vec4::ONE).unwrap();

    let mut linked = link_sampler(&Sampler::Kernel(kernel)).unwrap();
    ir::optimize_module(&mut linked.module);
    assert_eq!(linked.param_slots.len(), 1);
    assert_eq!(linked.param_slots[0].name, "c");
    for func in &linked.module.functions {
        for id in func.inst_ids() {
            if let ir::Op::LoadParam { slot } = func.inst(id).op {
                assert_eq!(slot, 0, "only the dynamic argument may read the parameter buffer");
            }
        }
    }
}

// Re-linking after a static change produces a different static hash (the
// JIT cache key must rotate), while dynamic changes keep it.
#[test]
fn static_hash_tracks_static_configuration() {
    let kernel = provider("kernel vec4 f(static float k, vec4 c) { return c * k; }");
    kernel.set_value("k", 1.0f32).unwrap();
    kernel.set_value("c", Vec4::ONE).unwrap();
    let root = Sampler::Kernel(kernel.clone());

    let a = link_sampler(&root).unwrap().static_hash;
    kernel.set_value("c", Vec4::ZERO).unwrap();
    let b = link_sampler(&root).unwrap().static_hash;
    assert_eq!(a, b, "dynamic arguments are not part of the static hash");

    kernel.set_value("k", 2.0f32).unwrap();
    let c = link_sampler(&root).unwrap().static_hash;
    assert_ne!(a, c, "static arguments participate in the static hash");
}
