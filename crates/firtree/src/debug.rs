//! Textual IR dumps for debugging.
//!
//! These stringify whole modules and are not meant for production paths.

use crate::kernel::KernelSampler;
use crate::linker::link_sampler;
use crate::sampler::Sampler;

/// Dump the front-end IR module of a kernel sampler's compiled kernel.
pub fn dump_kernel_module(kernel: &KernelSampler) -> Option<String> {
    let compiled = kernel.compiled_kernel()?;
    if !compiled.compile_status() {
        return None;
    }
    Some(compiled.module().to_string())
}

/// Link the sampler graph and dump the resulting module.
pub fn dump_linked_module(sampler: &Sampler) -> Option<String> {
    let linked = link_sampler(sampler).ok()?;
    Some(format!("; root: {}\n{}", linked.root, linked.module))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_mention_the_kernel() {
        let kernel = KernelSampler::new();
        assert!(dump_kernel_module(&kernel).is_none());
        assert!(kernel.compile_from_source("kernel vec4 f() { return vec4(1.0); }", None));
        let dump = dump_kernel_module(&kernel).unwrap();
        assert!(dump.contains("fn @f("));

        let linked = dump_linked_module(&Sampler::Kernel(kernel)).unwrap();
        assert!(linked.contains("; root: sampler_"));
    }
}
