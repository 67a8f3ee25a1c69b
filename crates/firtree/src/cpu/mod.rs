//! CPU execution engine: Cranelift JIT, tiled renderer and reduce engine.

mod codegen;
mod jit;
mod reduce;
mod renderer;
mod runtime;

pub use jit::{CpuJit, ReduceFn, RenderFn};
pub use reduce::CpuReduceEngine;
pub use renderer::{strip_partition, CpuRenderer, Strip};

/// Height of one dispatched strip, in rows.
pub(crate) const STRIP_HEIGHT: u32 = 8;
