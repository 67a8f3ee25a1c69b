//! Firtree: an image-processing system around a kernel language.
//!
//! Pixel kernels written in a small C-like shading dialect are compiled to
//! a typed IR (`firtree-kernel`), bound into a DAG of samplers, linked into
//! one leaf function per root, JIT-translated to native code and invoked by
//! a tiled multi-threaded CPU renderer.
//!
//! ```no_run
//! use firtree::{BufferFormat, CpuRenderer, KernelSampler, Sampler};
//!
//! let kernel = KernelSampler::new();
//! kernel.compile_from_source(
//!     "kernel vec4 ramp(float gain) {\n\
//!      \treturn vec4(destCoord().x * gain, 0.0, 0.0, 1.0);\n\
//!      }\n",
//!     None,
//! );
//! kernel.set_value("gain", 0.25f32).unwrap();
//!
//! let renderer = CpuRenderer::new();
//! renderer.set_sampler(Some(Sampler::Kernel(kernel)));
//! let mut pixels = vec![0u8; 4 * 4 * 4];
//! renderer
//!     .render_into_buffer([0.0, 0.0, 4.0, 4.0], &mut pixels, 4, 4, 16, BufferFormat::Argb32)
//!     .unwrap();
//! ```

mod affine;
mod cpu;
pub mod debug;
mod error;
mod format;
mod kernel;
mod linker;
mod lockfree;
pub mod log;
mod sampler;
mod signal;
mod value;

pub use affine::AffineTransform;
pub use cpu::{strip_partition, CpuJit, CpuReduceEngine, CpuRenderer, ReduceFn, RenderFn, Strip};
pub use error::{BindError, JitError, LinkError, RenderError};
pub use format::BufferFormat;
pub use kernel::KernelSampler;
pub use linker::{link_sampler, LinkedSampler, ParamSlot};
pub use lockfree::LockFreeSet;
pub use sampler::{
    extent_is_infinite, extent_union, BufferSampler, Extent, PixelBuffer, Sampler, INFINITE_EXTENT,
};
pub use signal::{HandlerId, SamplerSignals, Signal};
pub use value::Value;

// The compiler front-end, re-exported for callers that drive it directly.
pub use firtree_kernel::{CompiledKernel, CompileLog, KernelFunction, ParamSpec};

pub use firtree_ir as ir;
