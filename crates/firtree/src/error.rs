use firtree_ir::Type;
use thiserror::Error;

/// Errors reported when binding kernel arguments.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("no parameter named `{0}`")]
    NoSuchParameter(String),
    #[error("type mismatch for `{name}`: expected {expected}, got {got}")]
    TypeMismatch { name: String, expected: Type, got: Type },
    #[error("binding would create a cycle in the sampler graph")]
    Cycle,
    #[error("the sampler has no compiled kernel")]
    NoKernel,
    #[error("no kernel function named `{0}` in the compiled module")]
    NoSuchKernel(String),
}

/// Errors produced while linking a sampler graph into one module.
///
/// A graph that reports `is_valid()` always links; seeing one of these
/// outside that contract is a programmer error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("parameter `{name}` of kernel `{kernel}` is unbound")]
    UnboundParameter { kernel: String, name: String },
    #[error("sampler graph contains a cycle")]
    Cycle,
    #[error("sampler with unbounded extent reached where a bounded extent is required")]
    MissingExtent,
    #[error("the sampler has no valid compiled kernel")]
    InvalidKernel,
}

/// Errors from the machine-code back-end.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("host target is not supported: {0}")]
    UnsupportedTarget(String),
    #[error("code generation failed: {0}")]
    Codegen(String),
    #[error("format {0:?} has no render entry point")]
    UnsupportedFormat(crate::BufferFormat),
}

/// Errors from the render / reduce entry points.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no sampler attached")]
    NoSampler,
    #[error("sampler graph is not fully bound")]
    InvalidSampler,
    #[error("format {0:?} cannot be rendered into")]
    UnsupportedFormat(crate::BufferFormat),
    #[error("buffer of {got} bytes is too small ({need} required)")]
    BufferTooSmall { need: usize, got: usize },
    #[error("row stride {stride} is too small for {width} pixels")]
    BadStride { stride: u32, width: u32 },
    #[error("reduce sink element size {sink} does not match the kernel's emit type ({kernel} bytes)")]
    SinkElementMismatch { sink: usize, kernel: usize },
    #[error("the sampler is not a reduce kernel")]
    NotReduce,
    #[error("the sampler is a reduce kernel and cannot render pixels")]
    NotRender,
}
