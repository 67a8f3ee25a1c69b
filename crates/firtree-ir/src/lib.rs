//! Typed intermediate representation for Firtree kernels.
//!
//! The front-end lowers kernel-language source into this IR, the linker
//! splices modules together and specialises sampler call sites, and the CPU
//! backend translates the result into machine code. Functions are lists of
//! basic blocks over an instruction arena; locals are `alloca`s accessed
//! through `load`/`store`, and the only phi nodes are the ones produced by
//! short-circuit operators and the ternary conditional.

mod module;
mod passes;
mod print;
mod types;

pub use module::{
    Block, BlockId, BuiltinFunc, ConstValue, Function, FunctionBuilder, FunctionKind, InstData,
    InstId, KernelTarget, Module, Op, Terminator, UnaryOp, ValueRef,
};
pub use module::BinaryOp;
pub use passes::{eliminate_dead_code, fold_constants, optimize_function, optimize_module, verify, VerifyError};
pub use types::{Param, ParamDirection, Type};
