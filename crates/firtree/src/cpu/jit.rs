//! The render/reduce JIT.
//!
//! Takes the linker's output, lowers it plus a render entry point for the
//! requested pixel format (or the reduce harness) into a fresh JIT module,
//! and hands back a raw function pointer with the stable C ABI:
//!
//! ```text
//! render_FIRTREE_FORMAT_<NAME>(u8* buf, u32 width, u32 height, u32 stride,
//!                              const f32 extent[4])
//! reduce(void* sink, u32 width, u32 height, const f32 extent[4])
//! ```
//!
//! The dynamic-parameter buffer's address is baked into the code; the
//! caller refreshes it (under the provider lock) before dispatching.

use super::codegen::{ir_signature, lower_ir_function};
use super::runtime::{self, ParamBuffer};
use crate::error::JitError;
use crate::format::{BufferFormat, PackKind, PackSpec};
use crate::linker::LinkedSampler;
use crate::sampler::PixelBuffer;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind, Value as ClValue,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use firtree_ir::Type;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Stable render entry point signature.
pub type RenderFn = unsafe extern "C" fn(*mut u8, u32, u32, u32, *const f32);

/// Stable reduce entry point signature. The sink is a
/// [`LockFreeSet`](crate::LockFreeSet).
pub type ReduceFn = unsafe extern "C" fn(*mut std::ffi::c_void, u32, u32, *const f32);

/// A materialised render function plus everything that must stay alive
/// while it can run.
pub(crate) struct CompiledRender {
    module: Option<JITModule>,
    pub func: RenderFn,
    pub params: Arc<ParamBuffer>,
    _buffers: Vec<Arc<PixelBuffer>>,
}

pub(crate) struct CompiledReduce {
    module: Option<JITModule>,
    pub func: ReduceFn,
    pub params: Arc<ParamBuffer>,
    pub element_lanes: usize,
    _buffers: Vec<Arc<PixelBuffer>>,
}

// The executable memory is freed with the holder. Callers guarantee no
// render is in flight when the holder drops (the provider render lock).
macro_rules! impl_free_on_drop {
    ($name:ident) => {
        impl Drop for $name {
            fn drop(&mut self) {
                if let Some(module) = self.module.take() {
                    unsafe { module.free_memory() };
                }
            }
        }
    };
}
impl_free_on_drop!(CompiledRender);
impl_free_on_drop!(CompiledReduce);

unsafe impl Send for CompiledRender {}
unsafe impl Sync for CompiledRender {}
unsafe impl Send for CompiledReduce {}
unsafe impl Sync for CompiledReduce {}

/// Compiles linked sampler modules to machine code.
pub struct CpuJit {
    optimize: bool,
}

impl CpuJit {
    pub fn new() -> CpuJit {
        CpuJit { optimize: true }
    }

    pub fn with_optimization(optimize: bool) -> CpuJit {
        CpuJit { optimize }
    }

    fn fresh_module(&self) -> Result<JITModule, JitError> {
        let mut flags = settings::builder();
        flags
            .set("opt_level", if self.optimize { "speed" } else { "none" })
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let isa = cranelift_native::builder()
            .map_err(|e| JitError::UnsupportedTarget(e.to_string()))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| JitError::UnsupportedTarget(e.to_string()))?;
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        runtime::register_symbols(&mut builder);
        Ok(JITModule::new(builder))
    }

    /// Declare the host shims and every linked function, then define the
    /// linked functions. Returns the function-id maps.
    fn lower_linked(
        &self,
        module: &mut JITModule,
        fbc: &mut FunctionBuilderContext,
        ir_module: &firtree_ir::Module,
        buffers: &[Arc<PixelBuffer>],
    ) -> Result<(HashMap<String, FuncId>, HashMap<&'static str, FuncId>), JitError> {
        let ptr_ty = module.target_config().pointer_type();
        let call_conv = module.target_config().default_call_conv;

        let mut shims: HashMap<&'static str, FuncId> = HashMap::new();
        let mut unary_sig = Signature::new(call_conv);
        unary_sig.params.push(AbiParam::new(types::F32));
        unary_sig.returns.push(AbiParam::new(types::F32));
        for (name, _) in runtime::UNARY_SHIMS {
            let id = module
                .declare_function(name, Linkage::Import, &unary_sig)
                .map_err(|e| JitError::Codegen(e.to_string()))?;
            shims.insert(*name, id);
        }
        let mut binary_sig = Signature::new(call_conv);
        binary_sig.params.push(AbiParam::new(types::F32));
        binary_sig.params.push(AbiParam::new(types::F32));
        binary_sig.returns.push(AbiParam::new(types::F32));
        for (name, _) in runtime::BINARY_SHIMS {
            let id = module
                .declare_function(name, Linkage::Import, &binary_sig)
                .map_err(|e| JitError::Codegen(e.to_string()))?;
            shims.insert(*name, id);
        }
        let mut sample_sig = Signature::new(call_conv);
        sample_sig.params.push(AbiParam::new(ptr_ty));
        sample_sig.params.push(AbiParam::new(types::F32));
        sample_sig.params.push(AbiParam::new(types::F32));
        sample_sig.params.push(AbiParam::new(ptr_ty));
        let id = module
            .declare_function(runtime::SAMPLE_BUFFER_SYMBOL, Linkage::Import, &sample_sig)
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        shims.insert(runtime::SAMPLE_BUFFER_SYMBOL, id);
        let mut emit_sig = Signature::new(call_conv);
        emit_sig.params.push(AbiParam::new(ptr_ty));
        emit_sig.params.push(AbiParam::new(ptr_ty));
        emit_sig.params.push(AbiParam::new(types::I32));
        let id = module
            .declare_function(runtime::EMIT_SYMBOL, Linkage::Import, &emit_sig)
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        shims.insert(runtime::EMIT_SYMBOL, id);

        // Every linked function is local: the render/reduce entry is the
        // only export.
        let mut func_ids: HashMap<String, FuncId> = HashMap::new();
        for func in &ir_module.functions {
            let sig = ir_signature(ptr_ty, call_conv, func);
            let id = module
                .declare_function(&func.name, Linkage::Local, &sig)
                .map_err(|e| JitError::Codegen(e.to_string()))?;
            func_ids.insert(func.name.clone(), id);
        }
        for func in &ir_module.functions {
            lower_ir_function(module, fbc, ir_module, func, &func_ids, &shims, buffers)?;
        }
        Ok((func_ids, shims))
    }

    /// Compile a render function for `format`. The returned artifact owns
    /// its machine code and parameter buffer.
    pub(crate) fn compile_render(
        &self,
        linked: &LinkedSampler,
        format: BufferFormat,
    ) -> Result<CompiledRender, JitError> {
        let Some(entry_name) = format.render_function_name() else {
            return Err(JitError::UnsupportedFormat(format));
        };
        let pack = format.pack_spec().expect("renderable format without a pack spec");

        let mut ir_module = linked.module.clone();
        if self.optimize {
            firtree_ir::optimize_module(&mut ir_module);
        }

        let params = Arc::new(ParamBuffer::new(linked.param_len));
        let mut module = self.fresh_module()?;
        let mut fbc = FunctionBuilderContext::new();
        let (func_ids, _shims) = self.lower_linked(&mut module, &mut fbc, &ir_module, &linked.buffers)?;

        let leaf = func_ids[&linked.root];
        let entry = build_render_entry(
            &mut module,
            &mut fbc,
            &entry_name,
            leaf,
            pack,
            params.base_ptr() as i64,
        )?;

        module
            .finalize_definitions()
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let ptr = module.get_finalized_function(entry);
        debug!(entry = %entry_name, "materialised render function");
        Ok(CompiledRender {
            module: Some(module),
            func: unsafe { std::mem::transmute::<*const u8, RenderFn>(ptr) },
            params,
            _buffers: linked.buffers.clone(),
        })
    }

    /// Compile the reduce harness for a linked reduce kernel.
    pub(crate) fn compile_reduce(&self, linked: &LinkedSampler) -> Result<CompiledReduce, JitError> {
        let element_lanes = linked.reduce_type.map(Type::lanes).unwrap_or(0);

        let mut ir_module = linked.module.clone();
        if self.optimize {
            firtree_ir::optimize_module(&mut ir_module);
        }

        let params = Arc::new(ParamBuffer::new(linked.param_len));
        let mut module = self.fresh_module()?;
        let mut fbc = FunctionBuilderContext::new();
        let (func_ids, _shims) = self.lower_linked(&mut module, &mut fbc, &ir_module, &linked.buffers)?;

        let leaf = func_ids[&linked.root];
        let entry = build_reduce_entry(&mut module, &mut fbc, leaf, params.base_ptr() as i64)?;

        module
            .finalize_definitions()
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let ptr = module.get_finalized_function(entry);
        debug!("materialised reduce function");
        Ok(CompiledReduce {
            module: Some(module),
            func: unsafe { std::mem::transmute::<*const u8, ReduceFn>(ptr) },
            params,
            element_lanes,
            _buffers: linked.buffers.clone(),
        })
    }
}

impl Default for CpuJit {
    fn default() -> CpuJit {
        CpuJit::new()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Entry point construction

struct LoopVars {
    i_slot: cranelift_codegen::ir::StackSlot,
    j_slot: cranelift_codegen::ir::StackSlot,
}

/// Convert a clamped channel to an integer byte value.
fn byte_of(b: &mut FunctionBuilder<'_>, v: ClValue) -> ClValue {
    let k255 = b.ins().f32const(255.0);
    let half = b.ins().f32const(0.5);
    let scaled = b.ins().fmul(v, k255);
    let rounded = b.ins().fadd(scaled, half);
    b.ins().fcvt_to_uint_sat(types::I32, rounded)
}

/// Build `render_FIRTREE_FORMAT_<NAME>`: an `i, j` loop over pixel centres
/// calling the leaf and packing the result.
fn build_render_entry(
    module: &mut JITModule,
    fbc: &mut FunctionBuilderContext,
    name: &str,
    leaf: FuncId,
    pack: PackSpec,
    params_base: i64,
) -> Result<FuncId, JitError> {
    let ptr_ty = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_ty)); // buffer
    sig.params.push(AbiParam::new(types::I32)); // width
    sig.params.push(AbiParam::new(types::I32)); // height
    sig.params.push(AbiParam::new(types::I32)); // stride
    sig.params.push(AbiParam::new(ptr_ty)); // extent[4]

    let entry_id = module
        .declare_function(name, Linkage::Export, &sig)
        .map_err(|e| JitError::Codegen(e.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, fbc);
        let entry = b.create_block();
        let i_head = b.create_block();
        let i_body = b.create_block();
        let j_head = b.create_block();
        let j_body = b.create_block();
        let i_latch = b.create_block();
        let exit = b.create_block();

        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let args = b.block_params(entry).to_vec();
        let (buf, width, height, stride, extent_ptr) = (args[0], args[1], args[2], args[3], args[4]);

        let ext_x = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 0);
        let ext_y = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 4);
        let ext_w = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 8);
        let ext_h = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 12);
        let wf = b.ins().fcvt_from_uint(types::F32, width);
        let hf = b.ins().fcvt_from_uint(types::F32, height);
        let dx = b.ins().fdiv(ext_w, wf);
        let dy = b.ins().fdiv(ext_h, hf);

        let vars = LoopVars {
            i_slot: b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2)),
            j_slot: b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2)),
        };
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().stack_store(zero, vars.i_slot, 0);
        b.ins().jump(i_head, &[]);

        b.switch_to_block(i_head);
        let i = b.ins().stack_load(types::I32, vars.i_slot, 0);
        let more_rows = b.ins().icmp(IntCC::UnsignedLessThan, i, height);
        b.ins().brif(more_rows, i_body, &[], exit, &[]);

        b.switch_to_block(i_body);
        let i = b.ins().stack_load(types::I32, vars.i_slot, 0);
        let fi = b.ins().fcvt_from_uint(types::F32, i);
        let half = b.ins().f32const(0.5);
        let fi_c = b.ins().fadd(fi, half);
        let y_off = b.ins().fmul(fi_c, dy);
        let py = b.ins().fadd(ext_y, y_off);
        let i64_i = b.ins().uextend(types::I64, i);
        let i64_stride = b.ins().uextend(types::I64, stride);
        let row_off = b.ins().imul(i64_i, i64_stride);
        let row = b.ins().iadd(buf, row_off);
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().stack_store(zero, vars.j_slot, 0);
        b.ins().jump(j_head, &[]);

        b.switch_to_block(j_head);
        let j = b.ins().stack_load(types::I32, vars.j_slot, 0);
        let more_cols = b.ins().icmp(IntCC::UnsignedLessThan, j, width);
        b.ins().brif(more_cols, j_body, &[], i_latch, &[]);

        b.switch_to_block(j_body);
        let j = b.ins().stack_load(types::I32, vars.j_slot, 0);
        let fj = b.ins().fcvt_from_uint(types::F32, j);
        let fj_c = b.ins().fadd(fj, half);
        let x_off = b.ins().fmul(fj_c, dx);
        let px = b.ins().fadd(ext_x, x_off);

        // Evaluate the pixel.
        let out_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 16, 2));
        let out_addr = b.ins().stack_addr(ptr_ty, out_slot, 0);
        let params = b.ins().iconst(ptr_ty, params_base);
        let no_sink = b.ins().iconst(ptr_ty, 0);
        let leaf_ref = module.declare_func_in_func(leaf, b.func);
        b.ins().call(leaf_ref, &[params, no_sink, px, py, out_addr]);

        let mut rgba: Vec<ClValue> = (0..4).map(|k| b.ins().stack_load(types::F32, out_slot, k * 4)).collect();
        // Clamp to [0, 1]; premultiply afterwards when the target wants it.
        let one = b.ins().f32const(1.0);
        let zero_f = b.ins().f32const(0.0);
        for v in rgba.iter_mut() {
            let lo = b.ins().fmax(*v, zero_f);
            *v = b.ins().fmin(lo, one);
        }
        if pack.premultiplied {
            let a = rgba[3];
            for v in rgba.iter_mut().take(3) {
                *v = b.ins().fmul(*v, a);
            }
        }

        let j64 = b.ins().uextend(types::I64, j);
        let pix_off = b.ins().imul_imm(j64, pack.bytes_per_pixel as i64);
        let pixel = b.ins().iadd(row, pix_off);

        match pack.kind {
            PackKind::Word32 { r, g, b: bs, a, has_alpha } => {
                let rb = byte_of(&mut b, rgba[0]);
                let gb = byte_of(&mut b, rgba[1]);
                let bb = byte_of(&mut b, rgba[2]);
                let ab = if has_alpha {
                    byte_of(&mut b, rgba[3])
                } else {
                    b.ins().iconst(types::I32, 0xff)
                };
                let rsh = b.ins().ishl_imm(rb, r as i64);
                let gsh = b.ins().ishl_imm(gb, g as i64);
                let bsh = b.ins().ishl_imm(bb, bs as i64);
                let ash = b.ins().ishl_imm(ab, a as i64);
                let word = b.ins().bor(rsh, gsh);
                let word = b.ins().bor(word, bsh);
                let word = b.ins().bor(word, ash);
                b.ins().store(MemFlags::trusted(), word, pixel, 0);
            }
            PackKind::Bytes3 { r, g, b: bs } => {
                let rb = byte_of(&mut b, rgba[0]);
                let gb = byte_of(&mut b, rgba[1]);
                let bb = byte_of(&mut b, rgba[2]);
                b.ins().istore8(MemFlags::trusted(), rb, pixel, r as i32);
                b.ins().istore8(MemFlags::trusted(), gb, pixel, g as i32);
                b.ins().istore8(MemFlags::trusted(), bb, pixel, bs as i32);
            }
            PackKind::F32x4 => {
                for (k, v) in rgba.iter().enumerate() {
                    b.ins().store(MemFlags::trusted(), *v, pixel, (k * 4) as i32);
                }
            }
        }

        let j_next = b.ins().iadd_imm(j, 1);
        b.ins().stack_store(j_next, vars.j_slot, 0);
        b.ins().jump(j_head, &[]);

        b.switch_to_block(i_latch);
        let i = b.ins().stack_load(types::I32, vars.i_slot, 0);
        let i_next = b.ins().iadd_imm(i, 1);
        b.ins().stack_store(i_next, vars.i_slot, 0);
        b.ins().jump(i_head, &[]);

        b.switch_to_block(exit);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
    }

    module
        .define_function(entry_id, &mut ctx)
        .map_err(|e| JitError::Codegen(e.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(entry_id)
}

/// Build the `reduce(void* sink, u32 width, u32 height, const f32 extent[4])`
/// harness: the same pixel loop, forwarding the sink to the leaf.
fn build_reduce_entry(
    module: &mut JITModule,
    fbc: &mut FunctionBuilderContext,
    leaf: FuncId,
    params_base: i64,
) -> Result<FuncId, JitError> {
    let ptr_ty = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_ty)); // sink
    sig.params.push(AbiParam::new(types::I32)); // width
    sig.params.push(AbiParam::new(types::I32)); // height
    sig.params.push(AbiParam::new(ptr_ty)); // extent[4]

    let entry_id = module
        .declare_function("reduce", Linkage::Export, &sig)
        .map_err(|e| JitError::Codegen(e.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, fbc);
        let entry = b.create_block();
        let i_head = b.create_block();
        let i_body = b.create_block();
        let j_head = b.create_block();
        let j_body = b.create_block();
        let i_latch = b.create_block();
        let exit = b.create_block();

        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let args = b.block_params(entry).to_vec();
        let (sink, width, height, extent_ptr) = (args[0], args[1], args[2], args[3]);

        let ext_x = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 0);
        let ext_y = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 4);
        let ext_w = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 8);
        let ext_h = b.ins().load(types::F32, MemFlags::trusted(), extent_ptr, 12);
        let wf = b.ins().fcvt_from_uint(types::F32, width);
        let hf = b.ins().fcvt_from_uint(types::F32, height);
        let dx = b.ins().fdiv(ext_w, wf);
        let dy = b.ins().fdiv(ext_h, hf);

        let i_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2));
        let j_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2));
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().stack_store(zero, i_slot, 0);
        b.ins().jump(i_head, &[]);

        b.switch_to_block(i_head);
        let i = b.ins().stack_load(types::I32, i_slot, 0);
        let more_rows = b.ins().icmp(IntCC::UnsignedLessThan, i, height);
        b.ins().brif(more_rows, i_body, &[], exit, &[]);

        b.switch_to_block(i_body);
        let i = b.ins().stack_load(types::I32, i_slot, 0);
        let fi = b.ins().fcvt_from_uint(types::F32, i);
        let half = b.ins().f32const(0.5);
        let fi_c = b.ins().fadd(fi, half);
        let y_off = b.ins().fmul(fi_c, dy);
        let py = b.ins().fadd(ext_y, y_off);
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().stack_store(zero, j_slot, 0);
        b.ins().jump(j_head, &[]);

        b.switch_to_block(j_head);
        let j = b.ins().stack_load(types::I32, j_slot, 0);
        let more_cols = b.ins().icmp(IntCC::UnsignedLessThan, j, width);
        b.ins().brif(more_cols, j_body, &[], i_latch, &[]);

        b.switch_to_block(j_body);
        let j = b.ins().stack_load(types::I32, j_slot, 0);
        let fj = b.ins().fcvt_from_uint(types::F32, j);
        let fj_c = b.ins().fadd(fj, half);
        let x_off = b.ins().fmul(fj_c, dx);
        let px = b.ins().fadd(ext_x, x_off);

        let params = b.ins().iconst(ptr_ty, params_base);
        let leaf_ref = module.declare_func_in_func(leaf, b.func);
        b.ins().call(leaf_ref, &[params, sink, px, py]);

        let j_next = b.ins().iadd_imm(j, 1);
        b.ins().stack_store(j_next, j_slot, 0);
        b.ins().jump(j_head, &[]);

        b.switch_to_block(i_latch);
        let i = b.ins().stack_load(types::I32, i_slot, 0);
        let i_next = b.ins().iadd_imm(i, 1);
        b.ins().stack_store(i_next, i_slot, 0);
        b.ins().jump(i_head, &[]);

        b.switch_to_block(exit);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
    }

    module
        .define_function(entry_id, &mut ctx)
        .map_err(|e| JitError::Codegen(e.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(entry_id)
}
