//! Lowering from the typed kernel IR to Cranelift.
//!
//! Values are scalarised: a vec4 is four f32 SSA values, a mat3 is nine.
//! Every lowered function shares one internal convention:
//!
//! ```text
//! fn(params: ptr, sink: ptr, x: f32, y: f32,
//!    <value args, one machine value per lane>,
//!    <by-ref args as pointers>,
//!    out: ptr)        // present when the return type is not void
//! ```
//!
//! `alloca`s and `phi`s become explicit stack slots (4-byte lanes), which
//! keeps branching free of block arguments. Sampler intrinsics must have
//! been rewritten away by the linker before lowering.

use crate::error::JitError;
use crate::sampler::PixelBuffer;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, AbiParam, Block as ClBlock, InstBuilder, MemFlags, Signature, StackSlot, StackSlotData,
    StackSlotKind, Type as ClType, Value as ClValue,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};
use firtree_ir::{
    BinaryOp, BlockId, BuiltinFunc, ConstValue, Function as IrFunction, InstId, Module as IrModule,
    Op, Terminator, Type, UnaryOp, ValueRef,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Machine type of one lane of an IR value.
fn lane_type(ty: Type) -> ClType {
    match ty {
        Type::Bool => types::I8,
        Type::Int => types::I32,
        _ => types::F32,
    }
}

fn lane_count(ty: Type) -> usize {
    ty.lanes()
}

/// The shared signature described in the module docs.
pub(crate) fn ir_signature(ptr_ty: ClType, call_conv: CallConv, func: &IrFunction) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_ty)); // parameter buffer
    sig.params.push(AbiParam::new(ptr_ty)); // reduce sink
    sig.params.push(AbiParam::new(types::F32)); // dest x
    sig.params.push(AbiParam::new(types::F32)); // dest y
    for p in &func.params {
        if p.by_ref() {
            sig.params.push(AbiParam::new(ptr_ty));
        } else {
            for _ in 0..lane_count(p.ty) {
                sig.params.push(AbiParam::new(lane_type(p.ty)));
            }
        }
    }
    if func.ret_ty != Type::Void {
        sig.params.push(AbiParam::new(ptr_ty)); // return value out-pointer
    }
    sig
}

/// Shim symbol for builtins without a Cranelift instruction.
fn unary_shim(func: BuiltinFunc) -> Option<&'static str> {
    Some(match func {
        BuiltinFunc::Sin => "ft_sinf",
        BuiltinFunc::Cos => "ft_cosf",
        BuiltinFunc::Tan => "ft_tanf",
        BuiltinFunc::Asin => "ft_asinf",
        BuiltinFunc::Acos => "ft_acosf",
        BuiltinFunc::Atan => "ft_atanf",
        BuiltinFunc::Exp => "ft_expf",
        BuiltinFunc::Log => "ft_logf",
        BuiltinFunc::Exp2 => "ft_exp2f",
        BuiltinFunc::Log2 => "ft_log2f",
        _ => return None,
    })
}

fn binary_shim(func: BuiltinFunc) -> Option<&'static str> {
    Some(match func {
        BuiltinFunc::Atan2 => "ft_atan2f",
        BuiltinFunc::Pow => "ft_powf",
        _ => return None,
    })
}

enum ParamVal {
    Lanes(Vec<ClValue>),
    Ref(ClValue),
}

enum Addr {
    Slot(StackSlot),
    Ptr(ClValue),
}

/// Lower one IR function into an already-declared Cranelift function.
pub(crate) fn lower_ir_function(
    module: &mut JITModule,
    fbc: &mut FunctionBuilderContext,
    ir_module: &IrModule,
    irf: &IrFunction,
    func_ids: &HashMap<String, FuncId>,
    shims: &HashMap<&'static str, FuncId>,
    buffers: &[Arc<PixelBuffer>],
) -> Result<(), JitError> {
    let ptr_ty = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;
    let func_id = func_ids[&irf.name];

    let mut ctx = module.make_context();
    ctx.func.signature = ir_signature(ptr_ty, call_conv, irf);
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, fbc);

        // Only blocks reachable from the entry are lowered; the front-end
        // parks dead statements after `return` in detached blocks.
        let mut reachable: HashSet<u32> = HashSet::new();
        let mut work = vec![irf.entry()];
        while let Some(block) = work.pop() {
            if !reachable.insert(block.0) {
                continue;
            }
            if let Some(term) = &irf.block(block).term {
                work.extend(term.successors());
            }
        }

        let mut blocks: HashMap<u32, ClBlock> = HashMap::new();
        let mut order: Vec<u32> = (0..irf.blocks.len() as u32).filter(|b| reachable.contains(b)).collect();
        order.sort_unstable();
        for block in &order {
            blocks.insert(*block, b.create_block());
        }
        let entry = blocks[&0];
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);

        // Unpack the incoming arguments.
        let incoming: Vec<ClValue> = b.block_params(entry).to_vec();
        let mut cursor = 0usize;
        let params_ptr = incoming[cursor];
        let sink = incoming[cursor + 1];
        let x = incoming[cursor + 2];
        let y = incoming[cursor + 3];
        cursor += 4;
        let mut params: Vec<ParamVal> = Vec::with_capacity(irf.params.len());
        for p in &irf.params {
            if p.by_ref() {
                params.push(ParamVal::Ref(incoming[cursor]));
                cursor += 1;
            } else {
                let n = lane_count(p.ty);
                params.push(ParamVal::Lanes(incoming[cursor..cursor + n].to_vec()));
                cursor += n;
            }
        }
        let out_ptr = (irf.ret_ty != Type::Void).then(|| incoming[cursor]);

        // Stack slots for locals and phi merges.
        let mut slots: HashMap<u32, StackSlot> = HashMap::new();
        for block in &order {
            for id in &irf.block(BlockId(*block)).insts {
                let inst = irf.inst(*id);
                if matches!(inst.op, Op::Alloca | Op::Phi { .. }) {
                    let size = (lane_count(inst.ty).max(1) * 4) as u32;
                    let slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 2));
                    slots.insert(id.0, slot);
                }
            }
        }

        let mut lower = FnLower {
            b,
            module: &mut *module,
            ir_module,
            irf,
            func_ids,
            shims,
            buffers,
            ptr_ty,
            blocks,
            slots,
            inst_vals: HashMap::new(),
            params,
            params_ptr,
            sink,
            x,
            y,
            out_ptr,
        };

        for block in &order {
            lower.lower_block(BlockId(*block))?;
        }

        lower.b.seal_all_blocks();
        lower.b.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| JitError::Codegen(e.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(())
}

struct FnLower<'a, 'f> {
    b: FunctionBuilder<'f>,
    module: &'a mut JITModule,
    ir_module: &'a IrModule,
    irf: &'a IrFunction,
    func_ids: &'a HashMap<String, FuncId>,
    shims: &'a HashMap<&'static str, FuncId>,
    buffers: &'a [Arc<PixelBuffer>],
    ptr_ty: ClType,
    blocks: HashMap<u32, ClBlock>,
    slots: HashMap<u32, StackSlot>,
    inst_vals: HashMap<u32, Vec<ClValue>>,
    params: Vec<ParamVal>,
    params_ptr: ClValue,
    sink: ClValue,
    x: ClValue,
    y: ClValue,
    out_ptr: Option<ClValue>,
}

impl<'a, 'f> FnLower<'a, 'f> {
    fn values(&self, v: ValueRef) -> Vec<ClValue> {
        match v {
            ValueRef::Param(i) => match &self.params[i as usize] {
                ParamVal::Lanes(lanes) => lanes.clone(),
                ParamVal::Ref(_) => unreachable!("by-ref parameter used as a value"),
            },
            ValueRef::Inst(id) => self.inst_vals[&id.0].clone(),
        }
    }

    fn addr_of(&mut self, v: ValueRef) -> Addr {
        match v {
            ValueRef::Param(i) => match &self.params[i as usize] {
                ParamVal::Ref(ptr) => Addr::Ptr(*ptr),
                ParamVal::Lanes(_) => unreachable!("value parameter used as an address"),
            },
            ValueRef::Inst(id) => Addr::Slot(self.slots[&id.0]),
        }
    }

    fn call_shim(&mut self, name: &'static str, args: &[ClValue]) -> ClValue {
        let func_id = self.shims[name];
        let callee = self.module.declare_func_in_func(func_id, self.b.func);
        let call = self.b.ins().call(callee, args);
        self.b.inst_results(call)[0]
    }

    fn call_shim_void(&mut self, name: &'static str, args: &[ClValue]) {
        let func_id = self.shims[name];
        let callee = self.module.declare_func_in_func(func_id, self.b.func);
        self.b.ins().call(callee, args);
    }

    /// Read a lane-array value from memory (4-byte cells; bools widen to
    /// i32 in memory).
    fn load_cells(&mut self, addr: &Addr, ty: Type) -> Vec<ClValue> {
        let n = lane_count(ty);
        let mut out = Vec::with_capacity(n);
        for lane in 0..n {
            let offset = (lane * 4) as i32;
            let v = match (ty, addr) {
                (Type::Int, Addr::Slot(slot)) => self.b.ins().stack_load(types::I32, *slot, offset),
                (Type::Int, Addr::Ptr(p)) => self.b.ins().load(types::I32, MemFlags::trusted(), *p, offset),
                (Type::Bool, Addr::Slot(slot)) => {
                    let word = self.b.ins().stack_load(types::I32, *slot, offset);
                    self.b.ins().icmp_imm(IntCC::NotEqual, word, 0)
                }
                (Type::Bool, Addr::Ptr(p)) => {
                    let word = self.b.ins().load(types::I32, MemFlags::trusted(), *p, offset);
                    self.b.ins().icmp_imm(IntCC::NotEqual, word, 0)
                }
                (_, Addr::Slot(slot)) => self.b.ins().stack_load(types::F32, *slot, offset),
                (_, Addr::Ptr(p)) => self.b.ins().load(types::F32, MemFlags::trusted(), *p, offset),
            };
            out.push(v);
        }
        out
    }

    fn store_cells(&mut self, addr: &Addr, ty: Type, vals: &[ClValue]) {
        for (lane, v) in vals.iter().enumerate() {
            let offset = (lane * 4) as i32;
            let v = if ty == Type::Bool {
                self.b.ins().uextend(types::I32, *v)
            } else {
                *v
            };
            match addr {
                Addr::Slot(slot) => {
                    self.b.ins().stack_store(v, *slot, offset);
                }
                Addr::Ptr(p) => {
                    self.b.ins().store(MemFlags::trusted(), v, *p, offset);
                }
            }
        }
    }

    fn lower_block(&mut self, block_id: BlockId) -> Result<(), JitError> {
        let cl_block = self.blocks[&block_id.0];
        self.b.switch_to_block(cl_block);
        for id in &self.irf.block(block_id).insts {
            self.lower_inst(*id)?;
        }
        let term = self
            .irf
            .block(block_id)
            .term
            .clone()
            .expect("unterminated block survived to codegen");
        self.lower_terminator(block_id, &term);
        Ok(())
    }

    /// Store the values flowing into `target`'s phis along the edge from
    /// `from`.
    fn store_phi_edges(&mut self, from: BlockId, target: BlockId) {
        for id in &self.irf.block(target).insts.clone() {
            if let Op::Phi { incoming } = &self.irf.inst(*id).op {
                if let Some((_, value)) = incoming.iter().find(|(b, _)| *b == from) {
                    let vals = self.values(*value);
                    let slot = self.slots[&id.0];
                    let ty = self.irf.inst(*id).ty;
                    self.store_cells(&Addr::Slot(slot), ty, &vals);
                }
            }
        }
    }

    fn lower_terminator(&mut self, block_id: BlockId, term: &Terminator) {
        match term {
            Terminator::Ret(value) => {
                if let Some(value) = value {
                    let vals = self.values(*value);
                    let ty = self.irf.value_type(*value);
                    let out = self.out_ptr.expect("return value without an out-pointer");
                    self.store_cells(&Addr::Ptr(out), ty, &vals);
                }
                self.b.ins().return_(&[]);
            }
            Terminator::Br(target) => {
                self.store_phi_edges(block_id, *target);
                let block = self.blocks[&target.0];
                self.b.ins().jump(block, &[]);
            }
            Terminator::CondBr { cond, then_blk, else_blk } => {
                self.store_phi_edges(block_id, *then_blk);
                self.store_phi_edges(block_id, *else_blk);
                let cond = self.values(*cond)[0];
                let then_block = self.blocks[&then_blk.0];
                let else_block = self.blocks[&else_blk.0];
                self.b.ins().brif(cond, then_block, &[], else_block, &[]);
            }
        }
    }

    fn lower_inst(&mut self, id: InstId) -> Result<(), JitError> {
        let inst = self.irf.inst(id);
        let ty = inst.ty;
        let vals: Vec<ClValue> = match &inst.op {
            Op::Const(c) => self.lower_const(c),
            Op::Construct { elems } => {
                let mut out = Vec::with_capacity(lane_count(ty));
                for e in elems {
                    out.extend(self.values(*e));
                }
                out
            }
            Op::Extract { value, lane } => vec![self.values(*value)[*lane as usize]],
            Op::Swizzle { value, lanes } => {
                let src = self.values(*value);
                lanes.iter().map(|l| src[*l as usize]).collect()
            }
            Op::Unary { op, value } => {
                let src = self.values(*value);
                match op {
                    UnaryOp::Neg if ty == Type::Int => vec![self.b.ins().ineg(src[0])],
                    UnaryOp::Neg => src.iter().map(|v| self.b.ins().fneg(*v)).collect(),
                    UnaryOp::Not => vec![self.b.ins().icmp_imm(IntCC::Equal, src[0], 0)],
                }
            }
            Op::Binary { op, lhs, rhs } => self.lower_binary(*op, *lhs, *rhs, ty),
            Op::Select { cond, on_true, on_false } => {
                let cond = self.values(*cond)[0];
                let a = self.values(*on_true);
                let c = self.values(*on_false);
                a.iter()
                    .zip(&c)
                    .map(|(t, f)| self.b.ins().select(cond, *t, *f))
                    .collect()
            }
            Op::Builtin { func, args } => self.lower_builtin(*func, args, ty),
            Op::Call { callee, args } => self.lower_call(callee, args)?,
            Op::Sample { .. } | Op::SamplerTransform { .. } | Op::SamplerExtent { .. } => {
                return Err(JitError::Codegen(format!(
                    "unresolved sampler intrinsic in `{}`; module was not linked",
                    self.irf.name
                )));
            }
            Op::DestCoord => vec![self.x, self.y],
            Op::Emit { value } => {
                let lanes = self.values(*value);
                let size = (lanes.len() * 4) as u32;
                let slot = self
                    .b
                    .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 2));
                for (i, v) in lanes.iter().enumerate() {
                    self.b.ins().stack_store(*v, slot, (i * 4) as i32);
                }
                let addr = self.b.ins().stack_addr(self.ptr_ty, slot, 0);
                let n = self.b.ins().iconst(types::I32, lanes.len() as i64);
                let sink = self.sink;
                self.call_shim_void(super::runtime::EMIT_SYMBOL, &[sink, addr, n]);
                Vec::new()
            }
            Op::SampleBuffer { buffer, coord } => {
                let coord = self.values(*coord);
                let buffer_ptr = Arc::as_ptr(&self.buffers[*buffer as usize]);
                let ptr = self.b.ins().iconst(self.ptr_ty, buffer_ptr as i64);
                let slot = self
                    .b
                    .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 16, 2));
                let out = self.b.ins().stack_addr(self.ptr_ty, slot, 0);
                self.call_shim_void(super::runtime::SAMPLE_BUFFER_SYMBOL, &[ptr, coord[0], coord[1], out]);
                (0..4)
                    .map(|i| self.b.ins().stack_load(types::F32, slot, i * 4))
                    .collect()
            }
            Op::LoadParam { slot } => {
                let base = self.params_ptr;
                let mut out = Vec::with_capacity(lane_count(ty));
                for lane in 0..lane_count(ty) {
                    let offset = ((*slot as usize + lane) * 4) as i32;
                    let cell = self.b.ins().load(types::F32, MemFlags::trusted(), base, offset);
                    let v = match ty {
                        Type::Int => self.b.ins().fcvt_to_sint_sat(types::I32, cell),
                        Type::Bool => {
                            let zero = self.b.ins().f32const(0.0);
                            self.b.ins().fcmp(FloatCC::NotEqual, cell, zero)
                        }
                        _ => cell,
                    };
                    out.push(v);
                }
                out
            }
            Op::Alloca => Vec::new(),
            Op::Load { addr } => {
                let a = self.addr_of(*addr);
                self.load_cells(&a, ty)
            }
            Op::Store { addr, value } => {
                let vals = self.values(*value);
                let value_ty = self.irf.value_type(*value);
                let a = self.addr_of(*addr);
                self.store_cells(&a, value_ty, &vals);
                Vec::new()
            }
            Op::Phi { .. } => {
                let slot = self.slots[&id.0];
                self.load_cells(&Addr::Slot(slot), ty)
            }
            Op::IntToFloat { value } => {
                let v = self.values(*value)[0];
                vec![self.b.ins().fcvt_from_sint(types::F32, v)]
            }
            Op::FloatToInt { value } => {
                let v = self.values(*value)[0];
                vec![self.b.ins().fcvt_to_sint_sat(types::I32, v)]
            }
        };
        self.inst_vals.insert(id.0, vals);
        Ok(())
    }

    fn lower_const(&mut self, c: &ConstValue) -> Vec<ClValue> {
        match c {
            ConstValue::Int(v) => vec![self.b.ins().iconst(types::I32, *v as i64)],
            ConstValue::Bool(v) => vec![self.b.ins().iconst(types::I8, *v as i64)],
            other => other
                .to_lanes()
                .iter()
                .map(|lane| self.b.ins().f32const(*lane))
                .collect(),
        }
    }

    fn lower_call(&mut self, callee: &str, args: &[ValueRef]) -> Result<Vec<ClValue>, JitError> {
        let callee_ir = self
            .ir_module
            .function(callee)
            .ok_or_else(|| JitError::Codegen(format!("call to unknown function `{}`", callee)))?;
        let func_id = *self
            .func_ids
            .get(callee)
            .ok_or_else(|| JitError::Codegen(format!("undeclared function `{}`", callee)))?;

        let mut call_args = vec![self.params_ptr, self.sink, self.x, self.y];
        for (param, arg) in callee_ir.params.iter().zip(args) {
            if param.by_ref() {
                let v = match self.addr_of(*arg) {
                    Addr::Ptr(p) => p,
                    Addr::Slot(slot) => self.b.ins().stack_addr(self.ptr_ty, slot, 0),
                };
                call_args.push(v);
            } else {
                call_args.extend(self.values(*arg));
            }
        }

        let ret_slot = if callee_ir.ret_ty != Type::Void {
            let size = (lane_count(callee_ir.ret_ty) * 4) as u32;
            let slot = self
                .b
                .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 2));
            let addr = self.b.ins().stack_addr(self.ptr_ty, slot, 0);
            call_args.push(addr);
            Some(slot)
        } else {
            None
        };

        let callee_ref = self.module.declare_func_in_func(func_id, self.b.func);
        self.b.ins().call(callee_ref, &call_args);

        match ret_slot {
            Some(slot) => Ok(self.load_cells(&Addr::Slot(slot), callee_ir.ret_ty)),
            None => Ok(Vec::new()),
        }
    }

    fn lower_binary(&mut self, op: BinaryOp, lhs: ValueRef, rhs: ValueRef, result_ty: Type) -> Vec<ClValue> {
        let lt = self.irf.value_type(lhs);
        let rt = self.irf.value_type(rhs);
        let a = self.values(lhs);
        let c = self.values(rhs);

        if op == BinaryOp::MatMul {
            return self.lower_matmul(&a, lt, &c, rt);
        }

        // Integer domain.
        if lt == Type::Int && rt == Type::Int {
            let (x, y) = (a[0], c[0]);
            let v = match op {
                BinaryOp::Add => self.b.ins().iadd(x, y),
                BinaryOp::Sub => self.b.ins().isub(x, y),
                BinaryOp::Mul => self.b.ins().imul(x, y),
                BinaryOp::Div => self.b.ins().sdiv(x, y),
                BinaryOp::Rem => self.b.ins().srem(x, y),
                BinaryOp::Eq => self.b.ins().icmp(IntCC::Equal, x, y),
                BinaryOp::Ne => self.b.ins().icmp(IntCC::NotEqual, x, y),
                BinaryOp::Lt => self.b.ins().icmp(IntCC::SignedLessThan, x, y),
                BinaryOp::Le => self.b.ins().icmp(IntCC::SignedLessThanOrEqual, x, y),
                BinaryOp::Gt => self.b.ins().icmp(IntCC::SignedGreaterThan, x, y),
                BinaryOp::Ge => self.b.ins().icmp(IntCC::SignedGreaterThanOrEqual, x, y),
                BinaryOp::MatMul => unreachable!(),
            };
            return vec![v];
        }

        // Boolean equality.
        if lt == Type::Bool && rt == Type::Bool {
            let cc = if op == BinaryOp::Eq { IntCC::Equal } else { IntCC::NotEqual };
            return vec![self.b.ins().icmp(cc, a[0], c[0])];
        }

        if op.is_comparison() {
            if op == BinaryOp::Eq || op == BinaryOp::Ne {
                // All-lanes equality.
                let mut acc: Option<ClValue> = None;
                for (x, y) in a.iter().zip(&c) {
                    let eq = self.b.ins().fcmp(FloatCC::Equal, *x, *y);
                    acc = Some(match acc {
                        None => eq,
                        Some(prev) => self.b.ins().band(prev, eq),
                    });
                }
                let all_eq = acc.expect("comparison of zero-lane values");
                return if op == BinaryOp::Eq {
                    vec![all_eq]
                } else {
                    vec![self.b.ins().bxor_imm(all_eq, 1)]
                };
            }
            let cc = match op {
                BinaryOp::Lt => FloatCC::LessThan,
                BinaryOp::Le => FloatCC::LessThanOrEqual,
                BinaryOp::Gt => FloatCC::GreaterThan,
                BinaryOp::Ge => FloatCC::GreaterThanOrEqual,
                _ => unreachable!(),
            };
            return vec![self.b.ins().fcmp(cc, a[0], c[0])];
        }

        // Componentwise float arithmetic with scalar broadcast.
        let n = lane_count(result_ty);
        let pick = |v: &[ClValue], i: usize| if v.len() == 1 { v[0] } else { v[i] };
        (0..n)
            .map(|i| {
                let (x, y) = (pick(&a, i), pick(&c, i));
                match op {
                    BinaryOp::Add => self.b.ins().fadd(x, y),
                    BinaryOp::Sub => self.b.ins().fsub(x, y),
                    BinaryOp::Mul => self.b.ins().fmul(x, y),
                    BinaryOp::Div => self.b.ins().fdiv(x, y),
                    _ => unreachable!("non-arithmetic op in arithmetic lowering"),
                }
            })
            .collect()
    }

    fn lower_matmul(&mut self, a: &[ClValue], lt: Type, c: &[ClValue], rt: Type) -> Vec<ClValue> {
        let dot = |this: &mut Self, parts: Vec<(ClValue, ClValue)>| -> ClValue {
            let mut acc: Option<ClValue> = None;
            for (x, y) in parts {
                let prod = this.b.ins().fmul(x, y);
                acc = Some(match acc {
                    None => prod,
                    Some(prev) => this.b.ins().fadd(prev, prod),
                });
            }
            acc.expect("empty product")
        };
        if lt.is_matrix() && rt.is_matrix() {
            let n = lt.dim();
            let mut out = Vec::with_capacity(n * n);
            for i in 0..n {
                for j in 0..n {
                    let parts = (0..n).map(|k| (a[i * n + k], c[k * n + j])).collect();
                    out.push(dot(self, parts));
                }
            }
            out
        } else if lt.is_matrix() {
            let n = lt.dim();
            (0..n)
                .map(|i| {
                    let parts = (0..n).map(|j| (a[i * n + j], c[j])).collect();
                    dot(self, parts)
                })
                .collect()
        } else {
            let n = rt.dim();
            (0..n)
                .map(|j| {
                    let parts = (0..n).map(|i| (a[i], c[i * n + j])).collect();
                    dot(self, parts)
                })
                .collect()
        }
    }

    fn lower_builtin(&mut self, func: BuiltinFunc, args: &[ValueRef], result_ty: Type) -> Vec<ClValue> {
        let vals: Vec<Vec<ClValue>> = args.iter().map(|a| self.values(*a)).collect();
        let n = lane_count(result_ty).max(1);
        let pick = |v: &[ClValue], i: usize| if v.len() == 1 { v[0] } else { v[i] };

        if let Some(name) = unary_shim(func) {
            return (0..n).map(|i| self.call_shim(name, &[pick(&vals[0], i)])).collect();
        }
        if let Some(name) = binary_shim(func) {
            return (0..n)
                .map(|i| {
                    let args = [pick(&vals[0], i), pick(&vals[1], i)];
                    self.call_shim(name, &args)
                })
                .collect();
        }

        match func {
            BuiltinFunc::Radians => {
                let k = self.b.ins().f32const(std::f32::consts::PI / 180.0);
                (0..n).map(|i| self.b.ins().fmul(pick(&vals[0], i), k)).collect()
            }
            BuiltinFunc::Degrees => {
                let k = self.b.ins().f32const(180.0 / std::f32::consts::PI);
                (0..n).map(|i| self.b.ins().fmul(pick(&vals[0], i), k)).collect()
            }
            BuiltinFunc::Sqrt => (0..n).map(|i| self.b.ins().sqrt(pick(&vals[0], i))).collect(),
            BuiltinFunc::InverseSqrt => {
                let one = self.b.ins().f32const(1.0);
                (0..n)
                    .map(|i| {
                        let s = self.b.ins().sqrt(pick(&vals[0], i));
                        self.b.ins().fdiv(one, s)
                    })
                    .collect()
            }
            BuiltinFunc::Abs => (0..n).map(|i| self.b.ins().fabs(pick(&vals[0], i))).collect(),
            BuiltinFunc::Sign => {
                let one = self.b.ins().f32const(1.0);
                let neg_one = self.b.ins().f32const(-1.0);
                let zero = self.b.ins().f32const(0.0);
                (0..n)
                    .map(|i| {
                        let v = pick(&vals[0], i);
                        let pos = self.b.ins().fcmp(FloatCC::GreaterThan, v, zero);
                        let neg = self.b.ins().fcmp(FloatCC::LessThan, v, zero);
                        let p = self.b.ins().select(pos, one, zero);
                        self.b.ins().select(neg, neg_one, p)
                    })
                    .collect()
            }
            BuiltinFunc::Floor => (0..n).map(|i| self.b.ins().floor(pick(&vals[0], i))).collect(),
            BuiltinFunc::Ceil => (0..n).map(|i| self.b.ins().ceil(pick(&vals[0], i))).collect(),
            BuiltinFunc::Fract => (0..n)
                .map(|i| {
                    let v = pick(&vals[0], i);
                    let f = self.b.ins().floor(v);
                    self.b.ins().fsub(v, f)
                })
                .collect(),
            BuiltinFunc::Mod => (0..n)
                .map(|i| {
                    let x = pick(&vals[0], i);
                    let y = pick(&vals[1], i);
                    let q = self.b.ins().fdiv(x, y);
                    let f = self.b.ins().floor(q);
                    let prod = self.b.ins().fmul(y, f);
                    self.b.ins().fsub(x, prod)
                })
                .collect(),
            BuiltinFunc::Min => (0..n)
                .map(|i| self.b.ins().fmin(pick(&vals[0], i), pick(&vals[1], i)))
                .collect(),
            BuiltinFunc::Max => (0..n)
                .map(|i| self.b.ins().fmax(pick(&vals[0], i), pick(&vals[1], i)))
                .collect(),
            BuiltinFunc::Clamp => (0..n)
                .map(|i| {
                    let lo = self.b.ins().fmax(pick(&vals[0], i), pick(&vals[1], i));
                    self.b.ins().fmin(lo, pick(&vals[2], i))
                })
                .collect(),
            BuiltinFunc::Mix => (0..n)
                .map(|i| {
                    let a = pick(&vals[0], i);
                    let c = pick(&vals[1], i);
                    let t = pick(&vals[2], i);
                    let d = self.b.ins().fsub(c, a);
                    let scaled = self.b.ins().fmul(d, t);
                    self.b.ins().fadd(a, scaled)
                })
                .collect(),
            BuiltinFunc::Step => {
                let one = self.b.ins().f32const(1.0);
                let zero = self.b.ins().f32const(0.0);
                (0..n)
                    .map(|i| {
                        let edge = pick(&vals[0], i);
                        let v = pick(&vals[1], i);
                        let ge = self.b.ins().fcmp(FloatCC::GreaterThanOrEqual, v, edge);
                        self.b.ins().select(ge, one, zero)
                    })
                    .collect()
            }
            BuiltinFunc::Length => {
                let sum = self.sum_of_squares(&vals[0]);
                vec![self.b.ins().sqrt(sum)]
            }
            BuiltinFunc::Dot => {
                let mut acc: Option<ClValue> = None;
                for (x, y) in vals[0].iter().zip(&vals[1]) {
                    let prod = self.b.ins().fmul(*x, *y);
                    acc = Some(match acc {
                        None => prod,
                        Some(prev) => self.b.ins().fadd(prev, prod),
                    });
                }
                vec![acc.expect("dot of empty vectors")]
            }
            BuiltinFunc::Cross => {
                let (a, c) = (&vals[0], &vals[1]);
                let term = |this: &mut Self, p: ClValue, q: ClValue, r: ClValue, s: ClValue| {
                    let m1 = this.b.ins().fmul(p, q);
                    let m2 = this.b.ins().fmul(r, s);
                    this.b.ins().fsub(m1, m2)
                };
                vec![
                    term(self, a[1], c[2], a[2], c[1]),
                    term(self, a[2], c[0], a[0], c[2]),
                    term(self, a[0], c[1], a[1], c[0]),
                ]
            }
            BuiltinFunc::Normalize => {
                let sum = self.sum_of_squares(&vals[0]);
                let len = self.b.ins().sqrt(sum);
                vals[0].clone().iter().map(|v| self.b.ins().fdiv(*v, len)).collect()
            }
            BuiltinFunc::Reflect => {
                // reflect(i, n) = i - 2*dot(n, i)*n
                let (i, nrm) = (&vals[0], &vals[1]);
                let mut dot: Option<ClValue> = None;
                for (x, y) in i.iter().zip(nrm) {
                    let prod = self.b.ins().fmul(*x, *y);
                    dot = Some(match dot {
                        None => prod,
                        Some(prev) => self.b.ins().fadd(prev, prod),
                    });
                }
                let dot = dot.expect("reflect of zero-lane vectors");
                let two = self.b.ins().f32const(2.0);
                let scale = self.b.ins().fmul(two, dot);
                i.iter()
                    .zip(nrm)
                    .map(|(x, y)| {
                        let p = self.b.ins().fmul(scale, *y);
                        self.b.ins().fsub(*x, p)
                    })
                    .collect()
            }
            BuiltinFunc::Compare => {
                let zero = self.b.ins().f32const(0.0);
                (0..n)
                    .map(|i| {
                        let lt = self.b.ins().fcmp(FloatCC::LessThan, pick(&vals[0], i), zero);
                        self.b.ins().select(lt, pick(&vals[1], i), pick(&vals[2], i))
                    })
                    .collect()
            }
            BuiltinFunc::Premultiply => {
                let v = &vals[0];
                let a = v[3];
                let r = self.b.ins().fmul(v[0], a);
                let g = self.b.ins().fmul(v[1], a);
                let b_ = self.b.ins().fmul(v[2], a);
                vec![r, g, b_, a]
            }
            BuiltinFunc::Unpremultiply => {
                let v = &vals[0];
                let a = v[3];
                let zero = self.b.ins().f32const(0.0);
                let one = self.b.ins().f32const(1.0);
                let nonzero = self.b.ins().fcmp(FloatCC::NotEqual, a, zero);
                let recip = self.b.ins().fdiv(one, a);
                let inv = self.b.ins().select(nonzero, recip, zero);
                let r = self.b.ins().fmul(v[0], inv);
                let g = self.b.ins().fmul(v[1], inv);
                let b_ = self.b.ins().fmul(v[2], inv);
                vec![r, g, b_, a]
            }
            _ => unreachable!("shim-lowered builtin reached the inline path"),
        }
    }

    fn sum_of_squares(&mut self, lanes: &[ClValue]) -> ClValue {
        let mut acc: Option<ClValue> = None;
        for v in lanes {
            let sq = self.b.ins().fmul(*v, *v);
            acc = Some(match acc {
                None => sq,
                Some(prev) => self.b.ins().fadd(prev, sq),
            });
        }
        acc.expect("length of a zero-lane value")
    }
}
