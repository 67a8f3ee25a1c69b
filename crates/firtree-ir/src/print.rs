//! Textual dump of IR modules, used by the debug API, the CLI `-print=ir`
//! mode and the linker tests.

use crate::module::{
    Block, ConstValue, Function, FunctionKind, KernelTarget, Module, Op, Terminator, ValueRef,
};
use std::fmt;

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Param(i) => write!(f, "%p{}", i),
            ValueRef::Inst(id) => write!(f, "%{}", id.0),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Float(v) => write!(f, "{}", v),
            ConstValue::Int(v) => write!(f, "{}", v),
            ConstValue::Bool(v) => write!(f, "{}", v),
            other => {
                let lanes = other.to_lanes();
                write!(f, "{}(", other.ty())?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", lane)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[ValueRef]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", a)?;
    }
    Ok(())
}

struct OpDisplay<'a>(&'a Op);

impl fmt::Display for OpDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Op::Const(c) => write!(f, "const {}", c),
            Op::Construct { elems } => {
                write!(f, "construct ")?;
                fmt_args(f, elems)
            }
            Op::Extract { value, lane } => write!(f, "extract {} [{}]", value, lane),
            Op::Swizzle { value, lanes } => {
                write!(f, "swizzle {} [", value)?;
                for (i, l) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", l)?;
                }
                write!(f, "]")
            }
            Op::Unary { op, value } => write!(f, "{:?} {}", op, value),
            Op::Binary { op, lhs, rhs } => write!(f, "{:?} {}, {}", op, lhs, rhs),
            Op::Select { cond, on_true, on_false } => {
                write!(f, "select {}, {}, {}", cond, on_true, on_false)
            }
            Op::Call { callee, args } => {
                write!(f, "call @{}(", callee)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            Op::Builtin { func, args } => {
                write!(f, "builtin {:?}(", func)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            Op::Sample { sampler, coord } => write!(f, "sample s{}, {}", sampler, coord),
            Op::SamplerTransform { sampler, coord } => {
                write!(f, "sampler_transform s{}, {}", sampler, coord)
            }
            Op::SamplerExtent { sampler } => write!(f, "sampler_extent s{}", sampler),
            Op::DestCoord => write!(f, "dest_coord"),
            Op::Emit { value } => write!(f, "emit {}", value),
            Op::SampleBuffer { buffer, coord } => write!(f, "sample_buffer b{}, {}", buffer, coord),
            Op::LoadParam { slot } => write!(f, "load_param {}", slot),
            Op::Alloca => write!(f, "alloca"),
            Op::Load { addr } => write!(f, "load {}", addr),
            Op::Store { addr, value } => write!(f, "store {}, {}", addr, value),
            Op::Phi { incoming } => {
                write!(f, "phi ")?;
                for (i, (block, v)) in incoming.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[block{}: {}]", block.0, v)?;
                }
                Ok(())
            }
            Op::IntToFloat { value } => write!(f, "int_to_float {}", value),
            Op::FloatToInt { value } => write!(f, "float_to_int {}", value),
        }
    }
}

fn fmt_block(f: &mut fmt::Formatter<'_>, func: &Function, index: usize, block: &Block) -> fmt::Result {
    writeln!(f, "block{}:", index)?;
    for id in &block.insts {
        let inst = func.inst(*id);
        if inst.ty == crate::Type::Void {
            writeln!(f, "  {}", OpDisplay(&inst.op))?;
        } else {
            writeln!(f, "  %{}: {} = {}", id.0, inst.ty, OpDisplay(&inst.op))?;
        }
    }
    match block.term.as_ref() {
        Some(Terminator::Ret(None)) => writeln!(f, "  ret"),
        Some(Terminator::Ret(Some(v))) => writeln!(f, "  ret {}", v),
        Some(Terminator::Br(b)) => writeln!(f, "  br block{}", b.0),
        Some(Terminator::CondBr { cond, then_blk, else_blk }) => {
            writeln!(f, "  cond_br {}, block{}, block{}", cond, then_blk.0, else_blk.0)
        }
        None => writeln!(f, "  <unterminated>"),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FunctionKind::Kernel(KernelTarget::Render) => " kernel(render)",
            FunctionKind::Kernel(KernelTarget::Reduce) => " kernel(reduce)",
            FunctionKind::Helper => "",
        };
        write!(f, "fn @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if p.is_static {
                write!(f, "static ")?;
            }
            if p.by_ref() {
                write!(f, "ref ")?;
            }
            write!(f, "{} %p{}", p.ty, i)?;
        }
        writeln!(f, ") -> {}{} {{", self.ret_ty, kind)?;
        for (i, block) in self.blocks.iter().enumerate() {
            fmt_block(f, self, i, block)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
