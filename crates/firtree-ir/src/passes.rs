//! IR-level optimisation passes and the verifier.
//!
//! The pipeline is deliberately small: constant folding plus dead-code
//! elimination, run before handing a linked module to the code generator.
//! Heavier scalar optimisation is the backend's job.

use crate::module::{
    BinaryOp, BuiltinFunc, ConstValue, Function, InstId, Module, Op, Terminator, UnaryOp, ValueRef,
};
use crate::types::Type;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("function `{0}`: block {1} has no terminator")]
    Unterminated(String, u32),
    #[error("function `{0}`: reference to out-of-range instruction %{1}")]
    BadInstRef(String, u32),
    #[error("function `{0}`: reference to out-of-range parameter %p{1}")]
    BadParamRef(String, u32),
    #[error("function `{0}`: branch to out-of-range block {1}")]
    BadBlockRef(String, u32),
    #[error("function `{0}`: memory access through non-address value {1:?}")]
    BadAddress(String, ValueRef),
}

/// Structural sanity checks over one function.
pub fn verify(func: &Function) -> Result<(), VerifyError> {
    let check_ref = |v: ValueRef| -> Result<(), VerifyError> {
        match v {
            ValueRef::Param(i) if i as usize >= func.params.len() => {
                Err(VerifyError::BadParamRef(func.name.clone(), i))
            }
            ValueRef::Inst(id) if id.0 as usize >= func.insts.len() => {
                Err(VerifyError::BadInstRef(func.name.clone(), id.0))
            }
            _ => Ok(()),
        }
    };
    let is_address = |v: ValueRef| -> bool {
        match v {
            ValueRef::Param(i) => func.params[i as usize].by_ref(),
            ValueRef::Inst(id) => matches!(func.inst(id).op, Op::Alloca),
        }
    };
    for (bi, block) in func.blocks.iter().enumerate() {
        for id in &block.insts {
            let inst = func.inst(*id);
            for v in inst.op.operands() {
                check_ref(v)?;
            }
            match &inst.op {
                Op::Load { addr } | Op::Store { addr, .. } => {
                    if !is_address(*addr) {
                        return Err(VerifyError::BadAddress(func.name.clone(), *addr));
                    }
                }
                Op::Phi { incoming } => {
                    for (b, _) in incoming {
                        if b.0 as usize >= func.blocks.len() {
                            return Err(VerifyError::BadBlockRef(func.name.clone(), b.0));
                        }
                    }
                }
                _ => {}
            }
        }
        match &block.term {
            None => return Err(VerifyError::Unterminated(func.name.clone(), bi as u32)),
            Some(term) => {
                if let Terminator::CondBr { cond, .. } = term {
                    check_ref(*cond)?;
                }
                if let Terminator::Ret(Some(v)) = term {
                    check_ref(*v)?;
                }
                for succ in term.successors() {
                    if succ.0 as usize >= func.blocks.len() {
                        return Err(VerifyError::BadBlockRef(func.name.clone(), succ.0));
                    }
                }
            }
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Constant folding

fn broadcast2(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    let n = a.len().max(b.len());
    (0..n)
        .map(|i| {
            let x = if a.len() == 1 { a[0] } else { a[i] };
            let y = if b.len() == 1 { b[0] } else { b[i] };
            f(x, y)
        })
        .collect()
}

fn fold_binary(op: BinaryOp, lhs: &ConstValue, rhs: &ConstValue, result_ty: Type) -> Option<ConstValue> {
    // Integer arithmetic stays in the integer domain.
    if let (ConstValue::Int(a), ConstValue::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        return Some(match op {
            BinaryOp::Add => ConstValue::Int(a.wrapping_add(b)),
            BinaryOp::Sub => ConstValue::Int(a.wrapping_sub(b)),
            BinaryOp::Mul => ConstValue::Int(a.wrapping_mul(b)),
            BinaryOp::Div => ConstValue::Int(a.checked_div(b)?),
            BinaryOp::Rem => ConstValue::Int(a.checked_rem(b)?),
            BinaryOp::Eq => ConstValue::Bool(a == b),
            BinaryOp::Ne => ConstValue::Bool(a != b),
            BinaryOp::Lt => ConstValue::Bool(a < b),
            BinaryOp::Le => ConstValue::Bool(a <= b),
            BinaryOp::Gt => ConstValue::Bool(a > b),
            BinaryOp::Ge => ConstValue::Bool(a >= b),
            BinaryOp::MatMul => return None,
        });
    }

    let a = lhs.to_lanes();
    let b = rhs.to_lanes();
    match op {
        BinaryOp::Add => ConstValue::from_lanes(result_ty, &broadcast2(&a, &b, |x, y| x + y)),
        BinaryOp::Sub => ConstValue::from_lanes(result_ty, &broadcast2(&a, &b, |x, y| x - y)),
        BinaryOp::Mul => ConstValue::from_lanes(result_ty, &broadcast2(&a, &b, |x, y| x * y)),
        BinaryOp::Div => ConstValue::from_lanes(result_ty, &broadcast2(&a, &b, |x, y| x / y)),
        BinaryOp::Rem => None,
        BinaryOp::MatMul => fold_matmul(lhs, rhs, result_ty),
        BinaryOp::Eq => Some(ConstValue::Bool(a == b)),
        BinaryOp::Ne => Some(ConstValue::Bool(a != b)),
        BinaryOp::Lt => Some(ConstValue::Bool(a[0] < b[0])),
        BinaryOp::Le => Some(ConstValue::Bool(a[0] <= b[0])),
        BinaryOp::Gt => Some(ConstValue::Bool(a[0] > b[0])),
        BinaryOp::Ge => Some(ConstValue::Bool(a[0] >= b[0])),
    }
}

fn fold_matmul(lhs: &ConstValue, rhs: &ConstValue, result_ty: Type) -> Option<ConstValue> {
    let (lt, rt) = (lhs.ty(), rhs.ty());
    let a = lhs.to_lanes();
    let b = rhs.to_lanes();
    let out = if lt.is_matrix() && rt.is_matrix() {
        let n = lt.dim();
        let mut out = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    out[i * n + j] += a[i * n + k] * b[k * n + j];
                }
            }
        }
        out
    } else if lt.is_matrix() && rt.is_vector() {
        let n = lt.dim();
        (0..n).map(|i| (0..n).map(|j| a[i * n + j] * b[j]).sum()).collect()
    } else if lt.is_vector() && rt.is_matrix() {
        let n = rt.dim();
        (0..n).map(|j| (0..n).map(|i| a[i] * b[i * n + j]).sum()).collect()
    } else {
        return None;
    };
    ConstValue::from_lanes(result_ty, &out)
}

fn map1(v: &ConstValue, result_ty: Type, f: impl Fn(f32) -> f32) -> Option<ConstValue> {
    let lanes: Vec<f32> = v.to_lanes().iter().map(|x| f(*x)).collect();
    ConstValue::from_lanes(result_ty, &lanes)
}

fn fold_builtin(func: BuiltinFunc, args: &[ConstValue], result_ty: Type) -> Option<ConstValue> {
    use BuiltinFunc::*;
    match func {
        Radians => map1(&args[0], result_ty, f32::to_radians),
        Degrees => map1(&args[0], result_ty, f32::to_degrees),
        Sin => map1(&args[0], result_ty, f32::sin),
        Cos => map1(&args[0], result_ty, f32::cos),
        Tan => map1(&args[0], result_ty, f32::tan),
        Asin => map1(&args[0], result_ty, f32::asin),
        Acos => map1(&args[0], result_ty, f32::acos),
        Atan => map1(&args[0], result_ty, f32::atan),
        Sqrt => map1(&args[0], result_ty, f32::sqrt),
        InverseSqrt => map1(&args[0], result_ty, |x| 1.0 / x.sqrt()),
        Exp => map1(&args[0], result_ty, f32::exp),
        Log => map1(&args[0], result_ty, f32::ln),
        Exp2 => map1(&args[0], result_ty, f32::exp2),
        Log2 => map1(&args[0], result_ty, f32::log2),
        Abs => map1(&args[0], result_ty, f32::abs),
        Sign => map1(&args[0], result_ty, f32::signum),
        Floor => map1(&args[0], result_ty, f32::floor),
        Ceil => map1(&args[0], result_ty, f32::ceil),
        Fract => map1(&args[0], result_ty, |x| x - x.floor()),
        Atan2 => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), f32::atan2);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Pow => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), f32::powf);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Mod => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), |x, y| x - y * (x / y).floor());
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Min => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), f32::min);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Max => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), f32::max);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Step => {
            let lanes = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), |edge, x| {
                if x < edge {
                    0.0
                } else {
                    1.0
                }
            });
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Clamp => {
            let lo = broadcast2(&args[0].to_lanes(), &args[1].to_lanes(), f32::max);
            let lanes = broadcast2(&lo, &args[2].to_lanes(), f32::min);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Mix => {
            let a = args[0].to_lanes();
            let b = args[1].to_lanes();
            let t = args[2].to_lanes();
            let ab = broadcast2(&b, &a, |y, x| y - x);
            let scaled = broadcast2(&ab, &t, |d, t| d * t);
            let lanes = broadcast2(&a, &scaled, |x, d| x + d);
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Compare => {
            let a = args[0].to_lanes();
            let b = args[1].to_lanes();
            let c = args[2].to_lanes();
            let lanes: Vec<f32> = (0..a.len()).map(|i| if a[i] < 0.0 { b[i] } else { c[i] }).collect();
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Length => {
            let sum: f32 = args[0].to_lanes().iter().map(|x| x * x).sum();
            Some(ConstValue::Float(sum.sqrt()))
        }
        Dot => {
            let a = args[0].to_lanes();
            let b = args[1].to_lanes();
            Some(ConstValue::Float(a.iter().zip(&b).map(|(x, y)| x * y).sum()))
        }
        Cross => {
            let a = args[0].to_lanes();
            let b = args[1].to_lanes();
            Some(ConstValue::Vec3([
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
            ]))
        }
        Normalize => {
            let lanes = args[0].to_lanes();
            let len: f32 = lanes.iter().map(|x| x * x).sum::<f32>().sqrt();
            let lanes: Vec<f32> = lanes.iter().map(|x| x / len).collect();
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Reflect => {
            let i = args[0].to_lanes();
            let n = args[1].to_lanes();
            let d: f32 = i.iter().zip(&n).map(|(x, y)| x * y).sum();
            let lanes: Vec<f32> = i.iter().zip(&n).map(|(x, y)| x - 2.0 * d * y).collect();
            ConstValue::from_lanes(result_ty, &lanes)
        }
        Premultiply => {
            let v = args[0].to_lanes();
            Some(ConstValue::Vec4([v[0] * v[3], v[1] * v[3], v[2] * v[3], v[3]]))
        }
        Unpremultiply => {
            let v = args[0].to_lanes();
            if v[3] == 0.0 {
                Some(ConstValue::Vec4([0.0, 0.0, 0.0, 0.0]))
            } else {
                Some(ConstValue::Vec4([v[0] / v[3], v[1] / v[3], v[2] / v[3], v[3]]))
            }
        }
    }
}

fn try_fold_op(op: &Op, ty: Type, consts: &HashMap<InstId, ConstValue>) -> Option<ConstValue> {
    let resolve = |v: ValueRef| -> Option<ConstValue> {
        match v {
            ValueRef::Inst(id) => consts.get(&id).copied(),
            ValueRef::Param(_) => None,
        }
    };
    match op {
        Op::Unary { op, value } => {
            let c = resolve(*value)?;
            match (op, c) {
                (UnaryOp::Not, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
                (UnaryOp::Neg, ConstValue::Int(i)) => Some(ConstValue::Int(-i)),
                (UnaryOp::Neg, c) => map1(&c, ty, |x| -x),
                _ => None,
            }
        }
        Op::Binary { op, lhs, rhs } => {
            let (a, b) = (resolve(*lhs)?, resolve(*rhs)?);
            fold_binary(*op, &a, &b, ty)
        }
        Op::Builtin { func: bf, args } => {
            let args: Vec<ConstValue> = args.iter().map(|a| resolve(*a)).collect::<Option<_>>()?;
            fold_builtin(*bf, &args, ty)
        }
        Op::Construct { elems } => {
            let mut lanes = Vec::new();
            for e in elems {
                lanes.extend(resolve(*e)?.to_lanes());
            }
            ConstValue::from_lanes(ty, &lanes)
        }
        Op::Extract { value, lane } => {
            let c = resolve(*value)?;
            c.to_lanes().get(*lane as usize).map(|v| ConstValue::Float(*v))
        }
        Op::Swizzle { value, lanes } => {
            let c = resolve(*value)?.to_lanes();
            let picked: Vec<f32> = lanes
                .iter()
                .map(|l| c.get(*l as usize).copied())
                .collect::<Option<_>>()?;
            ConstValue::from_lanes(ty, &picked)
        }
        Op::Select { cond, on_true, on_false } => match resolve(*cond)? {
            ConstValue::Bool(true) => resolve(*on_true),
            ConstValue::Bool(false) => resolve(*on_false),
            _ => None,
        },
        Op::IntToFloat { value } => match resolve(*value)? {
            ConstValue::Int(i) => Some(ConstValue::Float(i as f32)),
            _ => None,
        },
        Op::FloatToInt { value } => match resolve(*value)? {
            ConstValue::Float(v) => Some(ConstValue::Int(v as i32)),
            _ => None,
        },
        _ => None,
    }
}

/// Fold instructions whose operands are all constants. Returns the number of
/// instructions replaced.
pub fn fold_constants(func: &mut Function) -> usize {
    let mut consts: HashMap<InstId, ConstValue> = HashMap::new();
    // Seed with existing constants.
    for id in func.inst_ids().collect::<Vec<_>>() {
        if let Op::Const(c) = &func.inst(id).op {
            consts.insert(id, *c);
        }
    }

    let mut folded = 0;
    for id in func.inst_ids().collect::<Vec<_>>() {
        if consts.contains_key(&id) {
            continue;
        }
        let inst = func.inst(id);
        if let Some(c) = try_fold_op(&inst.op, inst.ty, &consts) {
            func.inst_mut(id).op = Op::Const(c);
            consts.insert(id, c);
            folded += 1;
        }
    }
    folded
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Dead code elimination

/// Remove instructions whose results are unused and which have no side
/// effects, plus stores to local slots that are never read. Returns the
/// number of instructions removed.
pub fn eliminate_dead_code(func: &mut Function) -> usize {
    // Local slots that escape (passed by reference) or are loaded from must
    // keep their stores.
    let mut read_slots: HashSet<InstId> = HashSet::new();
    for id in func.inst_ids() {
        match &func.inst(id).op {
            Op::Load { addr: ValueRef::Inst(slot) } => {
                read_slots.insert(*slot);
            }
            Op::Call { args, .. } => {
                for a in args {
                    if let ValueRef::Inst(slot) = a {
                        if matches!(func.inst(*slot).op, Op::Alloca) {
                            read_slots.insert(*slot);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut live: HashSet<InstId> = HashSet::new();
    let mut work: Vec<ValueRef> = Vec::new();
    for block in &func.blocks {
        for id in &block.insts {
            let inst = func.inst(*id);
            let keep = match &inst.op {
                Op::Store { addr: ValueRef::Inst(slot), .. } => read_slots.contains(slot),
                Op::Store { .. } => true,
                op => op.has_side_effect(),
            };
            if keep {
                live.insert(*id);
                work.extend(inst.op.operands());
            }
        }
        match block.term.as_ref() {
            Some(Terminator::Ret(Some(v))) => work.push(*v),
            Some(Terminator::CondBr { cond, .. }) => work.push(*cond),
            _ => {}
        }
    }
    while let Some(v) = work.pop() {
        if let ValueRef::Inst(id) = v {
            if live.insert(id) {
                work.extend(func.inst(id).op.operands());
            }
        }
    }

    let mut removed = 0;
    for block in &mut func.blocks {
        let before = block.insts.len();
        block.insts.retain(|id| live.contains(id));
        removed += before - block.insts.len();
    }
    removed
}

/// Run the standard pass pipeline over one function.
pub fn optimize_function(func: &mut Function) {
    // Folding can turn select conditions constant, which in turn exposes
    // more dead code; two rounds reach a fixpoint for the IR the front-end
    // and linker produce.
    for _ in 0..2 {
        let folded = fold_constants(func);
        let removed = eliminate_dead_code(func);
        if folded == 0 && removed == 0 {
            break;
        }
    }
}

/// Run the standard pass pipeline over every function of a module.
pub fn optimize_module(module: &mut Module) {
    for func in &mut module.functions {
        optimize_function(func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FunctionBuilder, FunctionKind};

    #[test]
    fn folds_arithmetic() {
        let mut b = FunctionBuilder::new("f", FunctionKind::Helper, vec![], Type::Float);
        let one = b.const_float(1.0);
        let two = b.const_float(2.0);
        let sum = b.push(Op::Binary { op: BinaryOp::Add, lhs: one, rhs: two }, Type::Float);
        b.terminate(Terminator::Ret(Some(sum)));
        let mut f = b.finish();
        assert!(fold_constants(&mut f) > 0);
        let ValueRef::Inst(id) = sum else { unreachable!() };
        assert_eq!(f.inst(id).op, Op::Const(ConstValue::Float(3.0)));
    }

    #[test]
    fn folds_mat_vec_product() {
        // Row-major scale-by-two matrix applied to (3, 5).
        let m = ConstValue::Mat2([2.0, 0.0, 0.0, 2.0]);
        let v = ConstValue::Vec2([3.0, 5.0]);
        let r = fold_matmul(&m, &v, Type::Vec2).unwrap();
        assert_eq!(r, ConstValue::Vec2([6.0, 10.0]));
    }

    #[test]
    fn removes_unused_instructions() {
        let mut b = FunctionBuilder::new("f", FunctionKind::Helper, vec![], Type::Float);
        let unused = b.const_float(4.0);
        let ret = b.const_float(1.0);
        b.terminate(Terminator::Ret(Some(ret)));
        let mut f = b.finish();
        assert_eq!(eliminate_dead_code(&mut f), 1);
        let ValueRef::Inst(id) = unused else { unreachable!() };
        assert!(!f.inst_ids().any(|i| i == id));
    }

    #[test]
    fn keeps_loaded_slot_stores() {
        let mut b = FunctionBuilder::new("f", FunctionKind::Helper, vec![], Type::Float);
        let slot = b.push(Op::Alloca, Type::Float);
        let v = b.const_float(7.0);
        b.push(Op::Store { addr: slot, value: v }, Type::Void);
        let loaded = b.push(Op::Load { addr: slot }, Type::Float);
        b.terminate(Terminator::Ret(Some(loaded)));
        let mut f = b.finish();
        assert_eq!(eliminate_dead_code(&mut f), 0);
        verify(&f).unwrap();
    }

    #[test]
    fn drops_stores_to_unread_slots() {
        let mut b = FunctionBuilder::new("f", FunctionKind::Helper, vec![], Type::Float);
        let slot = b.push(Op::Alloca, Type::Float);
        let v = b.const_float(7.0);
        b.push(Op::Store { addr: slot, value: v }, Type::Void);
        let ret = b.const_float(0.0);
        b.terminate(Terminator::Ret(Some(ret)));
        let mut f = b.finish();
        assert!(eliminate_dead_code(&mut f) >= 2);
        let ValueRef::Inst(id) = slot else { unreachable!() };
        assert!(!f.inst_ids().any(|i| i == id));
    }

    #[test]
    fn folds_builtin_mix() {
        let a = ConstValue::Vec4([1.0, 0.0, 0.0, 1.0]);
        let b = ConstValue::Vec4([0.0, 1.0, 0.0, 1.0]);
        let t = ConstValue::Float(0.5);
        let r = fold_builtin(BuiltinFunc::Mix, &[a, b, t], Type::Vec4).unwrap();
        assert_eq!(r, ConstValue::Vec4([0.5, 0.5, 0.0, 1.0]));
    }

    #[test]
    fn folds_builtin_reflect() {
        // Reflecting (1, -1) off the y-up plane normal flips y.
        let i = ConstValue::Vec2([1.0, -1.0]);
        let n = ConstValue::Vec2([0.0, 1.0]);
        let r = fold_builtin(BuiltinFunc::Reflect, &[i, n], Type::Vec2).unwrap();
        assert_eq!(r, ConstValue::Vec2([1.0, 1.0]));
    }
}
