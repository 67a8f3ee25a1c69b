use crate::types::{Param, Type};

/// Index of an instruction in a function's instruction arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// Index of a basic block in a function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Reference to an SSA value: either a function parameter or the result of
/// an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueRef {
    Param(u32),
    Inst(InstId),
}

/// A compile-time constant value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat2([f32; 4]),
    Mat3([f32; 9]),
    Mat4([f32; 16]),
}

impl ConstValue {
    pub fn ty(&self) -> Type {
        match self {
            ConstValue::Float(_) => Type::Float,
            ConstValue::Int(_) => Type::Int,
            ConstValue::Bool(_) => Type::Bool,
            ConstValue::Vec2(_) => Type::Vec2,
            ConstValue::Vec3(_) => Type::Vec3,
            ConstValue::Vec4(_) => Type::Vec4,
            ConstValue::Mat2(_) => Type::Mat2,
            ConstValue::Mat3(_) => Type::Mat3,
            ConstValue::Mat4(_) => Type::Mat4,
        }
    }

    /// Flattened f32 lanes (bools become 0.0/1.0, ints are converted).
    pub fn to_lanes(&self) -> Vec<f32> {
        match self {
            ConstValue::Float(v) => vec![*v],
            ConstValue::Int(v) => vec![*v as f32],
            ConstValue::Bool(v) => vec![if *v { 1.0 } else { 0.0 }],
            ConstValue::Vec2(v) => v.to_vec(),
            ConstValue::Vec3(v) => v.to_vec(),
            ConstValue::Vec4(v) => v.to_vec(),
            ConstValue::Mat2(v) => v.to_vec(),
            ConstValue::Mat3(v) => v.to_vec(),
            ConstValue::Mat4(v) => v.to_vec(),
        }
    }

    /// Rebuild a constant of the given type from flattened lanes.
    pub fn from_lanes(ty: Type, lanes: &[f32]) -> Option<ConstValue> {
        if lanes.len() != ty.lanes() {
            return None;
        }
        Some(match ty {
            Type::Float => ConstValue::Float(lanes[0]),
            Type::Int => ConstValue::Int(lanes[0] as i32),
            Type::Bool => ConstValue::Bool(lanes[0] != 0.0),
            Type::Vec2 => ConstValue::Vec2([lanes[0], lanes[1]]),
            Type::Vec3 => ConstValue::Vec3([lanes[0], lanes[1], lanes[2]]),
            Type::Vec4 => ConstValue::Vec4([lanes[0], lanes[1], lanes[2], lanes[3]]),
            Type::Mat2 => ConstValue::Mat2(lanes.try_into().ok()?),
            Type::Mat3 => ConstValue::Mat3(lanes.try_into().ok()?),
            Type::Mat4 => ConstValue::Mat4(lanes.try_into().ok()?),
            _ => return None,
        })
    }
}

/// Unary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation (componentwise).
    Neg,
    /// Boolean not.
    Not,
}

/// Binary operators.
///
/// Arithmetic operators are componentwise; a scalar operand broadcasts over
/// a vector or matrix operand. `MatMul` is the linear-algebra product
/// (mat*mat, mat*vec or vec*mat, decided by operand types).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    MatMul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Builtin functions understood by the backend.
///
/// These are the entries of the overload table that are not sampler
/// intrinsics; they lower either to machine instructions or to host math
/// shims.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinFunc {
    Radians,
    Degrees,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Pow,
    Exp,
    Log,
    Exp2,
    Log2,
    Sqrt,
    InverseSqrt,
    Abs,
    Sign,
    Floor,
    Ceil,
    Fract,
    Mod,
    Min,
    Max,
    Clamp,
    Mix,
    Step,
    Length,
    Dot,
    Cross,
    Normalize,
    Reflect,
    Compare,
    Premultiply,
    Unpremultiply,
}

/// Instruction payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Const(ConstValue),
    /// Build a vector or matrix from scalar/vector pieces, in lane order.
    Construct { elems: Vec<ValueRef> },
    /// Extract a single f32 lane from a vector or matrix.
    Extract { value: ValueRef, lane: u32 },
    /// Extract a set of lanes from a vector into a new vector.
    Swizzle { value: ValueRef, lanes: Vec<u8> },
    Unary { op: UnaryOp, value: ValueRef },
    Binary { op: BinaryOp, lhs: ValueRef, rhs: ValueRef },
    /// Lane-wise merge of two values under a scalar boolean condition.
    Select { cond: ValueRef, on_true: ValueRef, on_false: ValueRef },
    /// Call to another function in the module.
    Call { callee: String, args: Vec<ValueRef> },
    /// Call to a math builtin.
    Builtin { func: BuiltinFunc, args: Vec<ValueRef> },
    /// `sample(s, coord)` on the sampler bound to parameter `sampler`.
    /// Rewritten away by the linker.
    Sample { sampler: u32, coord: ValueRef },
    /// `samplerTransform(s, coord)`. Rewritten away by the linker.
    SamplerTransform { sampler: u32, coord: ValueRef },
    /// `samplerExtent(s)`. Folded to a constant by the linker.
    SamplerExtent { sampler: u32 },
    /// Destination coordinate of the pixel being computed.
    DestCoord,
    /// Append a value to the reduce sink.
    Emit { value: ValueRef },
    /// Nearest-pixel lookup in a bound image buffer. Introduced by the
    /// linker for buffer-sampler leaves; `buffer` indexes the linked
    /// artifact's buffer table.
    SampleBuffer { buffer: u32, coord: ValueRef },
    /// Read a dynamic parameter from the flat parameter buffer starting at
    /// f32 slot `slot`. Introduced by the linker.
    LoadParam { slot: u32 },
    /// Reserve local storage for one value of the instruction's type; the
    /// result is the storage address.
    Alloca,
    Load { addr: ValueRef },
    Store { addr: ValueRef, value: ValueRef },
    Phi { incoming: Vec<(BlockId, ValueRef)> },
    IntToFloat { value: ValueRef },
    FloatToInt { value: ValueRef },
}

impl Op {
    /// Whether the instruction has an observable effect beyond its result.
    pub fn has_side_effect(&self) -> bool {
        matches!(self, Op::Store { .. } | Op::Emit { .. })
    }

    /// Operand references, for rewriting and liveness walks.
    pub fn operands(&self) -> Vec<ValueRef> {
        match self {
            Op::Const(_) | Op::DestCoord | Op::LoadParam { .. } | Op::Alloca | Op::SamplerExtent { .. } => {
                Vec::new()
            }
            Op::Construct { elems } => elems.clone(),
            Op::Extract { value, .. }
            | Op::Swizzle { value, .. }
            | Op::Unary { value, .. }
            | Op::Emit { value }
            | Op::IntToFloat { value }
            | Op::FloatToInt { value } => vec![*value],
            Op::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Select { cond, on_true, on_false } => vec![*cond, *on_true, *on_false],
            Op::Call { args, .. } | Op::Builtin { args, .. } => args.clone(),
            Op::Sample { coord, .. } | Op::SamplerTransform { coord, .. } | Op::SampleBuffer { coord, .. } => {
                vec![*coord]
            }
            Op::Load { addr } => vec![*addr],
            Op::Store { addr, value } => vec![*addr, *value],
            Op::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
        }
    }

    /// Apply `f` to every operand reference in place.
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueRef) -> ValueRef) {
        match self {
            Op::Const(_) | Op::DestCoord | Op::LoadParam { .. } | Op::Alloca | Op::SamplerExtent { .. } => {}
            Op::Construct { elems } => {
                for e in elems {
                    *e = f(*e);
                }
            }
            Op::Extract { value, .. }
            | Op::Swizzle { value, .. }
            | Op::Unary { value, .. }
            | Op::Emit { value }
            | Op::IntToFloat { value }
            | Op::FloatToInt { value } => *value = f(*value),
            Op::Binary { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Op::Select { cond, on_true, on_false } => {
                *cond = f(*cond);
                *on_true = f(*on_true);
                *on_false = f(*on_false);
            }
            Op::Call { args, .. } | Op::Builtin { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            Op::Sample { coord, .. } | Op::SamplerTransform { coord, .. } | Op::SampleBuffer { coord, .. } => {
                *coord = f(*coord)
            }
            Op::Load { addr } => *addr = f(*addr),
            Op::Store { addr, value } => {
                *addr = f(*addr);
                *value = f(*value);
            }
            Op::Phi { incoming } => {
                for (_, v) in incoming {
                    *v = f(*v);
                }
            }
        }
    }
}

/// An instruction together with its result type (`Void` for stores).
#[derive(Clone, Debug, PartialEq)]
pub struct InstData {
    pub op: Op,
    pub ty: Type,
}

/// Block terminator.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Ret(Option<ValueRef>),
    Br(BlockId),
    CondBr { cond: ValueRef, then_blk: BlockId, else_blk: BlockId },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret(_) => Vec::new(),
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr { then_blk, else_blk, .. } => vec![*then_blk, *else_blk],
        }
    }
}

/// A basic block: an ordered list of instruction ids plus a terminator.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub insts: Vec<InstId>,
    pub term: Option<Terminator>,
}

/// What a function is, from the object model's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Kernel(KernelTarget),
    Helper,
}

/// Whether a kernel produces pixels or emits reduce elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KernelTarget {
    Render,
    Reduce,
}

/// An IR function.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    pub ret_ty: Type,
    pub blocks: Vec<Block>,
    pub insts: Vec<InstData>,
    /// For reduce kernels, the element type passed to `emit`.
    pub reduce_ty: Option<Type>,
}

impl Function {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn inst(&self, id: InstId) -> &InstData {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut InstData {
        &mut self.insts[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Type of a value reference. Note that for `Alloca` results and
    /// by-reference parameters this is the *pointee* type; the IR has no
    /// first-class pointer type.
    pub fn value_type(&self, v: ValueRef) -> Type {
        match v {
            ValueRef::Param(i) => self.params[i as usize].ty,
            ValueRef::Inst(id) => self.inst(id).ty,
        }
    }

    /// Iterate over all instruction ids in block order.
    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> + '_ {
        self.blocks.iter().flat_map(|b| b.insts.iter().copied())
    }
}

/// A collection of functions addressed by name.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    pub fn add_function(&mut self, f: Function) {
        debug_assert!(self.function(&f.name).is_none(), "duplicate function {}", f.name);
        self.functions.push(f);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn remove_function(&mut self, name: &str) -> Option<Function> {
        let idx = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(idx))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Incremental builder for one [`Function`].
///
/// Instructions append to the current block; the entry block exists from the
/// start. Terminating an already-terminated block is ignored, which lets the
/// emitter lower `return` statements followed by dead code without special
/// cases.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, kind: FunctionKind, params: Vec<Param>, ret_ty: Type) -> FunctionBuilder {
        FunctionBuilder {
            func: Function {
                name: name.into(),
                kind,
                params,
                ret_ty,
                blocks: vec![Block { insts: Vec::new(), term: None }],
                insts: Vec::new(),
                reduce_ty: None,
            },
            current: BlockId(0),
        }
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn set_reduce_ty(&mut self, ty: Type) {
        self.func.reduce_ty = Some(ty);
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block { insts: Vec::new(), term: None });
        id
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn is_terminated(&self) -> bool {
        self.func.blocks[self.current.0 as usize].term.is_some()
    }

    /// Append an instruction to the current block and return its result.
    pub fn push(&mut self, op: Op, ty: Type) -> ValueRef {
        let id = InstId(self.func.insts.len() as u32);
        self.func.insts.push(InstData { op, ty });
        self.func.blocks[self.current.0 as usize].insts.push(id);
        ValueRef::Inst(id)
    }

    pub fn terminate(&mut self, term: Terminator) {
        let block = &mut self.func.blocks[self.current.0 as usize];
        if block.term.is_none() {
            block.term = Some(term);
        }
    }

    pub fn const_float(&mut self, v: f32) -> ValueRef {
        self.push(Op::Const(ConstValue::Float(v)), Type::Float)
    }

    pub fn const_int(&mut self, v: i32) -> ValueRef {
        self.push(Op::Const(ConstValue::Int(v)), Type::Int)
    }

    pub fn const_bool(&mut self, v: bool) -> ValueRef {
        self.push(Op::Const(ConstValue::Bool(v)), Type::Bool)
    }

    pub fn const_value(&mut self, v: ConstValue) -> ValueRef {
        let ty = v.ty();
        self.push(Op::Const(v), ty)
    }

    /// Finish the function. Unterminated blocks fall back to a void return;
    /// the emitter diagnoses missing returns before this point.
    pub fn finish(mut self) -> Function {
        for block in &mut self.func.blocks {
            if block.term.is_none() {
                block.term = Some(Terminator::Ret(None));
            }
        }
        self.func
    }
}
