//! Type checking and IR emission.
//!
//! Walks the AST, annotates every expression with its resolved type, and
//! lowers each function into one [`firtree_ir::Function`]. An error
//! terminates emission for the enclosing function only; the remaining
//! functions still compile so the log can accumulate several diagnostics.

use crate::ast::{self, BinOp, Decl, Expr, ExprKind, IncDec, Stmt, UnOp};
use crate::builtins::{self, BuiltinKind, Coercion, Intrinsic, Resolution};
use crate::diag::{CompileLog, DiagnosticKind};
use crate::lexer::LineMap;
use crate::{KernelFunction, ParamSpec};
use firtree_ir::{
    BinaryOp, BlockId, ConstValue, FunctionBuilder, FunctionKind, KernelTarget, Module, Op, Param,
    ParamDirection, Terminator, Type, UnaryOp, ValueRef,
};
use std::collections::HashMap;
use tracing::debug;

type Span = ast::Span;

/// Emit a whole program into a module, returning the kernel descriptors.
pub fn emit_program(program: &ast::Program, source: &str, log: &mut CompileLog) -> (Module, Vec<KernelFunction>) {
    let line_map = LineMap::new(source);
    let mut module = Module::new();
    let mut kernels = Vec::new();

    // File-scope constants.
    let mut globals: HashMap<String, ConstValue> = HashMap::new();
    for decl in &program.decls {
        if let Decl::GlobalConst(g) = decl {
            let (line, column) = line_map.line_col(g.span.start);
            if globals.contains_key(&g.name) {
                log.error(
                    DiagnosticKind::DuplicateDefinition,
                    line,
                    column,
                    format!("redefinition of constant `{}`", g.name),
                );
                continue;
            }
            match const_eval_with(&g.init, &|name| globals.get(name).copied()) {
                Some(value) => match convert_const(value, g.ty) {
                    Some(value) => {
                        globals.insert(g.name.clone(), value);
                    }
                    None => log.error(
                        DiagnosticKind::TypeMismatch,
                        line,
                        column,
                        format!("initialiser of `{}` is not convertible to {}", g.name, g.ty),
                    ),
                },
                None => log.error(
                    DiagnosticKind::NonConstStaticInitializer,
                    line,
                    column,
                    format!("initialiser of `{}` is not a compile-time constant", g.name),
                ),
            }
        }
    }

    // Collect user function signatures for call resolution.
    let mut funcs: Vec<UserFunc> = Vec::new();
    for (index, decl) in program.decls.iter().enumerate() {
        let Decl::Function(f) = decl else { continue };
        let (line, column) = line_map.line_col(f.span.start);
        if builtins::BUILTINS.iter().any(|b| b.name == f.name) {
            log.error(
                DiagnosticKind::DuplicateDefinition,
                line,
                column,
                format!("`{}` is a builtin function and cannot be redefined", f.name),
            );
            continue;
        }
        let param_tys: Vec<Type> = f.params.iter().map(|p| p.ty).collect();
        let clash = funcs.iter().any(|other| {
            other.name == f.name && other.params.iter().map(|p| p.ty).collect::<Vec<_>>() == param_tys
        });
        if clash || (f.is_kernel && funcs.iter().any(|o| o.is_kernel && o.name == f.name)) {
            log.error(
                DiagnosticKind::DuplicateDefinition,
                line,
                column,
                format!("redefinition of function `{}`", f.name),
            );
            continue;
        }
        let mangled = if f.is_kernel {
            f.name.clone()
        } else {
            mangle(&f.name, &param_tys)
        };
        funcs.push(UserFunc {
            decl_index: index,
            name: f.name.clone(),
            mangled,
            params: f
                .params
                .iter()
                .map(|p| Param {
                    name: p.name.clone(),
                    ty: p.ty,
                    direction: p.direction,
                    is_static: p.is_static,
                })
                .collect(),
            ret: f.ret_ty,
            is_kernel: f.is_kernel,
        });
    }

    for user in &funcs {
        let Decl::Function(decl) = &program.decls[user.decl_index] else { continue };
        let mut emitter = FuncEmitter {
            log: &mut *log,
            line_map: &line_map,
            globals: &globals,
            funcs: &funcs,
            b: None,
            scopes: Vec::new(),
            loops: Vec::new(),
            target: None,
            ret_ty: decl.ret_ty,
            reduce_ty: None,
        };
        if let Some((func, kernel)) = emitter.emit_function(decl, user) {
            debug!(name = %func.name, "emitted kernel function");
            module.add_function(func);
            if let Some(kernel) = kernel {
                kernels.push(kernel);
            }
        }
    }

    (module, kernels)
}

fn mangle(name: &str, params: &[Type]) -> String {
    let mut out = String::from(name);
    for ty in params {
        let code = match ty {
            Type::Void => "z",
            Type::Bool => "b",
            Type::Int => "i",
            Type::Float => "f",
            Type::Vec2 => "v2",
            Type::Vec3 => "v3",
            Type::Vec4 => "v4",
            Type::Mat2 => "m2",
            Type::Mat3 => "m3",
            Type::Mat4 => "m4",
            Type::Sampler => "s",
        };
        out.push('_');
        out.push_str(code);
    }
    out
}

struct UserFunc {
    decl_index: usize,
    name: String,
    mangled: String,
    params: Vec<Param>,
    ret: Type,
    is_kernel: bool,
}

/// What a name resolves to inside a function body.
#[derive(Clone)]
enum Local {
    /// Alloca-backed (or by-reference parameter) storage.
    Slot { addr: ValueRef, ty: Type, is_const: bool },
    /// Static kernel parameter, referenced directly.
    StaticParam { index: u32, ty: Type },
    /// Sampler kernel parameter; only usable as an intrinsic argument.
    SamplerParam { index: u32 },
    /// Compile-time constant.
    Const { value: ConstValue },
}

/// Resolved assignment target.
enum LValue {
    Slot { addr: ValueRef, ty: Type },
    /// A subset of lanes of a stored value (swizzle or constant index).
    Lanes { addr: ValueRef, store_ty: Type, lanes: Vec<u8>, value_ty: Type },
}

#[derive(Copy, Clone)]
struct TV {
    v: ValueRef,
    ty: Type,
}

struct FuncEmitter<'a> {
    log: &'a mut CompileLog,
    line_map: &'a LineMap,
    globals: &'a HashMap<String, ConstValue>,
    funcs: &'a [UserFunc],
    b: Option<FunctionBuilder>,
    scopes: Vec<HashMap<String, Local>>,
    /// `(continue target, break target)` for each enclosing loop.
    loops: Vec<(BlockId, BlockId)>,
    /// `Some` when emitting a kernel body.
    target: Option<KernelTarget>,
    ret_ty: Type,
    reduce_ty: Option<Type>,
}

impl<'a> FuncEmitter<'a> {
    fn b(&mut self) -> &mut FunctionBuilder {
        self.b.as_mut().expect("builder not initialised")
    }

    fn error(&mut self, kind: DiagnosticKind, span: &Span, message: impl Into<String>) {
        let (line, column) = self.line_map.line_col(span.start);
        self.log.error(kind, line, column, message);
    }

    fn lookup(&self, name: &str) -> Option<Local> {
        for scope in self.scopes.iter().rev() {
            if let Some(local) = scope.get(name) {
                return Some(local.clone());
            }
        }
        self.globals.get(name).map(|value| Local::Const { value: *value })
    }

    fn declare(&mut self, name: &str, local: Local, span: &Span) -> Option<()> {
        let scope = self.scopes.last_mut().expect("no scope");
        if scope.contains_key(name) {
            self.error(
                DiagnosticKind::DuplicateDefinition,
                span,
                format!("redefinition of `{}`", name),
            );
            return None;
        }
        self.scopes.last_mut().unwrap().insert(name.to_string(), local);
        Some(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn emit_function(
        &mut self,
        decl: &ast::FunctionDecl,
        user: &UserFunc,
    ) -> Option<(firtree_ir::Function, Option<KernelFunction>)> {
        // Kernel signature checks.
        let kind = if decl.is_kernel {
            let target = match decl.ret_ty {
                Type::Vec4 => KernelTarget::Render,
                Type::Void => KernelTarget::Reduce,
                other => {
                    self.error(
                        DiagnosticKind::BadKernelSignature,
                        &decl.span,
                        format!("a kernel must return vec4 (render) or void (reduce), not {}", other),
                    );
                    return None;
                }
            };
            self.target = Some(target);
            FunctionKind::Kernel(target)
        } else {
            FunctionKind::Helper
        };

        for p in &decl.params {
            if decl.is_kernel {
                if p.direction != ParamDirection::In {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        &p.span,
                        format!("kernel parameter `{}` cannot be `out`/`inout`", p.name),
                    );
                    return None;
                }
            } else {
                if p.ty == Type::Sampler {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        &p.span,
                        format!("sampler parameter `{}` is only allowed on kernels", p.name),
                    );
                    return None;
                }
                if p.is_static {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        &p.span,
                        format!("`static` parameter `{}` is only allowed on kernels", p.name),
                    );
                    return None;
                }
            }
            if p.ty == Type::Sampler && p.direction != ParamDirection::In {
                self.error(
                    DiagnosticKind::ParameterQualifierMisuse,
                    &p.span,
                    "sampler parameters cannot be passed by reference",
                );
                return None;
            }
            if p.ty == Type::Void {
                self.error(
                    DiagnosticKind::BadKernelSignature,
                    &p.span,
                    format!("parameter `{}` cannot have type void", p.name),
                );
                return None;
            }
        }

        self.b = Some(FunctionBuilder::new(
            user.mangled.clone(),
            kind,
            user.params.clone(),
            decl.ret_ty,
        ));
        self.scopes.push(HashMap::new());

        // Bind parameters. Plain value parameters are copied into local
        // slots so the body can assign to them; by-reference parameters use
        // the incoming address; static and sampler parameters are
        // referenced directly.
        for (i, p) in decl.params.iter().enumerate() {
            let index = i as u32;
            let local = if p.ty == Type::Sampler {
                Local::SamplerParam { index }
            } else if p.is_static {
                Local::StaticParam { index, ty: p.ty }
            } else if p.direction != ParamDirection::In {
                Local::Slot { addr: ValueRef::Param(index), ty: p.ty, is_const: false }
            } else {
                let addr = self.b().push(Op::Alloca, p.ty);
                self.b().push(
                    Op::Store { addr, value: ValueRef::Param(index) },
                    Type::Void,
                );
                Local::Slot { addr, ty: p.ty, is_const: p.is_const }
            };
            self.declare(&p.name, local, &p.span)?;
        }

        for stmt in &decl.body {
            self.emit_stmt(stmt)?;
        }

        // The end of the body is only a missing return if it is reachable:
        // when every path returned, the builder is parked in a block no
        // branch targets.
        if self.ret_ty != Type::Void && !self.b().is_terminated() {
            let reachable_end = {
                let cur = self.b().current_block();
                let func = self.b().func();
                cur == func.entry()
                    || func.blocks.iter().any(|block| {
                        block
                            .term
                            .as_ref()
                            .is_some_and(|t| t.successors().contains(&cur))
                    })
            };
            if reachable_end {
                self.error(
                    DiagnosticKind::MissingReturn,
                    &decl.span,
                    format!("control reaches the end of `{}` without returning a value", decl.name),
                );
                return None;
            }
        }

        self.scopes.pop();
        let mut func = self.b.take().unwrap();
        if let Some(ty) = self.reduce_ty {
            func.set_reduce_ty(ty);
        }
        let func = func.finish();

        let kernel = decl.is_kernel.then(|| KernelFunction {
            name: decl.name.clone(),
            target: match self.target.unwrap() {
                KernelTarget::Render => KernelTarget::Render,
                KernelTarget::Reduce => KernelTarget::Reduce,
            },
            return_type: decl.ret_ty,
            parameters: decl
                .params
                .iter()
                .map(|p| ParamSpec {
                    name: p.name.clone(),
                    ty: p.ty,
                    is_static: p.is_static || p.ty == Type::Sampler,
                })
                .collect(),
            reduce_type: self.reduce_ty,
        });

        Some((func, kernel))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Statements

    fn emit_stmt(&mut self, stmt: &Stmt) -> Option<()> {
        match stmt {
            Stmt::Empty => Some(()),
            Stmt::Block(stmts) => {
                self.scopes.push(HashMap::new());
                for s in stmts {
                    self.emit_stmt(s)?;
                }
                self.scopes.pop();
                Some(())
            }
            Stmt::Decl(decl) => self.emit_var_decl(decl),
            Stmt::Expr(expr) => {
                self.emit_expr(expr)?;
                Some(())
            }
            Stmt::If { cond, then_branch, else_branch, span } => {
                let cond = self.emit_expr(cond)?;
                if cond.ty != Type::Bool {
                    self.error(DiagnosticKind::TypeMismatch, span, "if condition must be bool");
                    return None;
                }
                let then_blk = self.b().create_block();
                let merge = self.b().create_block();
                let else_blk = if else_branch.is_some() { self.b().create_block() } else { merge };
                self.b().terminate(Terminator::CondBr { cond: cond.v, then_blk, else_blk });

                self.b().switch_to_block(then_blk);
                self.emit_stmt(then_branch)?;
                self.b().terminate(Terminator::Br(merge));

                if let Some(else_branch) = else_branch {
                    self.b().switch_to_block(else_blk);
                    self.emit_stmt(else_branch)?;
                    self.b().terminate(Terminator::Br(merge));
                }

                self.b().switch_to_block(merge);
                Some(())
            }
            Stmt::While { cond, body, span } => {
                let header = self.b().create_block();
                let body_blk = self.b().create_block();
                let exit = self.b().create_block();
                self.b().terminate(Terminator::Br(header));

                self.b().switch_to_block(header);
                let cond = self.emit_expr(cond)?;
                if cond.ty != Type::Bool {
                    self.error(DiagnosticKind::TypeMismatch, span, "while condition must be bool");
                    return None;
                }
                self.b().terminate(Terminator::CondBr { cond: cond.v, then_blk: body_blk, else_blk: exit });

                self.loops.push((header, exit));
                self.b().switch_to_block(body_blk);
                self.emit_stmt(body)?;
                self.b().terminate(Terminator::Br(header));
                self.loops.pop();

                self.b().switch_to_block(exit);
                Some(())
            }
            Stmt::DoWhile { body, cond, span } => {
                let body_blk = self.b().create_block();
                let cond_blk = self.b().create_block();
                let exit = self.b().create_block();
                self.b().terminate(Terminator::Br(body_blk));

                self.loops.push((cond_blk, exit));
                self.b().switch_to_block(body_blk);
                self.emit_stmt(body)?;
                self.b().terminate(Terminator::Br(cond_blk));
                self.loops.pop();

                self.b().switch_to_block(cond_blk);
                let cond = self.emit_expr(cond)?;
                if cond.ty != Type::Bool {
                    self.error(DiagnosticKind::TypeMismatch, span, "do/while condition must be bool");
                    return None;
                }
                self.b().terminate(Terminator::CondBr { cond: cond.v, then_blk: body_blk, else_blk: exit });

                self.b().switch_to_block(exit);
                Some(())
            }
            Stmt::For { init, cond, step, body, span } => {
                self.scopes.push(HashMap::new());
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                }
                let header = self.b().create_block();
                let body_blk = self.b().create_block();
                let step_blk = self.b().create_block();
                let exit = self.b().create_block();
                self.b().terminate(Terminator::Br(header));

                self.b().switch_to_block(header);
                match cond {
                    Some(cond) => {
                        let cond = self.emit_expr(cond)?;
                        if cond.ty != Type::Bool {
                            self.error(DiagnosticKind::TypeMismatch, span, "for condition must be bool");
                            return None;
                        }
                        self.b().terminate(Terminator::CondBr {
                            cond: cond.v,
                            then_blk: body_blk,
                            else_blk: exit,
                        });
                    }
                    None => self.b().terminate(Terminator::Br(body_blk)),
                }

                self.loops.push((step_blk, exit));
                self.b().switch_to_block(body_blk);
                self.emit_stmt(body)?;
                self.b().terminate(Terminator::Br(step_blk));
                self.loops.pop();

                self.b().switch_to_block(step_blk);
                if let Some(step) = step {
                    self.emit_expr(step)?;
                }
                self.b().terminate(Terminator::Br(header));

                self.b().switch_to_block(exit);
                self.scopes.pop();
                Some(())
            }
            Stmt::Return { value, span } => {
                match (value, self.ret_ty) {
                    (None, Type::Void) => self.b().terminate(Terminator::Ret(None)),
                    (None, ty) => {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            span,
                            format!("return without a value in a function returning {}", ty),
                        );
                        return None;
                    }
                    (Some(_), Type::Void) => {
                        self.error(DiagnosticKind::TypeMismatch, span, "void function cannot return a value");
                        return None;
                    }
                    (Some(expr), want) => {
                        let tv = self.emit_expr(expr)?;
                        let tv = self.coerce_value(tv, want, span)?;
                        self.b().terminate(Terminator::Ret(Some(tv.v)));
                    }
                }
                // Anything after a return in the same block is unreachable;
                // emit it into a detached block so references stay valid.
                let rest = self.b().create_block();
                self.b().switch_to_block(rest);
                Some(())
            }
            Stmt::Break(span) => {
                match self.loops.last().copied() {
                    Some((_, exit)) => self.b().terminate(Terminator::Br(exit)),
                    None => {
                        self.error(DiagnosticKind::SyntaxError, span, "`break` outside of a loop");
                        return None;
                    }
                }
                let rest = self.b().create_block();
                self.b().switch_to_block(rest);
                Some(())
            }
            Stmt::Continue(span) => {
                match self.loops.last().copied() {
                    Some((cont, _)) => self.b().terminate(Terminator::Br(cont)),
                    None => {
                        self.error(DiagnosticKind::SyntaxError, span, "`continue` outside of a loop");
                        return None;
                    }
                }
                let rest = self.b().create_block();
                self.b().switch_to_block(rest);
                Some(())
            }
        }
    }

    fn emit_var_decl(&mut self, decl: &ast::VarDecl) -> Option<()> {
        if decl.ty == Type::Void || decl.ty == Type::Sampler {
            self.error(
                DiagnosticKind::TypeMismatch,
                &decl.span,
                format!("cannot declare a local of type {}", decl.ty),
            );
            return None;
        }
        for (name, init, span) in &decl.vars {
            if decl.is_static {
                // Static locals are compile-time constants.
                let Some(init) = init else {
                    self.error(
                        DiagnosticKind::NonConstStaticInitializer,
                        span,
                        format!("static `{}` requires a constant initialiser", name),
                    );
                    return None;
                };
                let lookup = |n: &str| match self.lookup(n) {
                    Some(Local::Const { value }) => Some(value),
                    _ => None,
                };
                let Some(value) = const_eval_with(init, &lookup).and_then(|v| convert_const(v, decl.ty)) else {
                    self.error(
                        DiagnosticKind::NonConstStaticInitializer,
                        span,
                        format!("initialiser of static `{}` is not a compile-time constant", name),
                    );
                    return None;
                };
                self.declare(name, Local::Const { value }, span)?;
                continue;
            }
            let addr = self.b().push(Op::Alloca, decl.ty);
            if let Some(init) = init {
                let tv = self.emit_expr(init)?;
                let tv = self.coerce_value(tv, decl.ty, span)?;
                self.b().push(Op::Store { addr, value: tv.v }, Type::Void);
            }
            self.declare(name, Local::Slot { addr, ty: decl.ty, is_const: decl.is_const }, span)?;
        }
        Some(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Expressions

    fn emit_expr(&mut self, expr: &Expr) -> Option<TV> {
        let span = &expr.span;
        match &expr.kind {
            ExprKind::FloatLit(v) => {
                let v = self.b().const_float(*v);
                Some(TV { v, ty: Type::Float })
            }
            ExprKind::IntLit(v) => {
                let v = self.b().const_int(*v);
                Some(TV { v, ty: Type::Int })
            }
            ExprKind::BoolLit(v) => {
                let v = self.b().const_bool(*v);
                Some(TV { v, ty: Type::Bool })
            }
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(Local::Slot { addr, ty, .. }) => {
                    let v = self.b().push(Op::Load { addr }, ty);
                    Some(TV { v, ty })
                }
                Some(Local::StaticParam { index, ty }) => Some(TV { v: ValueRef::Param(index), ty }),
                Some(Local::Const { value }) => {
                    let ty = value.ty();
                    let v = self.b().const_value(value);
                    Some(TV { v, ty })
                }
                Some(Local::SamplerParam { .. }) => {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        span,
                        format!("sampler `{}` can only be used as an argument of a sampler intrinsic", name),
                    );
                    None
                }
                None => {
                    self.error(
                        DiagnosticKind::UndeclaredIdentifier,
                        span,
                        format!("use of undeclared identifier `{}`", name),
                    );
                    None
                }
            },
            ExprKind::Unary { op, expr: inner } => self.emit_unary(*op, inner, span),
            ExprKind::Postfix { op, expr: inner } => self.emit_incdec(inner, *op, span, true),
            ExprKind::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs, span),
            ExprKind::Ternary { cond, if_true, if_false } => self.emit_ternary(cond, if_true, if_false, span),
            ExprKind::Assign { op, target, value } => self.emit_assign(*op, target, value, span),
            ExprKind::Field { base, field } => {
                let base = self.emit_expr(base)?;
                let lanes = self.swizzle_lanes(field, base.ty, span)?;
                Some(self.emit_lane_read(base, &lanes))
            }
            ExprKind::Index { base, index } => {
                let base_tv = self.emit_expr(base)?;
                let lanes = self.index_lanes(base_tv.ty, index, span)?;
                Some(self.emit_lane_read(base_tv, &lanes))
            }
            ExprKind::Construct { ty, args } => self.emit_construct(*ty, args, span),
            ExprKind::Call { name, args } => self.emit_call(name, args, span),
        }
    }

    fn emit_lane_read(&mut self, base: TV, lanes: &[u8]) -> TV {
        if lanes.len() == 1 {
            let v = self.b().push(Op::Extract { value: base.v, lane: lanes[0] as u32 }, Type::Float);
            TV { v, ty: Type::Float }
        } else {
            let ty = Type::vector(lanes.len()).unwrap();
            let v = self.b().push(Op::Swizzle { value: base.v, lanes: lanes.to_vec() }, ty);
            TV { v, ty }
        }
    }

    fn emit_unary(&mut self, op: UnOp, inner: &Expr, span: &Span) -> Option<TV> {
        match op {
            UnOp::Neg => {
                let tv = self.emit_expr(inner)?;
                if tv.ty == Type::Bool || tv.ty == Type::Sampler || tv.ty == Type::Void {
                    self.error(DiagnosticKind::TypeMismatch, span, format!("cannot negate a {}", tv.ty));
                    return None;
                }
                let v = self.b().push(Op::Unary { op: UnaryOp::Neg, value: tv.v }, tv.ty);
                Some(TV { v, ty: tv.ty })
            }
            UnOp::Not => {
                let tv = self.emit_expr(inner)?;
                if tv.ty != Type::Bool {
                    self.error(DiagnosticKind::TypeMismatch, span, "`!` requires a bool operand");
                    return None;
                }
                let v = self.b().push(Op::Unary { op: UnaryOp::Not, value: tv.v }, Type::Bool);
                Some(TV { v, ty: Type::Bool })
            }
            UnOp::PreInc => self.emit_incdec(inner, IncDec::Inc, span, false),
            UnOp::PreDec => self.emit_incdec(inner, IncDec::Dec, span, false),
        }
    }

    /// `++`/`--`, prefix (`postfix == false`) or postfix.
    fn emit_incdec(&mut self, target: &Expr, op: IncDec, span: &Span, postfix: bool) -> Option<TV> {
        let lv = self.emit_lvalue(target)?;
        let old = self.read_lvalue(&lv);
        let one = match old.ty {
            Type::Int => self.b().const_int(1),
            Type::Float => self.b().const_float(1.0),
            other => {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    span,
                    format!("`++`/`--` require a scalar operand, not {}", other),
                );
                return None;
            }
        };
        let bin_op = match op {
            IncDec::Inc => BinaryOp::Add,
            IncDec::Dec => BinaryOp::Sub,
        };
        let new = self.b().push(Op::Binary { op: bin_op, lhs: old.v, rhs: one }, old.ty);
        let new = TV { v: new, ty: old.ty };
        self.write_lvalue(&lv, new, span)?;
        Some(if postfix { old } else { new })
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: &Span) -> Option<TV> {
        match op {
            BinOp::LogicalAnd | BinOp::LogicalOr => return self.emit_short_circuit(op, lhs, rhs, span),
            _ => {}
        }
        let lhs = self.emit_expr(lhs)?;
        let rhs = self.emit_expr(rhs)?;
        self.apply_binary(op, lhs, rhs, span)
    }

    fn binop_mismatch(&mut self, op: BinOp, a: Type, b: Type, span: &Span) -> Option<TV> {
        self.error(
            DiagnosticKind::TypeMismatch,
            span,
            format!("invalid operands {} and {} to `{:?}`", a, b, op),
        );
        None
    }

    /// Type rules for a non-logical binary operator applied to two values.
    fn apply_binary(&mut self, op: BinOp, mut lhs: TV, mut rhs: TV, span: &Span) -> Option<TV> {
        use Type::*;

        if matches!(lhs.ty, Void | Sampler) || matches!(rhs.ty, Void | Sampler) {
            return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
        }

        // Integer remainder.
        if op == BinOp::Rem {
            if lhs.ty == Int && rhs.ty == Int {
                let v = self.b().push(Op::Binary { op: BinaryOp::Rem, lhs: lhs.v, rhs: rhs.v }, Int);
                return Some(TV { v, ty: Int });
            }
            return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
        }

        if op.is_comparison() {
            let ir_op = comparison_op(op);
            if op == BinOp::Eq || op == BinOp::Ne {
                // Equality works lane-wise over any matching shapes.
                if lhs.ty == Int && rhs.ty == Float {
                    lhs = self.int_to_float(lhs);
                }
                if lhs.ty == Float && rhs.ty == Int {
                    rhs = self.int_to_float(rhs);
                }
                if lhs.ty != rhs.ty {
                    return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
                }
                let v = self.b().push(Op::Binary { op: ir_op, lhs: lhs.v, rhs: rhs.v }, Bool);
                return Some(TV { v, ty: Bool });
            }
            // Ordering comparisons are scalar-only.
            if !lhs.ty.is_scalar() || !rhs.ty.is_scalar() || lhs.ty == Bool || rhs.ty == Bool {
                return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
            }
            if lhs.ty == Int && rhs.ty == Float {
                lhs = self.int_to_float(lhs);
            }
            if lhs.ty == Float && rhs.ty == Int {
                rhs = self.int_to_float(rhs);
            }
            if lhs.ty != rhs.ty {
                return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
            }
            let v = self.b().push(Op::Binary { op: ir_op, lhs: lhs.v, rhs: rhs.v }, Bool);
            return Some(TV { v, ty: Bool });
        }

        let ir_op = match op {
            BinOp::Add => BinaryOp::Add,
            BinOp::Sub => BinaryOp::Sub,
            BinOp::Mul => BinaryOp::Mul,
            BinOp::Div => BinaryOp::Div,
            _ => unreachable!(),
        };

        // Both int: stay in the integer domain.
        if lhs.ty == Int && rhs.ty == Int {
            let v = self.b().push(Op::Binary { op: ir_op, lhs: lhs.v, rhs: rhs.v }, Int);
            return Some(TV { v, ty: Int });
        }
        // An int operand mixed with float/vector/matrix promotes to float.
        if lhs.ty == Int {
            lhs = self.int_to_float(lhs);
        }
        if rhs.ty == Int {
            rhs = self.int_to_float(rhs);
        }
        if lhs.ty == Bool || rhs.ty == Bool {
            return self.binop_mismatch(op, lhs.ty, rhs.ty, span);
        }

        let result = match (lhs.ty, rhs.ty) {
            (a, b) if a == b && !a.is_matrix() => a,
            (Float, b) if b.is_vector() => b,
            (a, Float) if a.is_vector() => a,
            (a, b) if a == b && a.is_matrix() => {
                if op == BinOp::Mul {
                    let v = self.b().push(Op::Binary { op: BinaryOp::MatMul, lhs: lhs.v, rhs: rhs.v }, a);
                    return Some(TV { v, ty: a });
                }
                a
            }
            (a, b) if a.is_matrix() && b.is_vector() && a.dim() == b.dim() && op == BinOp::Mul => {
                let v = self.b().push(Op::Binary { op: BinaryOp::MatMul, lhs: lhs.v, rhs: rhs.v }, b);
                return Some(TV { v, ty: b });
            }
            (a, b) if a.is_vector() && b.is_matrix() && a.dim() == b.dim() && op == BinOp::Mul => {
                let v = self.b().push(Op::Binary { op: BinaryOp::MatMul, lhs: lhs.v, rhs: rhs.v }, a);
                return Some(TV { v, ty: a });
            }
            (a, Float) if a.is_matrix() && matches!(op, BinOp::Mul | BinOp::Div) => a,
            (Float, b) if b.is_matrix() && op == BinOp::Mul => b,
            _ => return self.binop_mismatch(op, lhs.ty, rhs.ty, span),
        };
        let v = self.b().push(Op::Binary { op: ir_op, lhs: lhs.v, rhs: rhs.v }, result);
        Some(TV { v, ty: result })
    }

    fn int_to_float(&mut self, tv: TV) -> TV {
        let v = self.b().push(Op::IntToFloat { value: tv.v }, Type::Float);
        TV { v, ty: Type::Float }
    }

    fn emit_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: &Span) -> Option<TV> {
        let lhs = self.emit_expr(lhs)?;
        if lhs.ty != Type::Bool {
            self.error(DiagnosticKind::TypeMismatch, span, "logical operators require bool operands");
            return None;
        }
        // Short-circuit value when the right-hand side is skipped.
        let skipped = self.b().const_bool(op == BinOp::LogicalOr);
        let lhs_block = self.b().current_block();
        let rhs_block = self.b().create_block();
        let merge = self.b().create_block();
        match op {
            BinOp::LogicalAnd => self.b().terminate(Terminator::CondBr {
                cond: lhs.v,
                then_blk: rhs_block,
                else_blk: merge,
            }),
            BinOp::LogicalOr => self.b().terminate(Terminator::CondBr {
                cond: lhs.v,
                then_blk: merge,
                else_blk: rhs_block,
            }),
            _ => unreachable!(),
        }

        self.b().switch_to_block(rhs_block);
        let rhs = self.emit_expr(rhs)?;
        if rhs.ty != Type::Bool {
            self.error(DiagnosticKind::TypeMismatch, span, "logical operators require bool operands");
            return None;
        }
        let rhs_end = self.b().current_block();
        self.b().terminate(Terminator::Br(merge));

        self.b().switch_to_block(merge);
        let v = self.b().push(
            Op::Phi { incoming: vec![(lhs_block, skipped), (rhs_end, rhs.v)] },
            Type::Bool,
        );
        Some(TV { v, ty: Type::Bool })
    }

    fn emit_ternary(&mut self, cond: &Expr, if_true: &Expr, if_false: &Expr, span: &Span) -> Option<TV> {
        let cond = self.emit_expr(cond)?;
        if cond.ty != Type::Bool {
            self.error(DiagnosticKind::TypeMismatch, span, "`?:` condition must be bool");
            return None;
        }
        let then_blk = self.b().create_block();
        let else_blk = self.b().create_block();
        let merge = self.b().create_block();
        self.b().terminate(Terminator::CondBr { cond: cond.v, then_blk, else_blk });

        self.b().switch_to_block(then_blk);
        let mut t = self.emit_expr(if_true)?;
        let t_end_pending = self.b().current_block();

        self.b().switch_to_block(else_blk);
        let mut e = self.emit_expr(if_false)?;

        // Unify branch types; the conversion has to live in its own branch.
        if t.ty == Type::Int && e.ty == Type::Float {
            let cur = self.b().current_block();
            self.b().switch_to_block(t_end_pending);
            t = self.int_to_float(t);
            self.b().switch_to_block(cur);
        } else if t.ty == Type::Float && e.ty == Type::Int {
            e = self.int_to_float(e);
        }
        if t.ty != e.ty {
            self.error(
                DiagnosticKind::TypeMismatch,
                span,
                format!("`?:` branches have mismatched types {} and {}", t.ty, e.ty),
            );
            return None;
        }
        let e_end = self.b().current_block();
        self.b().terminate(Terminator::Br(merge));
        self.b().switch_to_block(t_end_pending);
        let t_end = self.b().current_block();
        self.b().terminate(Terminator::Br(merge));

        self.b().switch_to_block(merge);
        let v = self.b().push(Op::Phi { incoming: vec![(t_end, t.v), (e_end, e.v)] }, t.ty);
        Some(TV { v, ty: t.ty })
    }

    fn emit_assign(&mut self, op: Option<BinOp>, target: &Expr, value: &Expr, span: &Span) -> Option<TV> {
        let lv = self.emit_lvalue(target)?;
        let rhs = self.emit_expr(value)?;
        let new = match op {
            None => rhs,
            Some(op) => {
                let old = self.read_lvalue(&lv);
                self.apply_binary(op, old, rhs, span)?
            }
        };
        let want = match &lv {
            LValue::Slot { ty, .. } => *ty,
            LValue::Lanes { value_ty, .. } => *value_ty,
        };
        let new = self.coerce_value(new, want, span)?;
        self.write_lvalue(&lv, new, span)?;
        Some(new)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Lvalues

    fn emit_lvalue(&mut self, expr: &Expr) -> Option<LValue> {
        let span = &expr.span;
        match &expr.kind {
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(Local::Slot { addr, ty, is_const }) => {
                    if is_const {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            span,
                            format!("cannot assign to constant `{}`", name),
                        );
                        return None;
                    }
                    Some(LValue::Slot { addr, ty })
                }
                Some(Local::StaticParam { .. }) => {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        span,
                        format!("cannot assign to static parameter `{}`", name),
                    );
                    None
                }
                Some(Local::Const { .. }) => {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        span,
                        format!("cannot assign to constant `{}`", name),
                    );
                    None
                }
                Some(Local::SamplerParam { .. }) => {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        span,
                        format!("cannot assign to sampler `{}`", name),
                    );
                    None
                }
                None => {
                    self.error(
                        DiagnosticKind::UndeclaredIdentifier,
                        span,
                        format!("use of undeclared identifier `{}`", name),
                    );
                    None
                }
            },
            ExprKind::Field { base, field } => {
                let base_lv = self.emit_lvalue(base)?;
                let (addr, store_ty, base_lanes, base_value_ty) = explode_lvalue(base_lv);
                let lanes = self.swizzle_lanes(field, base_value_ty, span)?;
                let mapped: Vec<u8> = lanes.iter().map(|l| base_lanes[*l as usize]).collect();
                let value_ty = if mapped.len() == 1 {
                    Type::Float
                } else {
                    Type::vector(mapped.len()).unwrap()
                };
                Some(LValue::Lanes { addr, store_ty, lanes: mapped, value_ty })
            }
            ExprKind::Index { base, index } => {
                let base_lv = self.emit_lvalue(base)?;
                let (addr, store_ty, base_lanes, base_value_ty) = explode_lvalue(base_lv);
                let lanes = self.index_lanes(base_value_ty, index, span)?;
                let mapped: Vec<u8> = lanes.iter().map(|l| base_lanes[*l as usize]).collect();
                let value_ty = match base_value_ty {
                    ty if ty.is_matrix() => ty.element().unwrap(),
                    _ if mapped.len() == 1 => Type::Float,
                    _ => Type::vector(mapped.len()).unwrap(),
                };
                Some(LValue::Lanes { addr, store_ty, lanes: mapped, value_ty })
            }
            _ => {
                self.error(DiagnosticKind::TypeMismatch, span, "expression is not assignable");
                None
            }
        }
    }

    fn read_lvalue(&mut self, lv: &LValue) -> TV {
        match lv {
            LValue::Slot { addr, ty } => {
                let v = self.b().push(Op::Load { addr: *addr }, *ty);
                TV { v, ty: *ty }
            }
            LValue::Lanes { addr, store_ty, lanes, value_ty } => {
                let full = self.b().push(Op::Load { addr: *addr }, *store_ty);
                if lanes.len() == 1 && value_ty.is_scalar() {
                    let v = self.b().push(Op::Extract { value: full, lane: lanes[0] as u32 }, Type::Float);
                    TV { v, ty: Type::Float }
                } else {
                    let v = self.b().push(Op::Swizzle { value: full, lanes: lanes.clone() }, *value_ty);
                    TV { v, ty: *value_ty }
                }
            }
        }
    }

    fn write_lvalue(&mut self, lv: &LValue, value: TV, span: &Span) -> Option<()> {
        match lv {
            LValue::Slot { addr, .. } => {
                self.b().push(Op::Store { addr: *addr, value: value.v }, Type::Void);
                Some(())
            }
            LValue::Lanes { addr, store_ty, lanes, .. } => {
                let mut seen = [false; 16];
                for l in lanes {
                    if seen[*l as usize] {
                        self.error(
                            DiagnosticKind::InvalidSwizzle,
                            span,
                            "duplicate lane in swizzle assignment",
                        );
                        return None;
                    }
                    seen[*l as usize] = true;
                }
                let old = self.b().push(Op::Load { addr: *addr }, *store_ty);
                let mut elems = Vec::with_capacity(store_ty.lanes());
                for lane in 0..store_ty.lanes() as u8 {
                    if let Some(pos) = lanes.iter().position(|l| *l == lane) {
                        if lanes.len() == 1 {
                            elems.push(value.v);
                        } else {
                            let v = self.b().push(Op::Extract { value: value.v, lane: pos as u32 }, Type::Float);
                            elems.push(v);
                        }
                    } else {
                        let v = self.b().push(Op::Extract { value: old, lane: lane as u32 }, Type::Float);
                        elems.push(v);
                    }
                }
                let rebuilt = self.b().push(Op::Construct { elems }, *store_ty);
                self.b().push(Op::Store { addr: *addr, value: rebuilt }, Type::Void);
                Some(())
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Swizzles, indexing, constructors, calls

    fn swizzle_lanes(&mut self, field: &str, base_ty: Type, span: &Span) -> Option<Vec<u8>> {
        if !base_ty.is_vector() {
            self.error(
                DiagnosticKind::InvalidSwizzle,
                span,
                format!("cannot swizzle a value of type {}", base_ty),
            );
            return None;
        }
        if field.is_empty() || field.len() > 4 {
            self.error(DiagnosticKind::InvalidSwizzle, span, "swizzles select one to four lanes");
            return None;
        }
        const SETS: [&str; 3] = ["xyzw", "rgba", "stpq"];
        let set = SETS.iter().find(|set| field.chars().all(|c| set.contains(c)));
        let Some(set) = set else {
            self.error(
                DiagnosticKind::InvalidSwizzle,
                span,
                format!("invalid swizzle `.{}`", field),
            );
            return None;
        };
        let mut lanes = Vec::with_capacity(field.len());
        for c in field.chars() {
            let lane = set.find(c).unwrap() as u8;
            if lane as usize >= base_ty.lanes() {
                self.error(
                    DiagnosticKind::InvalidSwizzle,
                    span,
                    format!("lane `{}` is out of range for {}", c, base_ty),
                );
                return None;
            }
            lanes.push(lane);
        }
        Some(lanes)
    }

    /// Lanes selected by `base[index]`; `index` must be a compile-time
    /// constant so bounds are checked here.
    fn index_lanes(&mut self, base_ty: Type, index: &Expr, span: &Span) -> Option<Vec<u8>> {
        let lookup = |n: &str| match self.lookup(n) {
            Some(Local::Const { value }) => Some(value),
            _ => None,
        };
        let idx = match const_eval_with(index, &lookup) {
            Some(ConstValue::Int(i)) => i,
            _ => {
                self.error(
                    DiagnosticKind::InvalidSwizzle,
                    span,
                    "indices must be compile-time integer constants",
                );
                return None;
            }
        };
        if base_ty.is_vector() {
            if idx < 0 || idx as usize >= base_ty.lanes() {
                self.error(
                    DiagnosticKind::InvalidSwizzle,
                    span,
                    format!("index {} is out of range for {}", idx, base_ty),
                );
                return None;
            }
            Some(vec![idx as u8])
        } else if base_ty.is_matrix() {
            let n = base_ty.dim();
            if idx < 0 || idx as usize >= n {
                self.error(
                    DiagnosticKind::InvalidSwizzle,
                    span,
                    format!("row {} is out of range for {}", idx, base_ty),
                );
                return None;
            }
            Some((0..n).map(|j| (idx as usize * n + j) as u8).collect())
        } else {
            self.error(
                DiagnosticKind::TypeMismatch,
                span,
                format!("cannot index a value of type {}", base_ty),
            );
            None
        }
    }

    fn emit_construct(&mut self, ty: Type, args: &[Expr], span: &Span) -> Option<TV> {
        // Scalar conversions.
        if ty.is_scalar() {
            if args.len() != 1 {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    span,
                    format!("{}() takes exactly one argument", ty),
                );
                return None;
            }
            let tv = self.emit_expr(&args[0])?;
            return self.emit_scalar_cast(tv, ty, span);
        }
        if ty == Type::Void || ty == Type::Sampler {
            self.error(DiagnosticKind::TypeMismatch, span, format!("cannot construct a {}", ty));
            return None;
        }

        let want = ty.lanes();
        let mut tvs = Vec::with_capacity(args.len());
        for a in args {
            let mut tv = self.emit_expr(a)?;
            if tv.ty == Type::Int {
                tv = self.int_to_float(tv);
            }
            if tv.ty != Type::Float && !tv.ty.is_vector() {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    span,
                    format!("{} is not usable in a {} constructor", tv.ty, ty),
                );
                return None;
            }
            tvs.push(tv);
        }

        // Single-scalar shorthand: splat for vectors, diagonal for matrices.
        if tvs.len() == 1 && tvs[0].ty == Type::Float {
            let s = tvs[0].v;
            let elems = if ty.is_matrix() {
                let n = ty.dim();
                let zero = self.b().const_float(0.0);
                (0..n * n).map(|i| if i % (n + 1) == 0 { s } else { zero }).collect()
            } else {
                vec![s; want]
            };
            let v = self.b().push(Op::Construct { elems }, ty);
            return Some(TV { v, ty });
        }

        let total: usize = tvs.iter().map(|tv| tv.ty.lanes()).sum();
        if total != want {
            self.error(
                DiagnosticKind::TypeMismatch,
                span,
                format!("{} constructor needs {} components, got {}", ty, want, total),
            );
            return None;
        }
        let elems = tvs.iter().map(|tv| tv.v).collect();
        let v = self.b().push(Op::Construct { elems }, ty);
        Some(TV { v, ty })
    }

    fn emit_scalar_cast(&mut self, tv: TV, want: Type, span: &Span) -> Option<TV> {
        let v = match (tv.ty, want) {
            (a, b) if a == b => tv.v,
            (Type::Int, Type::Float) => self.b().push(Op::IntToFloat { value: tv.v }, Type::Float),
            (Type::Float, Type::Int) => self.b().push(Op::FloatToInt { value: tv.v }, Type::Int),
            (Type::Bool, Type::Float) => {
                let one = self.b().const_float(1.0);
                let zero = self.b().const_float(0.0);
                self.b().push(Op::Select { cond: tv.v, on_true: one, on_false: zero }, Type::Float)
            }
            (Type::Bool, Type::Int) => {
                let one = self.b().const_int(1);
                let zero = self.b().const_int(0);
                self.b().push(Op::Select { cond: tv.v, on_true: one, on_false: zero }, Type::Int)
            }
            (Type::Int, Type::Bool) => {
                let zero = self.b().const_int(0);
                self.b().push(Op::Binary { op: BinaryOp::Ne, lhs: tv.v, rhs: zero }, Type::Bool)
            }
            (Type::Float, Type::Bool) => {
                let zero = self.b().const_float(0.0);
                self.b().push(Op::Binary { op: BinaryOp::Ne, lhs: tv.v, rhs: zero }, Type::Bool)
            }
            _ => {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    span,
                    format!("cannot convert {} to {}", tv.ty, want),
                );
                return None;
            }
        };
        Some(TV { v, ty: want })
    }

    /// Coerce `tv` to `want` using the implicit promotion rules
    /// (int→float, scalar→vector broadcast).
    fn coerce_value(&mut self, tv: TV, want: Type, span: &Span) -> Option<TV> {
        if tv.ty == want {
            return Some(tv);
        }
        let tv = if tv.ty == Type::Int && (want == Type::Float || want.is_vector()) {
            self.int_to_float(tv)
        } else {
            tv
        };
        if tv.ty == want {
            return Some(tv);
        }
        if tv.ty == Type::Float && want.is_vector() {
            let elems = vec![tv.v; want.lanes()];
            let v = self.b().push(Op::Construct { elems }, want);
            return Some(TV { v, ty: want });
        }
        self.error(
            DiagnosticKind::TypeMismatch,
            span,
            format!("expected {}, found {}", want, tv.ty),
        );
        None
    }

    fn sampler_arg(&mut self, arg: &Expr) -> Option<u32> {
        if let ExprKind::Ident(name) = &arg.kind {
            if let Some(Local::SamplerParam { index }) = self.lookup(name) {
                return Some(index);
            }
        }
        self.error(
            DiagnosticKind::TypeMismatch,
            &arg.span,
            "argument must be a sampler parameter of the kernel",
        );
        None
    }

    fn emit_call(&mut self, name: &str, args: &[Expr], span: &Span) -> Option<TV> {
        // Builtins are a closed namespace; user functions cannot shadow
        // them, so the table is consulted first.
        if builtins::BUILTINS.iter().any(|b| b.name == name) {
            return self.emit_builtin_call(name, args, span);
        }
        self.emit_user_call(name, args, span)
    }

    fn emit_builtin_call(&mut self, name: &str, args: &[Expr], span: &Span) -> Option<TV> {
        // Intrinsics constrain their sampler arguments syntactically, so
        // they are dispatched on the name before general resolution.
        let sig0 = builtins::BUILTINS.iter().find(|b| b.name == name).unwrap();
        if let BuiltinKind::Intrinsic(intrinsic) = sig0.kind {
            return self.emit_intrinsic_call(intrinsic, name, args, span);
        }

        let mut arg_tvs = Vec::with_capacity(args.len());
        for a in args {
            arg_tvs.push(self.emit_expr(a)?);
        }
        let arg_tys: Vec<Type> = arg_tvs.iter().map(|tv| tv.ty).collect();
        match builtins::resolve(name, &arg_tys) {
            Resolution::Match { sig, coercions } => {
                let mut coerced = Vec::with_capacity(arg_tvs.len());
                for ((tv, c), want) in arg_tvs.into_iter().zip(coercions).zip(&sig.params) {
                    let tv = match c {
                        Coercion::Exact => tv,
                        _ => self.coerce_value(tv, *want, span)?,
                    };
                    coerced.push(tv.v);
                }
                let BuiltinKind::Func(func) = sig.kind else { unreachable!() };
                let v = self.b().push(Op::Builtin { func, args: coerced }, sig.ret);
                Some(TV { v, ty: sig.ret })
            }
            _ => {
                let args = arg_tys.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ");
                self.error(
                    DiagnosticKind::OverloadNotFound,
                    span,
                    format!("no matching overload for call to `{}({})`", name, args),
                );
                None
            }
        }
    }

    fn emit_intrinsic_call(&mut self, intrinsic: Intrinsic, name: &str, args: &[Expr], span: &Span) -> Option<TV> {
        if self.target.is_none() {
            self.error(
                DiagnosticKind::TypeMismatch,
                span,
                format!("`{}` may only be used inside a kernel", name),
            );
            return None;
        }
        match intrinsic {
            Intrinsic::DestCoord => {
                if !args.is_empty() {
                    self.error(DiagnosticKind::OverloadNotFound, span, "destCoord takes no arguments");
                    return None;
                }
                let v = self.b().push(Op::DestCoord, Type::Vec2);
                Some(TV { v, ty: Type::Vec2 })
            }
            Intrinsic::Sample | Intrinsic::SamplerTransform => {
                if args.len() != 2 {
                    self.error(
                        DiagnosticKind::OverloadNotFound,
                        span,
                        format!("`{}` takes a sampler and a vec2", name),
                    );
                    return None;
                }
                let sampler = self.sampler_arg(&args[0])?;
                let coord = self.emit_expr(&args[1])?;
                let coord = self.coerce_value(coord, Type::Vec2, span)?;
                let (op, ty) = if intrinsic == Intrinsic::Sample {
                    (Op::Sample { sampler, coord: coord.v }, Type::Vec4)
                } else {
                    (Op::SamplerTransform { sampler, coord: coord.v }, Type::Vec2)
                };
                let v = self.b().push(op, ty);
                Some(TV { v, ty })
            }
            Intrinsic::SamplerCoord => {
                if args.len() != 1 {
                    self.error(DiagnosticKind::OverloadNotFound, span, "`samplerCoord` takes a sampler");
                    return None;
                }
                let sampler = self.sampler_arg(&args[0])?;
                let coord = self.b().push(Op::DestCoord, Type::Vec2);
                let v = self.b().push(Op::SamplerTransform { sampler, coord }, Type::Vec2);
                Some(TV { v, ty: Type::Vec2 })
            }
            Intrinsic::SamplerExtent | Intrinsic::SamplerOrigin | Intrinsic::SamplerSize => {
                if args.len() != 1 {
                    self.error(
                        DiagnosticKind::OverloadNotFound,
                        span,
                        format!("`{}` takes a sampler", name),
                    );
                    return None;
                }
                let sampler = self.sampler_arg(&args[0])?;
                let extent = self.b().push(Op::SamplerExtent { sampler }, Type::Vec4);
                let (v, ty) = match intrinsic {
                    Intrinsic::SamplerExtent => (extent, Type::Vec4),
                    Intrinsic::SamplerOrigin => {
                        (self.b().push(Op::Swizzle { value: extent, lanes: vec![0, 1] }, Type::Vec2), Type::Vec2)
                    }
                    _ => (self.b().push(Op::Swizzle { value: extent, lanes: vec![2, 3] }, Type::Vec2), Type::Vec2),
                };
                Some(TV { v, ty })
            }
            Intrinsic::Emit => {
                if self.target != Some(KernelTarget::Reduce) {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        span,
                        "`emit` may only be used inside a reduce kernel",
                    );
                    return None;
                }
                if args.len() != 1 {
                    self.error(DiagnosticKind::OverloadNotFound, span, "`emit` takes one value");
                    return None;
                }
                let mut tv = self.emit_expr(&args[0])?;
                if tv.ty == Type::Int {
                    tv = self.int_to_float(tv);
                }
                if !(tv.ty == Type::Float || tv.ty.is_vector()) {
                    self.error(
                        DiagnosticKind::OverloadNotFound,
                        span,
                        format!("no matching overload for call to `emit({})`", tv.ty),
                    );
                    return None;
                }
                match self.reduce_ty {
                    None => self.reduce_ty = Some(tv.ty),
                    Some(prev) if prev != tv.ty => {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            span,
                            format!("emit type {} disagrees with earlier emit of {}", tv.ty, prev),
                        );
                        return None;
                    }
                    Some(_) => {}
                }
                let v = self.b().push(Op::Emit { value: tv.v }, Type::Void);
                Some(TV { v, ty: Type::Void })
            }
        }
    }

    fn emit_user_call(&mut self, name: &str, args: &[Expr], span: &Span) -> Option<TV> {
        let candidates: Vec<&UserFunc> = self.funcs.iter().filter(|f| f.name == name && !f.is_kernel).collect();
        if candidates.is_empty() {
            self.error(
                DiagnosticKind::UndeclaredIdentifier,
                span,
                format!("call to undeclared function `{}`", name),
            );
            return None;
        }

        // Evaluate arguments once. Plain identifiers are typed through the
        // symbol table without emitting anything, so they can still be
        // passed by reference if the chosen overload wants that; everything
        // else is emitted now and the value reused below.
        let mut pre: Vec<Option<TV>> = Vec::with_capacity(args.len());
        let mut arg_tys = Vec::with_capacity(args.len());
        for a in args {
            match &a.kind {
                ExprKind::Ident(name) => {
                    let ty = match self.lookup(name) {
                        Some(Local::Slot { ty, .. }) => ty,
                        Some(Local::StaticParam { ty, .. }) => ty,
                        Some(Local::Const { value }) => value.ty(),
                        Some(Local::SamplerParam { .. }) => Type::Sampler,
                        None => {
                            self.error(
                                DiagnosticKind::UndeclaredIdentifier,
                                &a.span,
                                format!("use of undeclared identifier `{}`", name),
                            );
                            return None;
                        }
                    };
                    pre.push(None);
                    arg_tys.push(ty);
                }
                _ => {
                    let tv = self.emit_expr(a)?;
                    arg_tys.push(tv.ty);
                    pre.push(Some(tv));
                }
            }
        }

        let mut best: Option<(&UserFunc, u32)> = None;
        let mut tied = false;
        for cand in &candidates {
            if cand.params.len() != args.len() {
                continue;
            }
            let mut cost = 0u32;
            let mut ok = true;
            for (param, arg_ty) in cand.params.iter().zip(&arg_tys) {
                if param.by_ref() {
                    // By-reference parameters require an exact lvalue match.
                    if param.ty != *arg_ty {
                        ok = false;
                        break;
                    }
                    continue;
                }
                match builtins::coerce(*arg_ty, param.ty) {
                    Some(Coercion::Exact) => {}
                    Some(Coercion::IntToFloat) => cost += 1,
                    Some(Coercion::Broadcast) => cost += 2,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }
            match &best {
                Some((_, c)) if *c < cost => {}
                Some((_, c)) if *c == cost => tied = true,
                _ => {
                    best = Some((cand, cost));
                    tied = false;
                }
            }
        }
        let Some((callee, _)) = best.filter(|_| !tied) else {
            let args = arg_tys.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ");
            self.error(
                DiagnosticKind::OverloadNotFound,
                span,
                format!("no matching overload for call to `{}({})`", name, args),
            );
            return None;
        };

        let mut values = Vec::with_capacity(args.len());
        for ((param, arg), tv) in callee.params.iter().zip(args).zip(pre) {
            if param.by_ref() {
                if tv.is_some() {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        &arg.span,
                        format!("argument for `out` parameter `{}` must be a whole variable", param.name),
                    );
                    return None;
                }
                let lv = self.emit_lvalue(arg)?;
                let LValue::Slot { addr, .. } = lv else {
                    self.error(
                        DiagnosticKind::ParameterQualifierMisuse,
                        &arg.span,
                        format!("argument for `out` parameter `{}` must be a whole variable", param.name),
                    );
                    return None;
                };
                values.push(addr);
            } else {
                let tv = match tv {
                    Some(tv) => tv,
                    None => self.emit_expr(arg)?,
                };
                let tv = self.coerce_value(tv, param.ty, &arg.span)?;
                values.push(tv.v);
            }
        }
        let v = self.b().push(Op::Call { callee: callee.mangled.clone(), args: values }, callee.ret);
        Some(TV { v, ty: callee.ret })
    }
}

fn explode_lvalue(lv: LValue) -> (ValueRef, Type, Vec<u8>, Type) {
    match lv {
        LValue::Slot { addr, ty } => {
            let lanes: Vec<u8> = (0..ty.lanes() as u8).collect();
            (addr, ty, lanes, ty)
        }
        LValue::Lanes { addr, store_ty, lanes, value_ty } => (addr, store_ty, lanes, value_ty),
    }
}

fn comparison_op(op: BinOp) -> BinaryOp {
    match op {
        BinOp::Eq => BinaryOp::Eq,
        BinOp::Ne => BinaryOp::Ne,
        BinOp::Lt => BinaryOp::Lt,
        BinOp::Le => BinaryOp::Le,
        BinOp::Gt => BinaryOp::Gt,
        BinOp::Ge => BinaryOp::Ge,
        _ => unreachable!(),
    }
}

fn convert_const(value: ConstValue, want: Type) -> Option<ConstValue> {
    if value.ty() == want {
        return Some(value);
    }
    match (value, want) {
        (ConstValue::Int(i), Type::Float) => Some(ConstValue::Float(i as f32)),
        (ConstValue::Float(f), Type::Int) => Some(ConstValue::Int(f as i32)),
        _ => None,
    }
}

/// Small AST-level constant evaluator: literals, named constants, unary
/// minus, scalar arithmetic and constructors with constant components.
pub(crate) fn const_eval_with(expr: &Expr, lookup: &dyn Fn(&str) -> Option<ConstValue>) -> Option<ConstValue> {
    match &expr.kind {
        ExprKind::FloatLit(v) => Some(ConstValue::Float(*v)),
        ExprKind::IntLit(v) => Some(ConstValue::Int(*v)),
        ExprKind::BoolLit(v) => Some(ConstValue::Bool(*v)),
        ExprKind::Ident(name) => lookup(name),
        ExprKind::Unary { op: UnOp::Neg, expr } => match const_eval_with(expr, lookup)? {
            ConstValue::Int(i) => Some(ConstValue::Int(-i)),
            ConstValue::Float(f) => Some(ConstValue::Float(-f)),
            _ => None,
        },
        ExprKind::Binary { op, lhs, rhs } => {
            let a = const_eval_with(lhs, lookup)?;
            let b = const_eval_with(rhs, lookup)?;
            match (a, b) {
                (ConstValue::Int(a), ConstValue::Int(b)) => Some(ConstValue::Int(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => a.checked_div(b)?,
                    BinOp::Rem => a.checked_rem(b)?,
                    _ => return None,
                })),
                (a, b) => {
                    let a = match a {
                        ConstValue::Float(v) => v,
                        ConstValue::Int(v) => v as f32,
                        _ => return None,
                    };
                    let b = match b {
                        ConstValue::Float(v) => v,
                        ConstValue::Int(v) => v as f32,
                        _ => return None,
                    };
                    Some(ConstValue::Float(match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        BinOp::Div => a / b,
                        _ => return None,
                    }))
                }
            }
        }
        ExprKind::Construct { ty, args } if !ty.is_scalar() && *ty != Type::Void && *ty != Type::Sampler => {
            let mut lanes = Vec::new();
            for a in args {
                match const_eval_with(a, lookup)? {
                    ConstValue::Float(v) => lanes.push(v),
                    ConstValue::Int(v) => lanes.push(v as f32),
                    other => lanes.extend(other.to_lanes()),
                }
            }
            if lanes.len() == 1 {
                lanes = vec![lanes[0]; ty.lanes()];
            }
            ConstValue::from_lanes(*ty, &lanes)
        }
        ExprKind::Construct { ty, args } if ty.is_scalar() && args.len() == 1 => {
            let v = const_eval_with(&args[0], lookup)?;
            convert_const(v, *ty)
        }
        _ => None,
    }
}
