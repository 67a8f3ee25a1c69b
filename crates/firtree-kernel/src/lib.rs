//! Kernel-language compiler front-end.
//!
//! Parses kernel source into an AST, type-checks it against the builtin
//! overload table and lowers it to typed SSA IR. The result is a
//! [`CompiledKernel`]: an IR module plus one descriptor per kernel function,
//! immutable once built. Errors never abort compilation with a `Result`;
//! they accumulate in the [`CompileLog`] and flip the compile status.

use firtree_ir::{KernelTarget, Module, Type};
use tracing::debug;

pub mod ast;
pub mod builtins;
mod diag;
mod emit;
mod lexer;
mod parser;

pub use diag::{CompileLog, Diagnostic, DiagnosticKind, Severity};
pub use lexer::LineMap;
pub use parser::parse;

/// Description of one declared kernel parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: Type,
    /// Static parameters (and sampler parameters, which are inherently
    /// link-time) are inlined by the linker and participate in the JIT
    /// cache key.
    pub is_static: bool,
}

/// Descriptor of one kernel function in a compiled module.
#[derive(Clone, Debug)]
pub struct KernelFunction {
    /// Source-level kernel name; also the IR function name.
    pub name: String,
    pub target: KernelTarget,
    pub return_type: Type,
    pub parameters: Vec<ParamSpec>,
    /// For reduce kernels, the element type its `emit` calls produce.
    pub reduce_type: Option<Type>,
}

/// The product of compiling one or more source fragments.
///
/// Owns the IR module and the kernel descriptors; immutable after build.
#[derive(Debug)]
pub struct CompiledKernel {
    module: Module,
    kernels: Vec<KernelFunction>,
    log: CompileLog,
    status: bool,
}

impl CompiledKernel {
    /// Compile source fragments, concatenated verbatim (callers are
    /// responsible for newlines between fragments).
    pub fn compile_fragments(fragments: &[&str]) -> CompiledKernel {
        Self::compile_named(&fragments.concat(), "<kernel>")
    }

    /// Compile a single source string.
    pub fn compile(source: &str) -> CompiledKernel {
        Self::compile_named(source, "<kernel>")
    }

    /// Compile with an explicit file name for diagnostics.
    pub fn compile_named(source: &str, file: &str) -> CompiledKernel {
        let mut log = CompileLog::new(file);
        let program = parser::parse(source, &mut log);
        let (module, kernels) = emit::emit_program(&program, source, &mut log);
        let status = !log.has_errors() && !kernels.is_empty();
        if !status {
            debug!(errors = log.error_count(), "kernel compilation failed");
        }
        CompiledKernel { module, kernels, log, status }
    }

    /// Whether the last compilation succeeded and produced at least one
    /// kernel function.
    pub fn compile_status(&self) -> bool {
        self.status
    }

    pub fn compile_log(&self) -> &CompileLog {
        &self.log
    }

    pub fn kernels(&self) -> &[KernelFunction] {
        &self.kernels
    }

    /// Look up a kernel descriptor by name.
    pub fn kernel(&self, name: &str) -> Option<&KernelFunction> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firtree_ir::{Op, ValueRef};

    #[test]
    fn compiles_checker_kernel() {
        let k = CompiledKernel::compile(
            "kernel vec4 checker(static float size, vec4 a, vec4 b) {\n\
             \treturn mix(a, b, step(size, mod(destCoord(), 2.0 * size).x));\n\
             }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let kernel = k.kernel("checker").unwrap();
        assert_eq!(kernel.target, KernelTarget::Render);
        assert_eq!(kernel.return_type, Type::Vec4);
        assert_eq!(kernel.parameters.len(), 3);
        assert!(kernel.parameters[0].is_static);
        assert!(!kernel.parameters[1].is_static);
        assert!(k.module().function("checker").is_some());
    }

    #[test]
    fn sampler_parameters_are_static() {
        let k = CompiledKernel::compile(
            "kernel vec4 tint(sampler src, vec4 c) { return sample(src, destCoord()) * c; }",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let kernel = k.kernel("tint").unwrap();
        assert!(kernel.parameters[0].is_static);
        assert_eq!(kernel.parameters[0].ty, Type::Sampler);

        // The sample call site is tagged with the sampler parameter index.
        let func = k.module().function("tint").unwrap();
        let sample_count = func
            .inst_ids()
            .filter(|id| matches!(func.inst(*id).op, Op::Sample { sampler: 0, .. }))
            .count();
        assert_eq!(sample_count, 1);
    }

    #[test]
    fn reduce_kernel_infers_emit_type() {
        let k = CompiledKernel::compile(
            "kernel void grid() {\n\
             \temit(destCoord());\n\
             }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let kernel = k.kernel("grid").unwrap();
        assert_eq!(kernel.target, KernelTarget::Reduce);
        assert_eq!(kernel.reduce_type, Some(Type::Vec2));
    }

    #[test]
    fn missing_overload_is_one_diagnostic() {
        // `cross` has no vec4 overload.
        let k = CompiledKernel::compile(
            "kernel vec4 f() { return vec4(cross(vec4(1.0), vec4(2.0)).xyz, 1.0); }",
        );
        assert!(!k.compile_status());
        assert_eq!(k.compile_log().error_count(), 1);
        let line = &k.compile_log().lines()[0];
        assert!(line.contains("cross"), "line = {}", line);
        assert!(line.contains("vec4"), "line = {}", line);
        assert_eq!(k.compile_log().entries()[0].kind, DiagnosticKind::OverloadNotFound);
    }

    #[test]
    fn undeclared_identifier_reported() {
        let k = CompiledKernel::compile("kernel vec4 f() { return missing; }");
        assert!(!k.compile_status());
        assert_eq!(k.compile_log().entries()[0].kind, DiagnosticKind::UndeclaredIdentifier);
    }

    #[test]
    fn bad_kernel_signature_rejected() {
        let k = CompiledKernel::compile("kernel float f() { return 1.0; }");
        assert!(!k.compile_status());
        assert_eq!(k.compile_log().entries()[0].kind, DiagnosticKind::BadKernelSignature);
    }

    #[test]
    fn missing_return_rejected() {
        let k = CompiledKernel::compile(
            "kernel vec4 f(float x) { if (x > 0.0) { return vec4(1.0); } }",
        );
        assert!(!k.compile_status());
        assert!(k
            .compile_log()
            .entries()
            .iter()
            .any(|d| d.kind == DiagnosticKind::MissingReturn));
    }

    #[test]
    fn one_error_does_not_stop_other_kernels() {
        let k = CompiledKernel::compile(
            "kernel vec4 bad() { return missing; }\n\
             kernel vec4 good() { return vec4(1.0); }\n",
        );
        assert!(!k.compile_status());
        assert!(k.kernel("good").is_some());
        assert!(k.kernel("bad").is_none());
    }

    #[test]
    fn swizzle_bounds_checked() {
        let k = CompiledKernel::compile("kernel vec4 f(vec2 v) { return vec4(v.xyz, 1.0); }");
        assert!(!k.compile_status());
        assert_eq!(k.compile_log().entries()[0].kind, DiagnosticKind::InvalidSwizzle);
    }

    #[test]
    fn helper_functions_are_mangled_and_called() {
        let k = CompiledKernel::compile(
            "float square(float x) { return x * x; }\n\
             kernel vec4 f() { return vec4(square(2.0)); }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let func = k.module().function("f").unwrap();
        let called: Vec<String> = func
            .inst_ids()
            .filter_map(|id| match &func.inst(id).op {
                Op::Call { callee, .. } => Some(callee.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(called, vec!["square_f".to_string()]);
        assert!(k.module().function("square_f").is_some());
    }

    #[test]
    fn out_parameters_pass_addresses() {
        let k = CompiledKernel::compile(
            "void split(vec4 v, out vec2 lo, out vec2 hi) { lo = v.xy; hi = v.zw; }\n\
             kernel vec4 f(vec4 v) {\n\
             \tvec2 lo; vec2 hi;\n\
             \tsplit(v, lo, hi);\n\
             \treturn vec4(lo, hi);\n\
             }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
    }

    #[test]
    fn static_local_requires_constant_initialiser() {
        let k = CompiledKernel::compile(
            "kernel vec4 f(float x) { static float k = x; return vec4(k); }",
        );
        assert!(!k.compile_status());
        assert_eq!(
            k.compile_log().entries()[0].kind,
            DiagnosticKind::NonConstStaticInitializer
        );
    }

    #[test]
    fn global_constants_fold() {
        let k = CompiledKernel::compile(
            "const float HALF = 0.5;\n\
             kernel vec4 f() { return vec4(HALF); }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let func = k.module().function("f").unwrap();
        // HALF must appear as a constant, not a load.
        assert!(func.inst_ids().any(|id| matches!(
            func.inst(id).op,
            Op::Const(firtree_ir::ConstValue::Float(v)) if v == 0.5
        )));
    }

    #[test]
    fn control_flow_lowers_to_blocks() {
        let k = CompiledKernel::compile(
            "kernel vec4 f(float x) {\n\
             \tfloat acc = 0.0;\n\
             \tfor (int i = 0; i < 4; ++i) { acc += x; if (acc > 2.0) break; }\n\
             \treturn vec4(acc);\n\
             }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let func = k.module().function("f").unwrap();
        assert!(func.blocks.len() >= 5, "expected loop blocks, got {}", func.blocks.len());
        firtree_ir::verify(func).unwrap();
    }

    #[test]
    fn short_circuit_produces_phi() {
        let k = CompiledKernel::compile(
            "kernel vec4 f(float x) {\n\
             \tbool inside = x > 0.0 && x < 1.0;\n\
             \treturn inside ? vec4(1.0) : vec4(0.0);\n\
             }\n",
        );
        assert!(k.compile_status(), "log: {}", k.compile_log());
        let func = k.module().function("f").unwrap();
        let phis = func
            .inst_ids()
            .filter(|id| matches!(func.inst(*id).op, Op::Phi { .. }))
            .count();
        assert_eq!(phis, 2);
        firtree_ir::verify(func).unwrap();
    }

    #[test]
    fn static_params_referenced_directly() {
        let k = CompiledKernel::compile(
            "kernel vec4 f(static float k, float d) { return vec4(k * d); }",
        );
        assert!(k.compile_status());
        let func = k.module().function("f").unwrap();
        // Static parameter is used as a direct reference, with no alloca copy.
        let static_stores = func
            .inst_ids()
            .filter(|id| matches!(func.inst(*id).op, Op::Store { value: ValueRef::Param(0), .. }))
            .count();
        assert_eq!(static_stores, 0);
        // The dynamic parameter is copied to a local slot.
        let dynamic_stores = func
            .inst_ids()
            .filter(|id| matches!(func.inst(*id).op, Op::Store { value: ValueRef::Param(1), .. }))
            .count();
        assert_eq!(dynamic_stores, 1);
    }
}
