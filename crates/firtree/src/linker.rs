//! Sampler-graph linker.
//!
//! Walks a provider DAG depth-first and splices every reachable kernel into
//! one fresh module. Each provider's kernel function (and its helper
//! functions) is cloned under a unique name, `sample`/`samplerTransform`
//! call sites are rewritten against the bound child — with the child's
//! affine transform materialised as constants — `samplerExtent` folds to a
//! constant, static arguments are substituted as constants, and dynamic
//! arguments become reads from a flat f32 parameter buffer. The result has
//! no sampler intrinsics left and exports a single root function.

use crate::affine::AffineTransform;
use crate::error::LinkError;
use crate::kernel::KernelSampler;
use crate::sampler::{PixelBuffer, Sampler};
use firtree_ir::{
    BinaryOp, ConstValue, Function, FunctionBuilder, FunctionKind, InstData, InstId, Module, Op,
    Terminator, Type, ValueRef,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// One dynamic (non-static, non-sampler) parameter and its f32 offset in
/// the parameter buffer.
pub struct ParamSlot {
    pub provider: KernelSampler,
    pub name: String,
    pub ty: Type,
    pub offset: u32,
}

/// The product of linking one sampler graph.
pub struct LinkedSampler {
    pub module: Module,
    /// Name of the root function: `fn(coord) -> vec4` for render roots.
    pub root: String,
    /// Dynamic parameters, in traversal order.
    pub param_slots: Vec<ParamSlot>,
    /// Total parameter buffer length in f32 lanes.
    pub param_len: u32,
    /// Pixel buffers referenced by `sample_buffer` instructions; kept alive
    /// for as long as code generated from this module can run.
    pub buffers: Vec<Arc<PixelBuffer>>,
    /// Hash over every link-time-specialised input (kernels, static
    /// arguments, transforms, buffers); part of the JIT cache key.
    pub static_hash: u64,
    /// Element type of the root's `emit` calls, for reduce roots.
    pub reduce_type: Option<Type>,
}

/// Link a sampler graph rooted at `root` into a single module.
pub fn link_sampler(root: &Sampler) -> Result<LinkedSampler, LinkError> {
    let mut linker = Linker {
        module: Module::new(),
        slots: Vec::new(),
        buffers: Vec::new(),
        next_slot: 0,
        visiting: Vec::new(),
    };
    // Reduce kernels are only meaningful at the root; `sample` calls need a
    // colour-producing child.
    if let Sampler::Kernel(kernel) = root {
        if kernel.kernel_function().is_none() {
            return Err(LinkError::InvalidKernel);
        }
    }
    let root_name = linker.emit_sampler_root(root)?;
    prune_unreachable(&mut linker.module, &root_name);

    let mut hasher = DefaultHasher::new();
    root.hash_static(&mut hasher);

    let reduce_type = match root {
        Sampler::Kernel(k) => k.kernel_function().and_then(|f| f.reduce_type),
        Sampler::Buffer(_) => None,
    };

    trace!(
        root = %root_name,
        functions = linker.module.functions.len(),
        param_lanes = linker.next_slot,
        "linked sampler graph"
    );
    Ok(LinkedSampler {
        module: linker.module,
        root: root_name,
        param_slots: linker.slots,
        param_len: linker.next_slot,
        buffers: linker.buffers,
        static_hash: hasher.finish(),
        reduce_type,
    })
}

struct Linker {
    module: Module,
    slots: Vec<ParamSlot>,
    buffers: Vec<Arc<PixelBuffer>>,
    next_slot: u32,
    /// Providers on the current DFS path, as a safety net against cycles
    /// that slipped past bind-time checking.
    visiting: Vec<usize>,
}

/// How one kernel parameter is resolved at link time.
enum ParamResolution {
    /// Child sampler: emitted function plus its transform and extent.
    Child { func: String, transform: AffineTransform, extent: [f32; 4] },
    Static(ConstValue),
    Dynamic { slot: u32 },
}

impl Linker {
    fn emit_sampler_root(&mut self, sampler: &Sampler) -> Result<String, LinkError> {
        self.emit_sampler_impl(sampler, true)
    }

    fn emit_sampler(&mut self, sampler: &Sampler) -> Result<String, LinkError> {
        self.emit_sampler_impl(sampler, false)
    }

    fn emit_sampler_impl(&mut self, sampler: &Sampler, is_root: bool) -> Result<String, LinkError> {
        if let Sampler::Kernel(kernel) = sampler {
            // A reduce kernel produces no colour; it cannot be sampled.
            if !is_root && kernel.target() == Some(firtree_ir::KernelTarget::Reduce) {
                return Err(LinkError::InvalidKernel);
            }
        }
        match sampler {
            Sampler::Buffer(buffer) => {
                let name = unique_name("sampler");
                let index = self.buffers.len() as u32;
                self.buffers.push(buffer.buffer());
                let mut b = FunctionBuilder::new(&name, FunctionKind::Helper, Vec::new(), Type::Vec4);
                let coord = b.push(Op::DestCoord, Type::Vec2);
                let colour = b.push(Op::SampleBuffer { buffer: index, coord }, Type::Vec4);
                b.terminate(Terminator::Ret(Some(colour)));
                self.module.add_function(b.finish());
                Ok(name)
            }
            Sampler::Kernel(kernel) => self.emit_kernel_sampler(kernel),
        }
    }

    fn emit_kernel_sampler(&mut self, kernel: &KernelSampler) -> Result<String, LinkError> {
        if self.visiting.contains(&kernel.id()) {
            return Err(LinkError::Cycle);
        }
        self.visiting.push(kernel.id());
        let result = self.emit_kernel_sampler_inner(kernel);
        self.visiting.pop();
        result
    }

    fn emit_kernel_sampler_inner(&mut self, kernel: &KernelSampler) -> Result<String, LinkError> {
        let snapshot = kernel.snapshot().ok_or(LinkError::InvalidKernel)?;
        if !snapshot.compiled.compile_status() {
            return Err(LinkError::InvalidKernel);
        }

        // Every use of a kernel gets its own clone; two occurrences of the
        // same kernel in the DAG may be specialised differently.
        let suffix = Uuid::new_v4().simple().to_string();
        let root_name = format!("sampler_{}", suffix);
        let source = snapshot.compiled.module();
        let mut rename: HashMap<String, String> = HashMap::new();
        for func in &source.functions {
            let new_name = if func.name == snapshot.kernel.name {
                root_name.clone()
            } else if matches!(func.kind, FunctionKind::Kernel(_)) {
                // Sibling kernels in the same module are never called.
                continue;
            } else {
                format!("{}_{}", func.name, suffix)
            };
            rename.insert(func.name.clone(), new_name);
        }

        // Resolve the kernel's parameters, recursing into child samplers.
        let mut resolutions = Vec::with_capacity(snapshot.kernel.parameters.len());
        for (spec, value) in snapshot.kernel.parameters.iter().zip(&snapshot.args) {
            if spec.ty == Type::Sampler {
                let child = value.as_sampler().ok_or_else(|| LinkError::UnboundParameter {
                    kernel: snapshot.kernel.name.clone(),
                    name: spec.name.clone(),
                })?;
                let func = self.emit_sampler(child)?;
                let transform = child.transform();
                // The extent seen from the sampling side: the child's own
                // extent pulled back through its transform.
                let inverse = transform.invert().unwrap_or(AffineTransform::IDENTITY);
                let extent = inverse.apply_extent(child.extent());
                resolutions.push(ParamResolution::Child { func, transform, extent });
            } else if spec.is_static {
                let constant = value.to_const().ok_or_else(|| LinkError::UnboundParameter {
                    kernel: snapshot.kernel.name.clone(),
                    name: spec.name.clone(),
                })?;
                resolutions.push(ParamResolution::Static(constant));
            } else {
                if value.is_null() {
                    return Err(LinkError::UnboundParameter {
                        kernel: snapshot.kernel.name.clone(),
                        name: spec.name.clone(),
                    });
                }
                let slot = self.next_slot;
                self.next_slot += spec.ty.lanes() as u32;
                self.slots.push(ParamSlot {
                    provider: kernel.clone(),
                    name: spec.name.clone(),
                    ty: spec.ty,
                    offset: slot,
                });
                resolutions.push(ParamResolution::Dynamic { slot });
            }
        }

        for func in &source.functions {
            let Some(new_name) = rename.get(&func.name) else { continue };
            let mut clone = func.clone();
            clone.name = new_name.clone();
            // Retarget helper calls at this instance's clones.
            for inst in &mut clone.insts {
                if let Op::Call { callee, .. } = &mut inst.op {
                    if let Some(new_callee) = rename.get(callee) {
                        *callee = new_callee.clone();
                    }
                }
            }
            if func.name == snapshot.kernel.name {
                specialize_kernel(&mut clone, &resolutions);
            }
            self.module.add_function(clone);
        }

        Ok(root_name)
    }
}

fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Substitute parameters and rewrite sampler intrinsics in a cloned kernel
/// function. Afterwards the function takes no declared parameters; its only
/// inputs are the destination coordinate and the parameter buffer.
fn specialize_kernel(func: &mut Function, resolutions: &[ParamResolution]) {
    // Parameter substitution: constants for static arguments, parameter
    // buffer reads for dynamic ones, placed ahead of the entry block.
    let mut param_map: HashMap<u32, ValueRef> = HashMap::new();
    let mut prefix: Vec<InstId> = Vec::new();
    for (i, resolution) in resolutions.iter().enumerate() {
        let replacement = match resolution {
            ParamResolution::Child { .. } => continue,
            ParamResolution::Static(constant) => {
                push_inst(func, &mut prefix, Op::Const(*constant), constant.ty())
            }
            ParamResolution::Dynamic { slot } => {
                let ty = func.params[i].ty;
                push_inst(func, &mut prefix, Op::LoadParam { slot: *slot }, ty)
            }
        };
        param_map.insert(i as u32, replacement);
    }
    func.blocks[0].insts.splice(0..0, prefix);

    let remap = |v: ValueRef| match v {
        ValueRef::Param(i) => param_map.get(&i).copied().unwrap_or(v),
        other => other,
    };
    for inst in &mut func.insts {
        inst.op.map_operands(remap);
    }
    for block in &mut func.blocks {
        match &mut block.term {
            Some(Terminator::Ret(Some(v))) => *v = remap(*v),
            Some(Terminator::CondBr { cond, .. }) => *cond = remap(*cond),
            _ => {}
        }
    }
    func.params.clear();

    // Intrinsic rewriting. Helper instructions are inserted ahead of each
    // call site; the intrinsic instruction itself is replaced in place so
    // existing references to its result stay valid.
    for block_index in 0..func.blocks.len() {
        let old = std::mem::take(&mut func.blocks[block_index].insts);
        let mut insts = Vec::with_capacity(old.len());
        for id in old {
            let op = func.inst(id).op.clone();
            match op {
                Op::Sample { sampler, coord } => {
                    let ParamResolution::Child { func: callee, transform, .. } = &resolutions[sampler as usize]
                    else {
                        unreachable!("sample of a non-sampler parameter");
                    };
                    let callee = callee.clone();
                    let coord = if transform.is_identity() {
                        coord
                    } else {
                        let (x, y) = apply_transform(func, &mut insts, *transform, coord);
                        push_inst(func, &mut insts, Op::Construct { elems: vec![x, y] }, Type::Vec2)
                    };
                    func.inst_mut(id).op = Op::Call { callee, args: vec![coord] };
                    insts.push(id);
                }
                Op::SamplerTransform { sampler, coord } => {
                    let ParamResolution::Child { transform, .. } = &resolutions[sampler as usize] else {
                        unreachable!("samplerTransform of a non-sampler parameter");
                    };
                    if transform.is_identity() {
                        func.inst_mut(id).op = Op::Swizzle { value: coord, lanes: vec![0, 1] };
                    } else {
                        let (x, y) = apply_transform(func, &mut insts, *transform, coord);
                        func.inst_mut(id).op = Op::Construct { elems: vec![x, y] };
                    }
                    insts.push(id);
                }
                Op::SamplerExtent { sampler } => {
                    let ParamResolution::Child { extent, .. } = &resolutions[sampler as usize] else {
                        unreachable!("samplerExtent of a non-sampler parameter");
                    };
                    func.inst_mut(id).op = Op::Const(ConstValue::Vec4(*extent));
                    insts.push(id);
                }
                _ => insts.push(id),
            }
        }
        func.blocks[block_index].insts = insts;
    }
}

/// Append a new instruction to the arena and to `list`.
fn push_inst(func: &mut Function, list: &mut Vec<InstId>, op: Op, ty: Type) -> ValueRef {
    let id = InstId(func.insts.len() as u32);
    func.insts.push(InstData { op, ty });
    list.push(id);
    ValueRef::Inst(id)
}

/// Emit `transform` applied to the vec2 `coord`, returning the transformed
/// x and y components.
fn apply_transform(
    func: &mut Function,
    list: &mut Vec<InstId>,
    t: AffineTransform,
    coord: ValueRef,
) -> (ValueRef, ValueRef) {
    let x = push_inst(func, list, Op::Extract { value: coord, lane: 0 }, Type::Float);
    let y = push_inst(func, list, Op::Extract { value: coord, lane: 1 }, Type::Float);
    let mut axis = |m_x: f32, m_y: f32, t_c: f32| {
        let mx = push_inst(func, list, Op::Const(ConstValue::Float(m_x)), Type::Float);
        let my = push_inst(func, list, Op::Const(ConstValue::Float(m_y)), Type::Float);
        let tc = push_inst(func, list, Op::Const(ConstValue::Float(t_c)), Type::Float);
        let xs = push_inst(func, list, Op::Binary { op: BinaryOp::Mul, lhs: mx, rhs: x }, Type::Float);
        let ys = push_inst(func, list, Op::Binary { op: BinaryOp::Mul, lhs: my, rhs: y }, Type::Float);
        let sum = push_inst(func, list, Op::Binary { op: BinaryOp::Add, lhs: xs, rhs: ys }, Type::Float);
        push_inst(func, list, Op::Binary { op: BinaryOp::Add, lhs: sum, rhs: tc }, Type::Float)
    };
    let tx = axis(t.m11, t.m12, t.tx);
    let ty = axis(t.m21, t.m22, t.ty);
    (tx, ty)
}

/// Drop functions not reachable from the root through calls; everything
/// else is internal detail the optimiser would discard anyway.
fn prune_unreachable(module: &mut Module, root: &str) {
    let mut reachable: HashSet<String> = HashSet::new();
    let mut work = vec![root.to_string()];
    while let Some(name) = work.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        if let Some(func) = module.function(&name) {
            for id in func.inst_ids() {
                if let Op::Call { callee, .. } = &func.inst(id).op {
                    if !reachable.contains(callee) {
                        work.push(callee.clone());
                    }
                }
            }
        }
    }
    module.functions.retain(|f| reachable.contains(&f.name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BufferFormat;
    use crate::sampler::BufferSampler;
    use glam::Vec4;

    fn provider(source: &str) -> KernelSampler {
        let k = KernelSampler::new();
        assert!(k.compile_from_source(source, None), "compile failed");
        k
    }

    fn white_buffer(w: u32, h: u32) -> BufferSampler {
        let data = vec![0xffu8; (w * h * 4) as usize];
        BufferSampler::new(PixelBuffer::new(data, w, h, w * 4, BufferFormat::Rgba32).unwrap())
    }

    #[test]
    fn linked_module_has_no_intrinsics() {
        let tint = provider("kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }");
        tint.set_value("c", Vec4::splat(0.5)).unwrap();
        tint.set_sampler("s", white_buffer(2, 2)).unwrap();
        let linked = link_sampler(&Sampler::Kernel(tint)).unwrap();
        for func in &linked.module.functions {
            for id in func.inst_ids() {
                assert!(
                    !matches!(
                        func.inst(id).op,
                        Op::Sample { .. } | Op::SamplerTransform { .. } | Op::SamplerExtent { .. }
                    ),
                    "intrinsic survived linking in {}",
                    func.name
                );
            }
        }
        // One dynamic vec4 parameter.
        assert_eq!(linked.param_slots.len(), 1);
        assert_eq!(linked.param_slots[0].name, "c");
        assert_eq!(linked.param_len, 4);
        assert_eq!(linked.buffers.len(), 1);
    }

    // Static parameters are inlined as constants: no parameter-buffer slot
    // and no load remains for them.
    #[test]
    fn static_parameters_are_specialised() {
        let k = provider("kernel vec4 f(static float k, float d) { return vec4(k * d); }");
        k.set_value("k", 3.0f32).unwrap();
        k.set_value("d", 4.0f32).unwrap();
        let linked = link_sampler(&Sampler::Kernel(k)).unwrap();
        assert_eq!(linked.param_slots.len(), 1);
        assert_eq!(linked.param_slots[0].name, "d");
        let root = linked.module.function(&linked.root).unwrap();
        assert!(root.inst_ids().any(|id| matches!(
            root.inst(id).op,
            Op::Const(ConstValue::Float(v)) if v == 3.0
        )));
        // Exactly one load_param, for `d`.
        let loads: Vec<u32> = root
            .inst_ids()
            .filter_map(|id| match root.inst(id).op {
                Op::LoadParam { slot } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec![0]);
    }

    #[test]
    fn transforms_are_materialised_as_constants() {
        let outer = provider("kernel vec4 f(sampler s) { return sample(s, destCoord()); }");
        let child = white_buffer(8, 8);
        child.set_transform(AffineTransform::from_elements([2.0, 0.0, 0.0, 2.0, 0.0, 0.0]));
        outer.set_sampler("s", child).unwrap();
        let linked = link_sampler(&Sampler::Kernel(outer)).unwrap();
        let root = linked.module.function(&linked.root).unwrap();
        // The scale factor appears as an IR constant feeding the child call.
        assert!(root.inst_ids().any(|id| matches!(
            root.inst(id).op,
            Op::Const(ConstValue::Float(v)) if v == 2.0
        )));
        assert!(root.inst_ids().any(|id| matches!(root.inst(id).op, Op::Call { .. })));
    }

    #[test]
    fn each_use_of_a_kernel_is_cloned() {
        let fill = provider("kernel vec4 fill(static vec4 c) { return c; }");
        fill.set_value("c", Vec4::ONE).unwrap();
        let blend = provider(
            "kernel vec4 blend(sampler a, sampler b) {\n\
             \treturn sample(a, destCoord()) + sample(b, destCoord());\n\
             }\n",
        );
        blend.set_sampler("a", Sampler::Kernel(fill.clone())).unwrap();
        blend.set_sampler("b", Sampler::Kernel(fill.clone())).unwrap();
        let linked = link_sampler(&Sampler::Kernel(blend)).unwrap();
        // Root plus two distinct clones of `fill`.
        assert_eq!(linked.module.functions.len(), 3);
        let root = linked.module.function(&linked.root).unwrap();
        let callees: HashSet<String> = root
            .inst_ids()
            .filter_map(|id| match &root.inst(id).op {
                Op::Call { callee, .. } => Some(callee.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(callees.len(), 2, "each call site must target its own clone");
    }

    #[test]
    fn unbound_parameters_fail_to_link() {
        let tint = provider("kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }");
        tint.set_value("c", Vec4::ONE).unwrap();
        match link_sampler(&Sampler::Kernel(tint)) {
            Err(LinkError::UnboundParameter { name, .. }) => assert_eq!(name, "s"),
            other => panic!("expected UnboundParameter, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn helper_functions_are_linked_and_pruned() {
        let k = provider(
            "float gain(float x) { return x * 2.0; }\n\
             float unused(float x) { return x; }\n\
             kernel vec4 f(float d) { return vec4(gain(d)); }\n",
        );
        k.set_value("d", 1.0f32).unwrap();
        let linked = link_sampler(&Sampler::Kernel(k)).unwrap();
        assert_eq!(linked.module.functions.len(), 2);
        assert!(linked
            .module
            .functions
            .iter()
            .any(|f| f.name.starts_with("gain_f_")));
    }
}
