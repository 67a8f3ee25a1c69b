//! Kernel samplers: a compiled kernel paired with bound argument values.
//!
//! This is the node type of the sampler DAG the linker traverses. Children
//! (sampler-typed arguments) are owned strong references; change signals
//! propagate from child to parent through weak subscriptions so the graph
//! stays acyclic and leak-free.

use crate::affine::AffineTransform;
use crate::error::BindError;
use crate::sampler::{extent_union, Extent, Sampler, INFINITE_EXTENT};
use crate::signal::{HandlerId, SamplerSignals, Signal};
use crate::value::Value;
use firtree_ir::{KernelTarget, Type};
use firtree_kernel::{CompiledKernel, KernelFunction, ParamSpec};
use parking_lot::{Mutex, MutexGuard};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

struct KernelState {
    compiled: Option<Arc<CompiledKernel>>,
    kernel_index: usize,
    /// One binding per declared parameter; `Value::Null` means unset.
    args: Vec<Value>,
    transform: AffineTransform,
    extent_override: Option<Extent>,
    /// Signal subscriptions on child samplers: (arg index, module handler,
    /// contents handler).
    subscriptions: Vec<(usize, HandlerId, HandlerId)>,
}

pub(crate) struct KernelSamplerInner {
    signals: SamplerSignals,
    argument_changed: Signal,
    state: Mutex<KernelState>,
    version: AtomicU64,
    /// Held for the whole of a render so the cached function pointer cannot
    /// be swapped out under running strips.
    render_lock: Mutex<()>,
}

impl Drop for KernelSamplerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (index, module_handler, contents_handler) in state.subscriptions.drain(..) {
            if let Value::Sampler(child) = &state.args[index] {
                child.signals().module_changed.disconnect(module_handler);
                child.signals().contents_changed.disconnect(contents_handler);
            }
        }
    }
}

/// A sampler that computes its colour by running a kernel. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct KernelSampler {
    inner: Arc<KernelSamplerInner>,
}

/// Immutable view of a provider taken while linking.
pub(crate) struct LinkSnapshot {
    pub compiled: Arc<CompiledKernel>,
    pub kernel: KernelFunction,
    pub args: Vec<Value>,
}

impl KernelSampler {
    pub fn new() -> KernelSampler {
        KernelSampler {
            inner: Arc::new(KernelSamplerInner {
                signals: SamplerSignals::default(),
                argument_changed: Signal::new(),
                state: Mutex::new(KernelState {
                    compiled: None,
                    kernel_index: 0,
                    args: Vec::new(),
                    transform: AffineTransform::IDENTITY,
                    extent_override: None,
                    subscriptions: Vec::new(),
                }),
                version: AtomicU64::new(0),
                render_lock: Mutex::new(()),
            }),
        }
    }

    /// Create a sampler over an already-compiled kernel. Without
    /// `kernel_name`, the first kernel function is used.
    pub fn with_kernel(compiled: Arc<CompiledKernel>, kernel_name: Option<&str>) -> Result<KernelSampler, BindError> {
        let sampler = KernelSampler::new();
        sampler.set_compiled_kernel(compiled, kernel_name)?;
        Ok(sampler)
    }

    /// Compile kernel source and attach the result. Returns the compile
    /// status; diagnostics are available from [`KernelSampler::compiled_kernel`].
    pub fn compile_from_source(&self, source: &str, kernel_name: Option<&str>) -> bool {
        let compiled = Arc::new(CompiledKernel::compile(source));
        if !compiled.compile_status() {
            // Keep the failed kernel for its log, and drop any stale state.
            let mut state = self.inner.state.lock();
            self.disconnect_children(&mut state);
            state.compiled = Some(compiled);
            state.kernel_index = 0;
            state.args = Vec::new();
            drop(state);
            self.bump_module();
            return false;
        }
        match self.set_compiled_kernel(compiled, kernel_name) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to attach compiled kernel");
                false
            }
        }
    }

    pub fn set_compiled_kernel(
        &self,
        compiled: Arc<CompiledKernel>,
        kernel_name: Option<&str>,
    ) -> Result<(), BindError> {
        if !compiled.compile_status() {
            return Err(BindError::NoKernel);
        }
        let kernel_index = match kernel_name {
            None => 0,
            Some(name) => compiled
                .kernels()
                .iter()
                .position(|k| k.name == name)
                .ok_or_else(|| BindError::NoSuchKernel(name.to_string()))?,
        };
        {
            let mut state = self.inner.state.lock();
            self.disconnect_children(&mut state);
            let params = &compiled.kernels()[kernel_index].parameters;
            state.args = params.iter().map(|p| Value::Null(p.ty)).collect();
            state.compiled = Some(compiled);
            state.kernel_index = kernel_index;
        }
        self.bump_module();
        Ok(())
    }

    pub fn compiled_kernel(&self) -> Option<Arc<CompiledKernel>> {
        self.inner.state.lock().compiled.clone()
    }

    /// Descriptor of the selected kernel function.
    pub fn kernel_function(&self) -> Option<KernelFunction> {
        let state = self.inner.state.lock();
        let compiled = state.compiled.as_ref()?;
        if !compiled.compile_status() {
            return None;
        }
        compiled.kernels().get(state.kernel_index).cloned()
    }

    pub fn target(&self) -> Option<KernelTarget> {
        self.kernel_function().map(|k| k.target)
    }

    /// Declared parameters of the selected kernel, in order.
    pub fn list_parameters(&self) -> Vec<ParamSpec> {
        self.kernel_function().map(|k| k.parameters).unwrap_or_default()
    }

    fn param_index(state: &KernelState, name: &str) -> Result<(usize, ParamSpec), BindError> {
        let compiled = state.compiled.as_ref().ok_or(BindError::NoKernel)?;
        let kernel = compiled.kernels().get(state.kernel_index).ok_or(BindError::NoKernel)?;
        kernel
            .parameters
            .iter()
            .position(|p| p.name == name)
            .map(|i| (i, kernel.parameters[i].clone()))
            .ok_or_else(|| BindError::NoSuchParameter(name.to_string()))
    }

    /// Bind a non-sampler argument. The value must match the declared
    /// parameter type exactly; no partial state is left on failure.
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<(), BindError> {
        let value = match value.into() {
            Value::Sampler(child) => return self.set_sampler(name, child),
            other => other,
        };
        let is_static;
        {
            let mut state = self.inner.state.lock();
            let (index, spec) = Self::param_index(&state, name)?;
            if value.ty() != spec.ty {
                return Err(BindError::TypeMismatch {
                    name: name.to_string(),
                    expected: spec.ty,
                    got: value.ty(),
                });
            }
            is_static = spec.is_static;
            state.args[index] = value;
        }
        self.inner.argument_changed.emit();
        if is_static {
            // Static arguments are link-time constants, so the linked
            // module is stale.
            self.bump_module();
        } else {
            self.inner.signals.contents_changed.emit();
        }
        Ok(())
    }

    /// Bind a sampler argument. Rejects binds that would make the graph
    /// cyclic and leaves the provider unchanged in that case.
    pub fn set_sampler(&self, name: &str, child: impl Into<Sampler>) -> Result<(), BindError> {
        let child = child.into();
        if child.contains(self.id()) {
            return Err(BindError::Cycle);
        }
        {
            let mut state = self.inner.state.lock();
            let (index, spec) = Self::param_index(&state, name)?;
            if spec.ty != Type::Sampler {
                return Err(BindError::TypeMismatch {
                    name: name.to_string(),
                    expected: spec.ty,
                    got: Type::Sampler,
                });
            }
            self.disconnect_child(&mut state, index);
            self.connect_child(&mut state, index, &child);
            state.args[index] = Value::Sampler(child);
        }
        self.inner.argument_changed.emit();
        self.bump_module();
        self.inner.signals.extents_changed.emit();
        Ok(())
    }

    /// Unset an argument, returning the provider to the invalid
    /// "image default" state for that parameter.
    pub fn unset(&self, name: &str) -> Result<(), BindError> {
        {
            let mut state = self.inner.state.lock();
            let (index, spec) = Self::param_index(&state, name)?;
            self.disconnect_child(&mut state, index);
            state.args[index] = Value::Null(spec.ty);
        }
        self.inner.argument_changed.emit();
        self.bump_module();
        Ok(())
    }

    /// Current binding of a parameter.
    pub fn argument(&self, name: &str) -> Option<Value> {
        let state = self.inner.state.lock();
        let (index, _) = Self::param_index(&state, name).ok()?;
        Some(state.args[index].clone())
    }

    /// True iff the kernel compiled, every parameter is bound, and every
    /// transitive child is valid.
    pub fn is_valid(&self) -> bool {
        let state = self.inner.state.lock();
        let Some(compiled) = state.compiled.as_ref() else { return false };
        if !compiled.compile_status() {
            return false;
        }
        state.args.iter().all(|arg| match arg {
            Value::Null(_) => false,
            Value::Sampler(child) => child.is_valid(),
            _ => true,
        })
    }

    /// Default extent: the union of the child samplers' visible extents
    /// (each child extent seen through the inverse of its transform).
    /// An explicit extent override wins; a kernel with no sampler children
    /// has infinite extent.
    pub fn extent(&self) -> Extent {
        let state = self.inner.state.lock();
        if let Some(extent) = state.extent_override {
            return extent;
        }
        let mut extent: Option<Extent> = None;
        for arg in &state.args {
            if let Value::Sampler(child) = arg {
                let inverse = child.transform().invert().unwrap_or(AffineTransform::IDENTITY);
                let visible = inverse.apply_extent(child.extent());
                extent = Some(match extent {
                    None => visible,
                    Some(acc) => extent_union(acc, visible),
                });
            }
        }
        extent.unwrap_or(INFINITE_EXTENT)
    }

    pub fn set_extent(&self, extent: Option<Extent>) {
        self.inner.state.lock().extent_override = extent;
        self.inner.signals.extents_changed.emit();
    }

    pub fn transform(&self) -> AffineTransform {
        self.inner.state.lock().transform
    }

    /// The transform is composed into parents' `sample` calls at link
    /// time, so changing it dirties modules as well.
    pub fn set_transform(&self, transform: AffineTransform) {
        self.inner.state.lock().transform = transform;
        self.inner.signals.transform_changed.emit();
        self.bump_module();
    }

    pub fn signals(&self) -> &SamplerSignals {
        &self.inner.signals
    }

    /// Emitted with every `set_value`/`set_sampler`/`unset`.
    pub fn argument_changed_signal(&self) -> &Signal {
        &self.inner.argument_changed
    }

    pub fn module_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Serialises renders against reconfiguration.
    pub(crate) fn lock_render(&self) -> MutexGuard<'_, ()> {
        self.inner.render_lock.lock()
    }

    pub(crate) fn any_child(&self, mut f: impl FnMut(&Sampler) -> bool) -> bool {
        let state = self.inner.state.lock();
        state.args.iter().any(|arg| match arg {
            Value::Sampler(child) => f(child),
            _ => false,
        })
    }

    pub(crate) fn snapshot(&self) -> Option<LinkSnapshot> {
        let state = self.inner.state.lock();
        let compiled = state.compiled.clone()?;
        let kernel = compiled.kernels().get(state.kernel_index)?.clone();
        Some(LinkSnapshot {
            compiled,
            kernel,
            args: state.args.clone(),
        })
    }

    pub(crate) fn hash_static_parts(&self, h: &mut impl Hasher) {
        let state = self.inner.state.lock();
        if let Some(compiled) = &state.compiled {
            h.write_usize(Arc::as_ptr(compiled) as *const u8 as usize);
        }
        h.write_usize(state.kernel_index);
        let specs = state
            .compiled
            .as_ref()
            .and_then(|c| c.kernels().get(state.kernel_index))
            .map(|k| k.parameters.clone())
            .unwrap_or_default();
        drop(state);
        for (i, spec) in specs.iter().enumerate() {
            if !spec.is_static {
                continue;
            }
            match self.inner.state.lock().args.get(i).cloned() {
                Some(Value::Sampler(child)) => child.hash_static(h),
                Some(value) => value.hash_into(h),
                None => {}
            }
        }
    }

    fn bump_module(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.signals.module_changed.emit();
    }

    fn disconnect_children(&self, state: &mut KernelState) {
        for (index, module_handler, contents_handler) in state.subscriptions.drain(..) {
            if let Value::Sampler(child) = &state.args[index] {
                child.signals().module_changed.disconnect(module_handler);
                child.signals().contents_changed.disconnect(contents_handler);
            }
        }
    }

    fn disconnect_child(&self, state: &mut KernelState, index: usize) {
        if let Some(pos) = state.subscriptions.iter().position(|(i, _, _)| *i == index) {
            let (_, module_handler, contents_handler) = state.subscriptions.remove(pos);
            if let Value::Sampler(child) = &state.args[index] {
                child.signals().module_changed.disconnect(module_handler);
                child.signals().contents_changed.disconnect(contents_handler);
            }
        }
    }

    fn connect_child(&self, state: &mut KernelState, index: usize, child: &Sampler) {
        // Weak back-references: the child must not keep its parent alive.
        let weak: Weak<KernelSamplerInner> = Arc::downgrade(&self.inner);
        let module_handler = child.signals().module_changed.connect({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.version.fetch_add(1, Ordering::AcqRel);
                    inner.signals.module_changed.emit();
                }
            }
        });
        let contents_handler = child.signals().contents_changed.connect(move || {
            if let Some(inner) = weak.upgrade() {
                inner.signals.contents_changed.emit();
            }
        });
        state.subscriptions.push((index, module_handler, contents_handler));
    }
}

impl Default for KernelSampler {
    fn default() -> KernelSampler {
        KernelSampler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TINT: &str = "kernel vec4 tint(sampler s, vec4 c) { return sample(s, destCoord()) * c; }";
    const FILL: &str = "kernel vec4 fill(vec4 c) { return c; }";

    fn provider(source: &str) -> KernelSampler {
        let sampler = KernelSampler::new();
        assert!(sampler.compile_from_source(source, None));
        sampler
    }

    #[test]
    fn binds_values_with_type_checking() {
        let fill = provider(FILL);
        assert!(!fill.is_valid());
        assert!(matches!(
            fill.set_value("c", 1.0f32),
            Err(BindError::TypeMismatch { .. })
        ));
        fill.set_value("c", glam::Vec4::ONE).unwrap();
        assert!(fill.is_valid());
        assert!(matches!(
            fill.set_value("missing", 1.0f32),
            Err(BindError::NoSuchParameter(_))
        ));
    }

    #[test]
    fn unset_invalidates() {
        let fill = provider(FILL);
        fill.set_value("c", glam::Vec4::ONE).unwrap();
        assert!(fill.is_valid());
        fill.unset("c").unwrap();
        assert!(!fill.is_valid());
    }

    #[test]
    fn sampler_binding_and_validity() {
        let tint = provider(TINT);
        let fill = provider(FILL);
        tint.set_value("c", glam::Vec4::splat(0.5)).unwrap();
        tint.set_sampler("s", fill.clone()).unwrap();
        // Child still unbound, so the graph is not yet valid.
        assert!(!tint.is_valid());
        fill.set_value("c", glam::Vec4::ONE).unwrap();
        assert!(tint.is_valid());
    }

    #[test]
    fn cycles_are_rejected_and_leave_state_unchanged() {
        let a = provider(TINT);
        let b = provider(TINT);
        a.set_sampler("s", b.clone()).unwrap();
        let before = b.argument("s");
        assert!(matches!(b.set_sampler("s", a.clone()), Err(BindError::Cycle)));
        assert_eq!(b.argument("s"), before);
        // Self-binding is a cycle too.
        assert!(matches!(a.set_sampler("s", a.clone()), Err(BindError::Cycle)));
    }

    #[test]
    fn child_module_changes_propagate() {
        let tint = provider(TINT);
        let fill = provider(FILL);
        tint.set_sampler("s", fill.clone()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        tint.signals().module_changed.connect(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let v0 = tint.module_version();
        // Recompiling the child must dirty the parent's module.
        assert!(fill.compile_from_source(FILL, None));
        assert!(tint.module_version() > v0);
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn static_value_changes_dirty_the_module() {
        let p = provider("kernel vec4 f(static float k) { return vec4(k); }");
        let v0 = p.module_version();
        p.set_value("k", 2.0f32).unwrap();
        assert!(p.module_version() > v0);
        // Dynamic changes do not.
        let q = provider(FILL);
        q.set_value("c", glam::Vec4::ONE).unwrap();
        let v1 = q.module_version();
        q.set_value("c", glam::Vec4::ZERO).unwrap();
        assert_eq!(q.module_version(), v1);
    }

    #[test]
    fn kernel_selection_by_name() {
        let source = "kernel vec4 first() { return vec4(1.0); }\n\
                      kernel vec4 second() { return vec4(2.0); }\n";
        let compiled = Arc::new(CompiledKernel::compile(source));
        let by_default = KernelSampler::with_kernel(compiled.clone(), None).unwrap();
        assert_eq!(by_default.kernel_function().unwrap().name, "first");
        let by_name = KernelSampler::with_kernel(compiled.clone(), Some("second")).unwrap();
        assert_eq!(by_name.kernel_function().unwrap().name, "second");
        assert!(KernelSampler::with_kernel(compiled, Some("third")).is_err());
    }
}
