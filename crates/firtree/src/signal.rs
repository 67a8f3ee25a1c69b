//! Minimal signal/slot mechanism for change notification.
//!
//! Samplers and kernels expose `contents-changed` / `module-changed` style
//! signals; parents subscribe to their children so invalidation propagates
//! up the graph. Handlers are held behind `Arc` and invoked outside the
//! subscriber-list lock, so a handler may re-emit other signals (the
//! provider graph is a DAG, which bounds the propagation).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct Signal {
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl Signal {
    pub fn new() -> Signal {
        Signal::default()
    }

    pub fn connect(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Arc::new(handler)));
        HandlerId(id)
    }

    pub fn disconnect(&self, id: HandlerId) {
        self.handlers.lock().retain(|(h, _)| *h != id.0);
    }

    pub fn emit(&self) {
        let handlers: Vec<Handler> = self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler();
        }
    }
}

/// The signal set every sampler carries.
#[derive(Default)]
pub struct SamplerSignals {
    /// The pixels a sampler produces changed (a dynamic argument or source
    /// buffer contents changed); cached machine code stays valid.
    pub contents_changed: Signal,
    /// The linked module is out of date (recompile, static argument or
    /// graph change); cached machine code must be dropped.
    pub module_changed: Signal,
    pub extents_changed: Signal,
    pub transform_changed: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn connect_emit_disconnect() {
        let signal = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = signal.connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit();
        signal.emit();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        signal.disconnect(id);
        signal.emit();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handlers_may_emit_other_signals() {
        let a = Arc::new(Signal::new());
        let b = Arc::new(Signal::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        b.connect(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        let b2 = b.clone();
        a.connect(move || b2.emit());
        a.emit();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
