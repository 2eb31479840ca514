use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::scope::ScopeEntry;

static NEXT_BINDING_ID: AtomicU64 = AtomicU64::new(1);

/// Lets a binding detach itself from a subscriber list without knowing the
/// payload type of that list.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

/// Shared state behind an [`EventBinding`].
///
/// Referenced strongly by the subscriber record and the handle, weakly by
/// the scope entry it was registered in.
pub(crate) struct BindingCore {
    id: u64,
    /// Cleared by an explicit `remove` or by owner destruction. A cleared
    /// binding is never invoked again, not even by a fire that already took
    /// its snapshot.
    live: AtomicBool,
    /// Cleared when the subscriber list lets go of the record
    /// (`remove_all_bindings`, or the list itself being dropped).
    attached: AtomicBool,
    source: Option<Weak<dyn Unsubscribe>>,
    scope: Option<Arc<ScopeEntry>>,
}

impl BindingCore {
    pub(crate) fn new(
        source: Option<Weak<dyn Unsubscribe>>,
        scope: Option<Arc<ScopeEntry>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed),
            live: AtomicBool::new(true),
            attached: AtomicBool::new(true),
            source,
            scope,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Detaches from the subscriber list and the scope. Only the first call
    /// has any effect; it is the one that returns `true`.
    pub(crate) fn remove(&self) -> bool {
        if !self.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        trace!(binding = self.id, "binding removed");
        self.attached.store(false, Ordering::Release);
        if let Some(source) = self.source.as_ref().and_then(Weak::upgrade) {
            source.unsubscribe(self.id);
        }
        self.leave_scope();
        true
    }

    /// Called by a subscriber list that has already dropped this binding's
    /// record. Fires in flight keep delivering to it.
    pub(crate) fn detach(&self) {
        if self.attached.swap(false, Ordering::AcqRel) {
            self.leave_scope();
        }
    }

    fn leave_scope(&self) {
        if let Some(entry) = &self.scope {
            entry.forget(self.id);
        }
    }
}

/// Handle to one subscription.
///
/// Dropping the handle does not unsubscribe; the subscription lives until
/// [`remove`](Self::remove) is called, its scope owner is destroyed, or the
/// event releases all bindings.
#[derive(Clone)]
pub struct EventBinding {
    core: Arc<BindingCore>,
}

impl EventBinding {
    pub(crate) fn new(core: Arc<BindingCore>) -> Self {
        Self { core }
    }

    /// A binding that was never attached to anything.
    pub(crate) fn inert() -> Self {
        let core = BindingCore::new(None, None);
        core.remove();
        Self { core }
    }

    /// Stops delivery to this binding's handler.
    ///
    /// Safe to call any number of times, including after the event dropped
    /// all of its bindings.
    pub fn remove(&self) {
        self.core.remove();
    }

    /// Whether this binding will never be delivered to again by a future
    /// fire.
    pub fn is_removed(&self) -> bool {
        !self.core.is_live() || !self.core.attached.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBinding")
            .field("id", &self.core.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        removed: Mutex<Vec<u64>>,
    }

    impl Unsubscribe for Recorder {
        fn unsubscribe(&self, id: u64) {
            self.removed.lock().unwrap().push(id);
        }
    }

    #[test]
    fn remove_unsubscribes_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Unsubscribe> = Arc::downgrade(&recorder) as Weak<dyn Unsubscribe>;
        let binding = EventBinding::new(BindingCore::new(Some(weak), None));

        assert!(binding.core.remove());
        assert!(!binding.core.remove());
        binding.clone().remove();

        assert_eq!(recorder.removed.lock().unwrap().len(), 1);
        assert!(binding.is_removed());
    }

    #[test]
    fn remove_after_source_dropped_is_harmless() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Unsubscribe> = Arc::downgrade(&recorder) as Weak<dyn Unsubscribe>;
        let binding = EventBinding::new(BindingCore::new(Some(weak), None));
        drop(recorder);

        binding.remove();
        assert!(binding.is_removed());
    }

    #[test]
    fn detached_binding_reports_removed() {
        let core = BindingCore::new(None, None);
        let binding = EventBinding::new(Arc::clone(&core));
        assert!(!binding.is_removed());

        core.detach();
        assert!(binding.is_removed());
        assert!(core.is_live());
    }

    #[test]
    fn inert_binding_is_removed() {
        assert!(EventBinding::inert().is_removed());
    }
}
