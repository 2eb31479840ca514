use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, trace};

use crate::binding::{BindingCore, EventBinding, Unsubscribe};
use crate::event::{Event, Source};
use crate::queue::Queue;
use crate::scope::Scope;
use crate::{lock, panic_message, Panic};

pub(crate) type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A handler on its way to a subscriber list, with everything the derived
/// events it passed through attached to it.
pub(crate) struct Subscription<T> {
    pub(crate) handler: Handler<T>,
    pub(crate) scope: Option<Scope>,
    pub(crate) queue: Option<Arc<dyn Queue>>,
}

impl<T: 'static> Subscription<T> {
    pub(crate) fn new(handler: Handler<T>, scope: Option<Scope>) -> Self {
        Self {
            handler,
            scope,
            queue: None,
        }
    }

    /// Turns a subscription for `T` into one for `S` by running `transform`
    /// in front of the handler.
    pub(crate) fn map_from<S: 'static>(
        self,
        transform: Arc<dyn Fn(S) -> T + Send + Sync>,
    ) -> Subscription<S> {
        let handler = self.handler;
        Subscription {
            handler: Arc::new(move |value: S| handler(transform(value))),
            scope: self.scope,
            queue: self.queue,
        }
    }
}

struct Record<T> {
    binding: Arc<BindingCore>,
    handler: Handler<T>,
    queue: Option<Arc<dyn Queue>>,
    /// Delivered at most once, then removed.
    once: bool,
}

impl<T: Send + 'static> Record<T> {
    /// Runs the handler on this thread, or hands it to the record's queue.
    /// Returns the panic of a handler that ran here and failed.
    fn deliver(self: &Arc<Self>, value: T) -> Option<Panic> {
        if let Some(queue) = &self.queue {
            let record = Arc::clone(self);
            queue.dispatch(Box::new(move || {
                let live = if record.once {
                    record.binding.remove()
                } else {
                    record.binding.is_live()
                };
                if live {
                    (record.handler)(value);
                }
            }));
            return None;
        }
        let panic = catch_unwind(AssertUnwindSafe(|| (self.handler)(value))).err()?;
        error!(
            binding = self.binding.id(),
            panic = panic_message(&*panic),
            "event handler panicked"
        );
        Some(panic)
    }
}

/// An ordered subscriber list.
pub(crate) struct Registry<T> {
    this: Weak<Registry<T>>,
    records: Mutex<Vec<Arc<Record<T>>>>,
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            records: Mutex::new(Vec::new()),
        })
    }

    /// Delivers `value` to every binding present when the call started and
    /// still live when its turn comes. Returns the first handler panic.
    pub(crate) fn fire(&self, value: T) -> Option<Panic> {
        let snapshot = lock(&self.records).clone();
        trace!(subscribers = snapshot.len(), "firing");
        let mut first_panic = None;
        for record in snapshot {
            if !record.binding.is_live() {
                continue;
            }
            if let Some(panic) = record.deliver(value.clone()) {
                first_panic.get_or_insert(panic);
            }
        }
        first_panic
    }

    /// Drops every record at once. Fires that already took their snapshot
    /// still deliver to it.
    pub(crate) fn clear(&self) {
        let records = std::mem::take(&mut *lock(&self.records));
        trace!(subscribers = records.len(), "bindings released");
        for record in records {
            record.binding.detach();
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.records).len()
    }
}

impl<T: 'static> Unsubscribe for Registry<T> {
    fn unsubscribe(&self, id: u64) {
        lock(&self.records).retain(|record| record.binding.id() != id);
    }
}

impl<T: Clone + Send + 'static> Source<T> for Registry<T> {
    fn bind(&self, subscription: Subscription<T>) -> EventBinding {
        let source: Weak<dyn Unsubscribe> = self.this.clone();
        let core = BindingCore::new(Some(source), subscription.scope.as_ref().map(Scope::entry));
        if let Some(scope) = &subscription.scope {
            if !scope.admit(&core) {
                core.remove();
                return EventBinding::new(core);
            }
        }
        lock(&self.records).push(Arc::new(Record {
            binding: Arc::clone(&core),
            handler: subscription.handler,
            queue: subscription.queue,
            once: false,
        }));
        // The owner may have died between admission and the push above.
        if !core.is_live() {
            self.unsubscribe(core.id());
        }
        trace!(binding = core.id(), "handler bound");
        EventBinding::new(core)
    }
}

impl<T> Drop for Registry<T> {
    fn drop(&mut self) {
        let records = self.records.get_mut().unwrap_or_else(|e| e.into_inner());
        for record in records.drain(..) {
            record.binding.detach();
        }
    }
}

/// Delivers `value` once to a subscription that is never stored. Used for
/// late subscribers of an event whose value is already settled.
pub(crate) fn deliver_once<T: Send + 'static>(
    subscription: Subscription<T>,
    value: T,
) -> (EventBinding, Option<Panic>) {
    let core = BindingCore::new(None, subscription.scope.as_ref().map(Scope::entry));
    if let Some(scope) = &subscription.scope {
        if !scope.admit(&core) {
            core.remove();
            return (EventBinding::new(core), None);
        }
    }
    let record = Arc::new(Record {
        binding: Arc::clone(&core),
        handler: subscription.handler,
        queue: subscription.queue,
        once: true,
    });
    let panic = record.deliver(value);
    // A queued delivery stays cancellable until it runs, and retires itself
    // when it does.
    if record.queue.is_none() {
        core.remove();
    }
    (EventBinding::new(core), panic)
}

/// The writable side of an [`Event`].
///
/// Every call to [`fire`](Self::fire) delivers to the handlers bound at
/// that moment; a `Fireable` keeps no memory of earlier values. Clones share
/// the same subscriber list.
pub struct Fireable<T> {
    registry: Arc<Registry<T>>,
}

impl<T: Clone + Send + 'static> Fireable<T> {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// The read-only view of this fireable.
    pub fn event(&self) -> Event<T> {
        Event::from_source(Arc::clone(&self.registry) as Arc<dyn Source<T>>)
    }

    /// See [`Event::subscribe`].
    pub fn subscribe<F>(&self, scope: Option<&Scope>, handler: F) -> EventBinding
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.event().subscribe(scope, handler)
    }

    /// See [`Event::map`].
    pub fn map<U, F>(&self, transform: F) -> Event<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.event().map(transform)
    }

    /// See [`Event::on_queue`].
    pub fn on_queue(&self, queue: Arc<dyn Queue>) -> Event<T> {
        self.event().on_queue(queue)
    }

    /// See [`Event::on_main_queue`].
    pub fn on_main_queue(&self) -> Event<T> {
        self.event().on_main_queue()
    }

    /// Delivers `value` to the current handlers in subscription order.
    ///
    /// Handlers without a queue run on this thread before `fire` returns.
    /// A panicking handler does not stop delivery to the ones after it; the
    /// first panic is resumed here once every handler has been visited.
    pub fn fire(&self, value: T) {
        if let Some(panic) = self.registry.fire(value) {
            resume_unwind(panic);
        }
    }

    /// Drops every binding at once.
    pub fn remove_all_bindings(&self) {
        self.registry.clear();
    }

    /// Number of bindings currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}

impl<T: Clone + Send + 'static> Default for Fireable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Fireable<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Clone + Send + 'static> From<&Fireable<T>> for Event<T> {
    fn from(fireable: &Fireable<T>) -> Self {
        fireable.event()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Fireable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fireable")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
