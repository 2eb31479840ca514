use std::fmt;
use std::sync::Arc;

use crate::binding::EventBinding;
use crate::fireable::Subscription;
use crate::queue::{main_queue, Queue};
use crate::scope::Scope;

/// Anything a subscription can be bound to: a subscriber list, or a derived
/// event that adjusts the subscription and forwards it upstream.
pub(crate) trait Source<T>: Send + Sync {
    fn bind(&self, subscription: Subscription<T>) -> EventBinding;
}

/// The subscribe-only surface of an event.
///
/// Cheap to clone; every clone refers to the same underlying source.
pub struct Event<T> {
    source: Arc<dyn Source<T>>,
}

impl<T: Clone + Send + 'static> Event<T> {
    pub(crate) fn from_source(source: Arc<dyn Source<T>>) -> Self {
        Self { source }
    }

    /// Registers `handler` for every value this event delivers from now on.
    ///
    /// With a scope, the binding is also revoked when the scope's owner is
    /// destroyed. Subscribing in a scope whose owner is already gone returns
    /// a binding that never fires.
    pub fn subscribe<F>(&self, scope: Option<&Scope>, handler: F) -> EventBinding
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.source
            .bind(Subscription::new(Arc::new(handler), scope.cloned()))
    }

    /// An event delivering `transform(value)` for every value of this one.
    ///
    /// The transform runs as part of each handler's delivery, so a panic in
    /// it fails that one delivery only.
    pub fn map<U, F>(&self, transform: F) -> Event<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Event::from_source(Arc::new(Mapped {
            upstream: Arc::clone(&self.source),
            transform: Arc::new(transform),
        }))
    }

    /// An event whose handlers run on `queue` instead of the firing thread.
    ///
    /// When redirections are stacked, the outermost one wins.
    pub fn on_queue(&self, queue: Arc<dyn Queue>) -> Event<T> {
        Event::from_source(Arc::new(Redirected {
            upstream: Arc::clone(&self.source),
            queue,
        }))
    }

    /// Shorthand for [`on_queue`](Self::on_queue) with [`main_queue`].
    pub fn on_main_queue(&self) -> Event<T> {
        self.on_queue(main_queue())
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

struct Mapped<S, T> {
    upstream: Arc<dyn Source<S>>,
    transform: Arc<dyn Fn(S) -> T + Send + Sync>,
}

impl<S: 'static, T: 'static> Source<T> for Mapped<S, T> {
    fn bind(&self, subscription: Subscription<T>) -> EventBinding {
        self.upstream
            .bind(subscription.map_from(Arc::clone(&self.transform)))
    }
}

struct Redirected<T> {
    upstream: Arc<dyn Source<T>>,
    queue: Arc<dyn Queue>,
}

impl<T> Source<T> for Redirected<T> {
    fn bind(&self, mut subscription: Subscription<T>) -> EventBinding {
        subscription
            .queue
            .get_or_insert_with(|| Arc::clone(&self.queue));
        self.upstream.bind(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::{mpsc, Mutex};
    use std::thread;

    use super::*;
    use crate::{Fireable, PumpedQueue, SerialQueue};

    #[test]
    fn map_transforms_each_value() {
        let fireable = Fireable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fireable
            .map(|v| v * 10)
            .map(|v| format!("#{v}"))
            .subscribe(None, move |v| sink.lock().unwrap().push(v));

        fireable.fire(1);
        fireable.fire(2);

        assert_eq!(*seen.lock().unwrap(), vec!["#10".to_string(), "#20".to_string()]);
    }

    #[test]
    fn failing_transform_only_affects_its_handler() {
        let fireable = Fireable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fireable
            .map(|v: u32| -> u32 { if v == 0 { panic!("zero") } else { 100 / v } })
            .subscribe(None, |_| {});
        fireable.subscribe(None, move |v| sink.lock().unwrap().push(v));

        assert!(catch_unwind(AssertUnwindSafe(|| fireable.fire(0))).is_err());
        fireable.fire(5);

        assert_eq!(*seen.lock().unwrap(), vec![0, 5]);
        assert_eq!(fireable.subscriber_count(), 2);
    }

    #[test]
    fn removing_a_mapped_binding_detaches_from_the_source() {
        let fireable = Fireable::<u32>::new();
        let binding = fireable.map(|v| v + 1).subscribe(None, |_| {});
        assert_eq!(fireable.subscriber_count(), 1);

        binding.remove();
        assert_eq!(fireable.subscriber_count(), 0);
    }

    #[test]
    fn on_queue_runs_handler_on_the_queue_thread() {
        let queue = Arc::new(SerialQueue::new("event-on-queue").unwrap());
        let fireable = Fireable::<&'static str>::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        fireable
            .on_queue(Arc::clone(&queue) as Arc<dyn Queue>)
            .subscribe(None, move |v| {
                tx.lock().unwrap().send((v, thread::current().id())).unwrap();
            });

        let firing = fireable.clone();
        thread::spawn(move || firing.fire("v")).join().unwrap();

        let (value, ran_on) = rx.recv().unwrap();
        assert_eq!(value, "v");
        assert_eq!(ran_on, queue.thread_id());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outermost_redirection_wins() {
        let inner = Arc::new(PumpedQueue::new());
        let outer = Arc::new(PumpedQueue::new());
        let fireable = Fireable::<u32>::new();
        fireable
            .on_queue(Arc::clone(&inner) as Arc<dyn Queue>)
            .on_queue(Arc::clone(&outer) as Arc<dyn Queue>)
            .subscribe(None, |_| {});

        fireable.fire(1);

        assert_eq!(inner.pending(), 0);
        assert_eq!(outer.pending(), 1);
    }

    #[test]
    fn binding_removed_before_queue_runs_is_suppressed() {
        let queue = Arc::new(PumpedQueue::new());
        let fireable = Fireable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let binding = fireable
            .on_queue(Arc::clone(&queue) as Arc<dyn Queue>)
            .subscribe(None, move |v| sink.lock().unwrap().push(v));

        fireable.fire(1);
        binding.remove();
        queue.run_pending();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn queued_handlers_keep_subscription_order() {
        let queue = Arc::new(PumpedQueue::new());
        let fireable = Fireable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let redirected = fireable.on_queue(Arc::clone(&queue) as Arc<dyn Queue>);
        for tag in ["first", "second"] {
            let sink = Arc::clone(&seen);
            redirected.subscribe(None, move |v| sink.lock().unwrap().push((tag, v)));
        }

        fireable.fire(1);
        fireable.fire(2);
        queue.run_pending();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }
}
