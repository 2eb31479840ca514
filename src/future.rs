//! One-shot futures driven by events.
//!
//! A [`ResolvableFuture`] is held by the producer; consumers get a
//! [`Future`] or [`CancellableFuture`] view of the same state. The first of
//! `resolve`, `fail` or `cancel` to reach the state lock commits the outcome;
//! every later call is a no-op. The committing call then fires the matching
//! events once and releases all of their handlers.
//!
//! Each event remembers the outcome: subscribing after the commit delivers
//! it straight away, on the subscribing thread or on the subscription's
//! queue.

use std::fmt;
use std::ops::Deref;
use std::panic::resume_unwind;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use tracing::{debug, trace};

use crate::binding::EventBinding;
use crate::event::{Event, Source};
use crate::fireable::{deliver_once, Registry, Subscription};
use crate::{lock, Error, Panic, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Resolved,
    Failed,
    Cancelled,
}

/// The terminal value of a future. Delivered by [`Future::any`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Resolved(T),
    Failed(E),
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Failed(_) => State::Failed,
            Outcome::Cancelled => State::Cancelled,
        }
    }
}

/// Delivered by [`Future::failed_or_cancelled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    Failed(E),
    Cancelled,
}

struct Core<T, E> {
    outcome: Mutex<Option<Outcome<T, E>>>,
    when: Arc<Registry<T>>,
    failed: Arc<Registry<E>>,
    cancelled: Arc<Registry<()>>,
    failed_or_cancelled: Arc<Registry<Failure<E>>>,
    any: Arc<Registry<Outcome<T, E>>>,
}

fn keep_first(slot: &mut Option<Panic>, panic: Option<Panic>) {
    if slot.is_none() {
        *slot = panic;
    }
}

impl<T, E> Core<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            when: Registry::new(),
            failed: Registry::new(),
            cancelled: Registry::new(),
            failed_or_cancelled: Registry::new(),
            any: Registry::new(),
        }
    }

    fn outcome(&self) -> Option<Outcome<T, E>> {
        lock(&self.outcome).clone()
    }

    /// Moves the future from pending to `outcome`. Returns `false` without
    /// touching anything if it was already terminal.
    fn commit(&self, outcome: Outcome<T, E>) -> bool {
        {
            let mut slot = lock(&self.outcome);
            if let Some(current) = slot.as_ref() {
                trace!(state = ?current.state(), attempted = ?outcome.state(), "future already terminal");
                return false;
            }
            *slot = Some(outcome.clone());
        }
        debug!(state = ?outcome.state(), "future committed");

        // Every binding made before the commit sits in these lists; every
        // binding made after it is served by `Terminal::bind` instead.
        let mut first_panic = None;
        match &outcome {
            Outcome::Resolved(value) => {
                keep_first(&mut first_panic, self.when.fire(value.clone()));
            }
            Outcome::Failed(error) => {
                keep_first(&mut first_panic, self.failed.fire(error.clone()));
                keep_first(
                    &mut first_panic,
                    self.failed_or_cancelled.fire(Failure::Failed(error.clone())),
                );
            }
            Outcome::Cancelled => {
                keep_first(&mut first_panic, self.cancelled.fire(()));
                keep_first(&mut first_panic, self.failed_or_cancelled.fire(Failure::Cancelled));
            }
        }
        keep_first(&mut first_panic, self.any.fire(outcome));
        self.release();
        debug_assert!(self.is_released(), "subscriber list refilled after commit");

        if let Some(panic) = first_panic {
            resume_unwind(panic);
        }
        true
    }

    /// None of the lists can fire again once the outcome is set.
    fn release(&self) {
        self.when.clear();
        self.failed.clear();
        self.cancelled.clear();
        self.failed_or_cancelled.clear();
        self.any.clear();
    }

    fn is_released(&self) -> bool {
        self.when.len() == 0
            && self.failed.len() == 0
            && self.cancelled.len() == 0
            && self.failed_or_cancelled.len() == 0
            && self.any.len() == 0
    }
}

/// One of a future's events. Binds into its subscriber list while the
/// future is pending, and delivers the settled value directly afterwards.
struct Terminal<T, E, X> {
    core: Arc<Core<T, E>>,
    registry: fn(&Core<T, E>) -> &Arc<Registry<X>>,
    select: fn(&Outcome<T, E>) -> Option<X>,
}

impl<T, E, X> Source<X> for Terminal<T, E, X>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    X: Clone + Send + 'static,
{
    fn bind(&self, subscription: Subscription<X>) -> EventBinding {
        let outcome = {
            let slot = lock(&self.core.outcome);
            match slot.as_ref() {
                // Bound under the state lock so the commit cannot slip in
                // between the check and the push.
                None => return (self.registry)(&self.core).bind(subscription),
                Some(outcome) => outcome.clone(),
            }
        };
        let Some(value) = (self.select)(&outcome) else {
            return EventBinding::inert();
        };
        trace!(state = ?outcome.state(), "delivering settled outcome to late subscriber");
        let (binding, panic) = deliver_once(subscription, value);
        if let Some(panic) = panic {
            resume_unwind(panic);
        }
        binding
    }
}

/// Read-only view of a one-shot value.
///
/// Exactly one of [`when`](Self::when), [`failed`](Self::failed) and
/// [`cancelled`](Self::cancelled) fires over the future's lifetime, at most
/// once, followed by [`any`](Self::any). A future dropped while pending fires
/// nothing.
pub struct Future<T, E> {
    core: Arc<Core<T, E>>,
}

impl<T, E> Future<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn pending() -> Self {
        Self {
            core: Arc::new(Core::new()),
        }
    }

    /// A future that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let future = Self::pending();
        future.core.commit(Outcome::Resolved(value));
        future
    }

    /// A future that has already failed with `error`.
    pub fn failed_with(error: E) -> Self {
        let future = Self::pending();
        future.core.commit(Outcome::Failed(error));
        future
    }

    /// A future that is already cancelled.
    pub fn cancelled_now() -> Self {
        let future = Self::pending();
        future.core.commit(Outcome::Cancelled);
        future
    }

    fn terminal<X>(
        &self,
        registry: fn(&Core<T, E>) -> &Arc<Registry<X>>,
        select: fn(&Outcome<T, E>) -> Option<X>,
    ) -> Event<X>
    where
        X: Clone + Send + 'static,
    {
        Event::from_source(Arc::new(Terminal {
            core: Arc::clone(&self.core),
            registry,
            select,
        }))
    }

    /// Fires with the value when the future resolves.
    pub fn when(&self) -> Event<T> {
        self.terminal::<T>(
            |core| &core.when,
            |outcome| match outcome {
                Outcome::Resolved(value) => Some(value.clone()),
                _ => None,
            },
        )
    }

    /// Fires with the error when the future fails.
    pub fn failed(&self) -> Event<E> {
        self.terminal::<E>(
            |core| &core.failed,
            |outcome| match outcome {
                Outcome::Failed(error) => Some(error.clone()),
                _ => None,
            },
        )
    }

    /// Fires when the future is cancelled.
    pub fn cancelled(&self) -> Event<()> {
        self.terminal::<()>(
            |core| &core.cancelled,
            |outcome| matches!(outcome, Outcome::Cancelled).then_some(()),
        )
    }

    /// Fires when the future fails or is cancelled.
    pub fn failed_or_cancelled(&self) -> Event<Failure<E>> {
        self.terminal::<Failure<E>>(
            |core| &core.failed_or_cancelled,
            |outcome| match outcome {
                Outcome::Resolved(_) => None,
                Outcome::Failed(error) => Some(Failure::Failed(error.clone())),
                Outcome::Cancelled => Some(Failure::Cancelled),
            },
        )
    }

    /// Fires with the outcome, whichever it is.
    pub fn any(&self) -> Event<Outcome<T, E>> {
        self.terminal::<Outcome<T, E>>(|core| &core.any, |outcome| Some(outcome.clone()))
    }

    pub fn state(&self) -> State {
        lock(&self.core.outcome)
            .as_ref()
            .map_or(State::Pending, Outcome::state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != State::Pending
    }

    pub fn outcome(&self) -> Option<Outcome<T, E>> {
        self.core.outcome()
    }

    /// The resolved value, if the future resolved.
    pub fn value(&self) -> Option<T> {
        match lock(&self.core.outcome).as_ref() {
            Some(Outcome::Resolved(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The failure, if the future failed.
    pub fn failure(&self) -> Option<E> {
        match lock(&self.core.outcome).as_ref() {
            Some(Outcome::Failed(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Waits for the outcome.
    ///
    /// Resolves to [`Error::Abandoned`] if every handle to the future is
    /// dropped while it is still pending.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventually::{Outcome, ResolvableFuture};
    /// use futures::executor::block_on;
    /// use std::thread;
    ///
    /// let producer = ResolvableFuture::<String, ()>::new();
    /// let outcome = producer.wait();
    /// let task = thread::spawn(move || producer.resolve("🍓".into()));
    /// assert_eq!(block_on(outcome).unwrap(), Outcome::Resolved("🍓".to_string()));
    /// task.join().expect("The producer thread has panicked");
    /// ```
    pub fn wait(&self) -> impl std::future::Future<Output = Result<Outcome<T, E>>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        self.any().subscribe(None, move |outcome| {
            if let Some(sender) = lock(&sender).take() {
                let _ = sender.send(outcome);
            }
        });
        async move { receiver.await.map_err(|_| Error::Abandoned) }
    }
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, E> fmt::Debug for Future<T, E>
where
    T: Clone + Send + fmt::Debug + 'static,
    E: Clone + Send + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// A future any holder may cancel.
pub struct CancellableFuture<T, E> {
    future: Future<T, E>,
}

impl<T, E> CancellableFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Cancels the future if it is still pending. Returns `true` if this
    /// call decided the outcome.
    ///
    /// Cancellation is advisory: it does not stop the producer's work, it
    /// only makes its later `resolve`/`fail` a no-op.
    pub fn cancel(&self) -> bool {
        self.future.core.commit(Outcome::Cancelled)
    }

    /// The read-only view.
    pub fn future(&self) -> Future<T, E> {
        self.future.clone()
    }
}

impl<T, E> Deref for CancellableFuture<T, E> {
    type Target = Future<T, E>;

    fn deref(&self) -> &Self::Target {
        &self.future
    }
}

impl<T, E> Clone for CancellableFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T, E> fmt::Debug for CancellableFuture<T, E>
where
    T: Clone + Send + fmt::Debug + 'static,
    E: Clone + Send + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableFuture")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// The producer's handle: a cancellable future that can also be resolved or
/// failed.
pub struct ResolvableFuture<T, E> {
    cancellable: CancellableFuture<T, E>,
}

impl<T, E> ResolvableFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A new pending future.
    pub fn new() -> Self {
        Self {
            cancellable: CancellableFuture {
                future: Future::pending(),
            },
        }
    }

    /// Resolves the future with `value` if it is still pending. Returns
    /// `true` if this call decided the outcome.
    pub fn resolve(&self, value: T) -> bool {
        self.cancellable.future.core.commit(Outcome::Resolved(value))
    }

    /// Fails the future with `error` if it is still pending. Returns `true`
    /// if this call decided the outcome.
    pub fn fail(&self, error: E) -> bool {
        self.cancellable.future.core.commit(Outcome::Failed(error))
    }

    /// The view handed to consumers that may cancel.
    pub fn cancellable(&self) -> CancellableFuture<T, E> {
        self.cancellable.clone()
    }
}

impl<T, E> Default for ResolvableFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deref for ResolvableFuture<T, E> {
    type Target = CancellableFuture<T, E>;

    fn deref(&self) -> &Self::Target {
        &self.cancellable
    }
}

impl<T, E> Clone for ResolvableFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            cancellable: self.cancellable.clone(),
        }
    }
}

impl<T, E> fmt::Debug for ResolvableFuture<T, E>
where
    T: Clone + Send + fmt::Debug + 'static,
    E: Clone + Send + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvableFuture")
            .field("outcome", &self.outcome())
            .finish()
    }
}
