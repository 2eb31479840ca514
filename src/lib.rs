//! Scoped events and one-shot futures.
//!
//! An [`Event`] is something handlers subscribe to; a [`Fireable`] is the
//! writable side that delivers values to them. Subscriptions can be tied to
//! a [`Scope`] so they are revoked when the scope's owner goes away.
//!
//! A [`Future`] is a value that will be resolved, failed or cancelled exactly
//! once. Its events remember the outcome, so subscribing late still delivers
//! it.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use eventually::{Outcome, ResolvableFuture, ScopeOwner};
//!
//! let future = ResolvableFuture::<u32, String>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let owner = ScopeOwner::new();
//! let sink = Arc::clone(&seen);
//! future.when().subscribe(Some(owner.scope()), move |v| sink.lock().unwrap().push(v));
//!
//! assert!(future.resolve(42));
//! assert!(!future.fail("too late".into()));
//! assert_eq!(*seen.lock().unwrap(), vec![42]);
//! assert_eq!(future.outcome(), Some(Outcome::Resolved(42)));
//! ```

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod binding;
mod error;
mod event;
mod fireable;
mod future;
mod queue;
mod scope;

pub use binding::EventBinding;
pub use error::{Error, Result};
pub use event::Event;
pub use fireable::Fireable;
pub use future::{CancellableFuture, Failure, Future, Outcome, ResolvableFuture, State};
pub use queue::{main_queue, PumpedQueue, Queue, SerialQueue, Work};
pub use scope::{OwnerId, Scope, ScopeDirectory, ScopeOwner};

/// Payload of a caught handler panic.
pub(crate) type Panic = Box<dyn Any + Send + 'static>;

/// Handler code never runs under these locks; poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
