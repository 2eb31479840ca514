//! Lifetime-bound subscription registry.
//!
//! A [`ScopeDirectory`] maps owner identities to the set of bindings created
//! in that owner's scope. When the host reports an owner destroyed, every
//! binding registered under it is removed before the call returns, so no
//! later fire can reach those handlers.
//!
//! Membership is weak: the directory never keeps a binding (or the handler
//! state it captures) alive on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use crate::binding::BindingCore;
use crate::lock;

/// Identity of a scope owner.
///
/// Hosts that track lifetimes themselves mint these from their own object
/// identities. Once an id was reported destroyed, its scope stays dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for OwnerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// One owner's binding set. `None` once the owner is destroyed.
pub(crate) struct ScopeEntry {
    owner: OwnerId,
    bindings: Mutex<Option<HashMap<u64, Weak<BindingCore>>>>,
}

impl ScopeEntry {
    fn new(owner: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            owner,
            bindings: Mutex::new(Some(HashMap::new())),
        })
    }

    fn closed(owner: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            owner,
            bindings: Mutex::new(None),
        })
    }

    /// Records `core` in this scope. Returns `false` if the owner is already
    /// gone, in which case the caller must treat the binding as inert.
    fn admit(&self, core: &Arc<BindingCore>) -> bool {
        match lock(&self.bindings).as_mut() {
            Some(bindings) => {
                bindings.insert(core.id(), Arc::downgrade(core));
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, id: u64) {
        if let Some(bindings) = lock(&self.bindings).as_mut() {
            bindings.remove(&id);
        }
    }

    fn close(&self) -> Vec<Weak<BindingCore>> {
        lock(&self.bindings)
            .take()
            .map(|bindings| bindings.into_values().collect())
            .unwrap_or_default()
    }

    fn is_open(&self) -> bool {
        lock(&self.bindings).is_some()
    }

    fn len(&self) -> usize {
        lock(&self.bindings).as_ref().map_or(0, HashMap::len)
    }
}

/// Handle to one owner's registry entry, passed to
/// [`Event::subscribe`](crate::Event::subscribe) to tie a handler to the
/// owner's lifetime.
#[derive(Clone)]
pub struct Scope {
    entry: Arc<ScopeEntry>,
}

impl Scope {
    pub fn owner(&self) -> OwnerId {
        self.entry.owner
    }

    /// `false` once the owner has been destroyed. Bindings made in a dead
    /// scope never fire.
    pub fn is_alive(&self) -> bool {
        self.entry.is_open()
    }

    /// Number of live bindings currently registered in this scope.
    pub fn binding_count(&self) -> usize {
        self.entry.len()
    }

    pub(crate) fn entry(&self) -> Arc<ScopeEntry> {
        Arc::clone(&self.entry)
    }

    pub(crate) fn admit(&self, core: &Arc<BindingCore>) -> bool {
        let admitted = self.entry.admit(core);
        if !admitted {
            trace!(owner = self.entry.owner.0, binding = core.id(), "scope already destroyed");
        }
        admitted
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("owner", &self.entry.owner)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct DirectoryInner {
    scopes: DashMap<OwnerId, Arc<ScopeEntry>>,
    /// Host-supplied owners reported destroyed.
    destroyed: DashSet<OwnerId>,
    next_owner: AtomicU64,
}

/// Owner identity → scope registry.
///
/// Entries are sharded so that distinct owners never contend; each entry
/// carries its own lock. Cloning shares the same directory.
#[derive(Clone)]
pub struct ScopeDirectory {
    inner: Arc<DirectoryInner>,
}

impl ScopeDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                scopes: DashMap::new(),
                destroyed: DashSet::new(),
                next_owner: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide directory, created on first use.
    pub fn global() -> &'static ScopeDirectory {
        static GLOBAL: OnceLock<ScopeDirectory> = OnceLock::new();
        GLOBAL.get_or_init(ScopeDirectory::new)
    }

    /// Returns the scope for `owner`, creating its entry on first use.
    ///
    /// An owner that was already reported destroyed gets a dead scope:
    /// anything bound in it is inert.
    pub fn scope_for(&self, owner: OwnerId) -> Scope {
        if self.inner.destroyed.contains(&owner) {
            debug!(owner = owner.0, "scope requested for destroyed owner");
            return Scope {
                entry: ScopeEntry::closed(owner),
            };
        }
        let entry = Arc::clone(
            &*self
                .inner
                .scopes
                .entry(owner)
                .or_insert_with(|| ScopeEntry::new(owner)),
        );
        // Destruction may have been reported while the entry was created.
        if self.inner.destroyed.contains(&owner) {
            self.tear_down(owner);
        }
        Scope { entry }
    }

    /// Removes every binding registered under `owner` and drops its entry.
    ///
    /// Called by the host's lifetime management when the owner is destroyed.
    /// Calling it again, or for an owner that never had a scope, does nothing.
    /// The id is remembered, so later [`scope_for`](Self::scope_for) calls
    /// with it return a dead scope.
    pub fn on_owner_destroyed(&self, owner: OwnerId) {
        self.inner.destroyed.insert(owner);
        self.tear_down(owner);
    }

    fn tear_down(&self, owner: OwnerId) {
        let Some((_, entry)) = self.inner.scopes.remove(&owner) else {
            return;
        };
        let bindings = entry.close();
        debug_assert!(!entry.is_open());
        debug!(owner = owner.0, bindings = bindings.len(), "scope owner destroyed");
        for binding in bindings.iter().filter_map(Weak::upgrade) {
            binding.remove();
        }
    }

    /// Allocates a fresh owner in this directory. The owner is reported
    /// destroyed when the returned value is dropped.
    pub fn owner(&self) -> ScopeOwner {
        let id = loop {
            let id = OwnerId(self.inner.next_owner.fetch_add(1, Ordering::Relaxed));
            if !self.inner.destroyed.contains(&id) {
                break id;
            }
        };
        ScopeOwner {
            scope: self.scope_for(id),
            directory: self.clone(),
        }
    }

    /// Number of owners that currently have a scope entry.
    pub fn len(&self) -> usize {
        self.inner.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.scopes.is_empty()
    }
}

impl Default for ScopeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopeDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeDirectory")
            .field("owners", &self.len())
            .finish()
    }
}

/// An owner whose lifetime is the lifetime of this value.
///
/// Useful when the host has no lifetime tracking of its own: embed a
/// `ScopeOwner` in the object that owns subscriptions and they are revoked
/// when that object is dropped.
pub struct ScopeOwner {
    directory: ScopeDirectory,
    scope: Scope,
}

impl ScopeOwner {
    /// Allocates an owner in the process-wide directory.
    pub fn new() -> Self {
        ScopeDirectory::global().owner()
    }

    pub fn id(&self) -> OwnerId {
        self.scope.owner()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Default for ScopeOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopeOwner {
    fn drop(&mut self) {
        // Allocated ids are never handed out again, so there is nothing to
        // remember.
        self.directory.tear_down(self.scope.owner());
    }
}

impl fmt::Debug for ScopeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeOwner")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::EventBinding;

    #[test]
    fn scope_for_reuses_entry() {
        let directory = ScopeDirectory::new();
        let a = directory.scope_for(OwnerId::new(7));
        let b = directory.scope_for(OwnerId::new(7));

        let core = BindingCore::new(None, Some(a.entry()));
        assert!(a.admit(&core));
        assert_eq!(b.binding_count(), 1);
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn owner_destruction_removes_bindings_and_entry() {
        let directory = ScopeDirectory::new();
        let scope = directory.scope_for(OwnerId::new(1));
        let core = BindingCore::new(None, Some(scope.entry()));
        assert!(scope.admit(&core));
        let binding = EventBinding::new(Arc::clone(&core));

        directory.on_owner_destroyed(OwnerId::new(1));

        assert!(binding.is_removed());
        assert!(!scope.is_alive());
        assert!(directory.is_empty());
    }

    #[test]
    fn duplicate_destruction_is_a_no_op() {
        let directory = ScopeDirectory::new();
        directory.scope_for(OwnerId::new(3));

        directory.on_owner_destroyed(OwnerId::new(3));
        directory.on_owner_destroyed(OwnerId::new(3));
        directory.on_owner_destroyed(OwnerId::new(99));

        assert!(directory.is_empty());
    }

    #[test]
    fn stale_owner_id_gets_a_dead_scope() {
        let directory = ScopeDirectory::new();
        directory.scope_for(OwnerId::new(11));
        directory.on_owner_destroyed(OwnerId::new(11));

        let stale = directory.scope_for(OwnerId::new(11));
        let core = BindingCore::new(None, Some(stale.entry()));

        assert!(!stale.is_alive());
        assert!(!stale.admit(&core));
        assert!(directory.is_empty());
    }

    #[test]
    fn dead_scope_refuses_bindings() {
        let directory = ScopeDirectory::new();
        let scope = directory.scope_for(OwnerId::new(5));
        directory.on_owner_destroyed(OwnerId::new(5));

        let core = BindingCore::new(None, Some(scope.entry()));
        assert!(!scope.admit(&core));
    }

    #[test]
    fn membership_is_weak() {
        let directory = ScopeDirectory::new();
        let scope = directory.scope_for(OwnerId::new(2));
        let core = BindingCore::new(None, Some(scope.entry()));
        assert!(scope.admit(&core));
        drop(core);

        // The dangling entry must not keep anything alive or trip destruction.
        directory.on_owner_destroyed(OwnerId::new(2));
        assert!(directory.is_empty());
    }

    #[test]
    fn scope_owner_reports_destruction_on_drop() {
        let directory = ScopeDirectory::new();
        let owner = directory.owner();
        let scope = owner.scope().clone();
        assert!(scope.is_alive());
        assert_eq!(directory.len(), 1);

        drop(owner);

        assert!(!scope.is_alive());
        assert!(directory.is_empty());
    }

    #[test]
    fn allocated_owners_skip_destroyed_host_ids() {
        let directory = ScopeDirectory::new();
        directory.on_owner_destroyed(OwnerId::new(1));

        let owner = directory.owner();
        assert_ne!(owner.id(), OwnerId::new(1));
        assert!(owner.scope().is_alive());
    }

    #[test]
    fn owners_get_distinct_ids() {
        let directory = ScopeDirectory::new();
        let a = directory.owner();
        let b = directory.owner();
        assert_ne!(a.id(), b.id());
    }
}
