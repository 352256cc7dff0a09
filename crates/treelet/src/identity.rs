//! Identity cache: one canonical host object per worker handle.
//!
//! The worker hands out a [`NativeRef`] for every node and type it reports.
//! Decoding the same handle twice must not mint a second wrapper, or callers
//! that compare by pointer (or keep wrappers in identity-keyed containers)
//! would see two different objects for one entity.
//!
//! The cache lives exactly as long as one analysis session and is dropped in
//! full with it; there is no eviction.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::tree::{NativeRef, Node, TypeInfo};

/// Map from worker handle to canonical wrapper.
///
/// Lookup-or-insert runs under a single shard lock, so concurrent resolvers
/// of one handle observe exactly one materialization. Materializers are pure
/// decode steps; the lock is never held across I/O.
pub struct IdentityCache<T> {
    entries: DashMap<NativeRef, Arc<T>>,
}

impl<T> Default for IdentityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdentityCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the cached wrapper for `native`, materializing it on first sight.
    ///
    /// `materialize` is not called when the handle is already known.
    pub fn resolve<F>(&self, native: NativeRef, materialize: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        match self.entries.entry(native) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let value = Arc::new(materialize());
                entry.insert(Arc::clone(&value));
                value
            }
        }
    }

    /// Like [`resolve`](Self::resolve) with a fallible materializer.
    /// Nothing is cached when it fails.
    pub fn try_resolve<F, E>(&self, native: NativeRef, materialize: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match self.entries.entry(native) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let value = Arc::new(materialize()?);
                entry.insert(Arc::clone(&value));
                Ok(value)
            }
        }
    }

    /// Register an already-built wrapper. An existing entry wins.
    pub fn insert(&self, native: NativeRef, value: Arc<T>) -> Arc<T> {
        Arc::clone(self.entries.entry(native).or_insert(value).value())
    }

    pub fn get(&self, native: NativeRef) -> Option<Arc<T>> {
        self.entries.get(&native).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, native: NativeRef) -> bool {
        self.entries.contains_key(&native)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Caches for one analysis session.
#[derive(Default)]
pub struct SessionCache {
    pub nodes: IdentityCache<Node>,
    pub types: IdentityCache<TypeInfo>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}
