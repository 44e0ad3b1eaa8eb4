//! String interner for tensor names and store keys.
//!
//! Ids are dense and stable for the lifetime of the store. The store is
//! shared between contexts through an `Arc`; lookups take a read lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Handle to an interned string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(u32);

impl StringId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
struct Inner {
    ids: HashMap<Arc<str>, StringId>,
    strings: Vec<Arc<str>>,
}

/// Thread-safe string interner.
#[derive(Default)]
pub struct StringStore {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for StringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringStore")
            .field("len", &self.len())
            .finish()
    }
}

impl StringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the existing id if it was seen before.
    pub fn intern(&self, s: &str) -> StringId {
        if let Some(&id) = self.inner.read().ids.get(s) {
            return id;
        }
        let mut inner = self.inner.write();
        // Another writer may have raced us between the two locks.
        if let Some(&id) = inner.ids.get(s) {
            return id;
        }
        let id = StringId(inner.strings.len() as u32);
        let shared: Arc<str> = Arc::from(s);
        inner.strings.push(shared.clone());
        inner.ids.insert(shared, id);
        id
    }

    /// Id of `s` if it has been interned.
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.inner.read().ids.get(s).copied()
    }

    /// The string behind `id`.
    pub fn get(&self, id: StringId) -> Option<Arc<str>> {
        self.inner.read().strings.get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
