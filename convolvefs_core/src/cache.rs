//! Cache of in-use file handlers.
//!
//! Concurrent opens of the same virtual path must share one handler, so
//! the conversion work runs once. The cache maps path → refcounted
//! handler; an entry lives exactly as long as its refcount is above zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::handler::FileHandler;

struct CacheEntry {
    handler: Arc<dyn FileHandler>,
    references: usize,
}

/// Thread-safe map from virtual path to live handler.
#[derive(Default)]
pub struct FileHandlerCache {
    map: Mutex<HashMap<String, CacheEntry>>,
}

impl FileHandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a handler and take a reference on it. The caller owes one
    /// [`FileHandlerCache::unpin`].
    pub fn find_and_pin(&self, key: &str) -> Option<Arc<dyn FileHandler>> {
        let mut map = self.map.lock().expect("handler cache poisoned");
        let entry = map.get_mut(key)?;
        entry.references += 1;
        Some(Arc::clone(&entry.handler))
    }

    /// Insert a freshly created handler, pinned. If another thread raced
    /// the creation and inserted first, the existing handler wins and the
    /// new one is discarded.
    pub fn insert_pinned(
        &self,
        key: &str,
        handler: Arc<dyn FileHandler>,
    ) -> Arc<dyn FileHandler> {
        use std::collections::hash_map::Entry;
        let mut map = self.map.lock().expect("handler cache poisoned");
        match map.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                debug!("{key}: discarding duplicate handler from racing open");
                occupied.get_mut().references += 1;
                Arc::clone(&occupied.get().handler)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CacheEntry {
                    handler,
                    references: 1,
                });
                Arc::clone(&entry.handler)
            }
        }
    }

    /// Drop one reference. The last unpin removes the entry and invokes
    /// [`FileHandler::close`] on the handler — outside the map lock, so a
    /// close waiting on an in-flight producer advance never blocks
    /// lookups of other paths.
    pub fn unpin(&self, key: &str) {
        let retired = {
            let mut map = self.map.lock().expect("handler cache poisoned");
            let Some(entry) = map.get_mut(key) else {
                debug_assert!(false, "unpin of unknown key {key}");
                return;
            };
            entry.references -= 1;
            if entry.references == 0 {
                map.remove(key)
            } else {
                None
            }
        };
        if let Some(entry) = retired {
            entry.handler.close();
            debug!("{key}: handler retired");
        }
    }

    /// Current reference count of a key, if present.
    pub fn references(&self, key: &str) -> Option<usize> {
        let map = self.map.lock().expect("handler cache poisoned");
        map.get(key).map(|entry| entry.references)
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("handler cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
