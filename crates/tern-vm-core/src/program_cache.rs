//! Compiled program cache
//!
//! Keeps recently compiled programs by source text so evaluating the same
//! source twice skips the compiler. Each cached code holds the cache
//! reference on its [`StaticCode`]; eviction releases it.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tern_vm_bytecode::StaticCode;

struct Entry {
    code: Arc<StaticCode>,
    last_used: u64,
}

struct Inner {
    entries: FxHashMap<Arc<str>, Entry>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// Least-recently-used cache of compiled programs
pub struct ProgramCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ProgramCache {
    /// Create a cache holding at most `capacity` programs
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                clock: 0,
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Cached code for a source text
    pub fn get(&self, source: &str) -> Option<Arc<StaticCode>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let now = inner.clock;
        match inner.entries.get_mut(source) {
            Some(entry) => {
                entry.last_used = now;
                let code = Arc::clone(&entry.code);
                inner.hits += 1;
                Some(code)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Cache code under its source text.
    ///
    /// Returns false when the code is already owned by a cache or the cache
    /// is disabled.
    pub fn insert(&self, source: Arc<str>, code: Arc<StaticCode>) -> bool {
        if self.capacity == 0 || !code.acquire_cache_ref() {
            return false;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let now = inner.clock;
        if let Some(previous) = inner.entries.insert(
            source,
            Entry {
                code,
                last_used: now,
            },
        ) {
            previous.code.release_cache_ref();
        }
        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(source, _)| Arc::clone(source));
            let Some(oldest) = oldest else { break };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                tracing::trace!(target: "tern::vm", source_len = oldest.len(), "program cache eviction");
                evicted.code.release_cache_ref();
            }
        }
        true
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.entries.drain() {
            entry.code.release_cache_ref();
        }
    }

    /// Number of cached programs
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` so far
    pub fn hit_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}

impl Drop for ProgramCache {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
