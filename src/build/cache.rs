//! Single-flight artifact cache.
//!
//! Every fingerprint owns a slot with its own lock. The first requester
//! builds while holding the slot lock; concurrent requesters for the same
//! fingerprint block on it and then reuse the result, so at most one build
//! runs per fingerprint. Failed builds leave the slot empty and the next
//! requester tries again.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

pub struct ArtifactCache<T> {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Arc<T>>>>>>,
}

impl<T> Default for ArtifactCache<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ArtifactCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Option<Arc<T>>>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// The cached value for `key`, building it with `build` on a miss.
    pub fn get_or_try_insert_with<E, F>(&self, key: &str, build: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let slot = self.slot(key);
        let mut value = slot.lock();
        if let Some(existing) = value.as_ref() {
            log::trace!("cache hit for {}", key);
            return Ok(Arc::clone(existing));
        }

        log::trace!("cache miss for {}", key);
        let built = Arc::new(build()?);
        *value = Some(Arc::clone(&built));
        Ok(built)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let slot = self.slots.lock().get(key).cloned()?;
        let value = slot.lock();
        value.clone()
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_requests_build_once() {
        let cache = Arc::new(ArtifactCache::<String>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                thread::spawn(move || {
                    cache
                        .get_or_try_insert_with("fp", || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok::<_, ()>("artifact".to_string())
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = ArtifactCache::<u32>::new();
        assert_eq!(cache.get_or_try_insert_with("k", || Err("boom")), Err("boom"));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_try_insert_with("k", || Ok::<_, &str>(7)).unwrap(), 7);
        assert_eq!(cache.len(), 1);
    }
}
