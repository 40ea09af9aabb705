//! Stream registry: stream id to per-stream endpoint maps.
//!
//! The responder keeps two of these, one for senders (outbound producers)
//! and one for receivers (inbound sinks). Individual operations take the
//! lock briefly; the termination sweep iterates a snapshot taken under the
//! lock so that concurrent per-stream removals cannot interleave with it.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Concurrent map from stream id to a per-stream endpoint.
#[derive(Debug)]
pub struct StreamRegistry<T> {
    entries: Mutex<HashMap<u32, T>>,
}

impl<T: Clone> StreamRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert the entry for a stream id, replacing any previous entry.
    pub fn insert(&self, stream_id: u32, entry: T) {
        self.entries.lock().insert(stream_id, entry);
    }

    /// Clone out the entry for a stream id.
    pub fn get(&self, stream_id: u32) -> Option<T> {
        self.entries.lock().get(&stream_id).cloned()
    }

    /// Remove and return the entry for a stream id. Idempotent.
    pub fn remove(&self, stream_id: u32) -> Option<T> {
        self.entries.lock().remove(&stream_id)
    }

    /// True when the stream id has an entry.
    pub fn contains(&self, stream_id: u32) -> bool {
        self.entries.lock().contains_key(&stream_id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no streams are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of all entries, taken under the lock.
    pub fn snapshot(&self) -> Vec<(u32, T)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T: Clone> Default for StreamRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let registry = StreamRegistry::new();
        registry.insert(1, "a");
        registry.insert(3, "b");

        assert_eq!(registry.get(1), Some("a"));
        assert_eq!(registry.get(2), None);
        assert!(registry.contains(3));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(1), Some("a"));
        assert_eq!(registry.remove(1), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_replaces() {
        let registry = StreamRegistry::new();
        registry.insert(7, "old");
        registry.insert(7, "new");
        assert_eq!(registry.get(7), Some("new"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let registry = StreamRegistry::new();
        for id in [11, 13, 15] {
            registry.insert(id, id * 10);
        }

        let mut snapshot = registry.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, vec![(11, 110), (13, 130), (15, 150)]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parallel_inserts_and_removes() {
        use std::sync::Arc;

        let registry = Arc::new(StreamRegistry::new());
        let mut handles = Vec::new();
        for t in 0u32..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = t * 1000 + i;
                    registry.insert(id, id);
                    assert_eq!(registry.get(id), Some(id));
                    registry.remove(id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
