//! DHT record storage for namespaced keys

use std::collections::HashMap;

/// One value stored under a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: String,
    /// Unix seconds when the value was last stored or refreshed
    pub stored_at: u64,
}

/// Storage for DHT entries
pub struct RecordStore {
    /// Map from namespaced key to the values stored under it
    entries: HashMap<String, Vec<Record>>,
    /// Maximum values per key
    max_values_per_key: usize,
}

impl RecordStore {
    pub fn new(max_values_per_key: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_values_per_key: max_values_per_key.max(1),
        }
    }

    /// Store a value under a key, refreshing it if already present
    pub fn store(&mut self, key: &str, value: &str, now: u64) {
        let records = self.entries.entry(key.to_string()).or_default();

        if let Some(existing) = records.iter_mut().find(|r| r.value == value) {
            existing.stored_at = now;
            return;
        }

        let record = Record {
            value: value.to_string(),
            stored_at: now,
        };

        if records.len() < self.max_values_per_key {
            records.push(record);
        } else if let Some(oldest) = records.iter_mut().min_by_key(|r| r.stored_at) {
            // Replace oldest entry
            *oldest = record;
        }
    }

    /// Values stored under a key, oldest first
    pub fn get(&self, key: &str) -> Vec<String> {
        let mut records: Vec<&Record> = self.entries.get(key).into_iter().flatten().collect();
        records.sort_by_key(|r| r.stored_at);
        records.into_iter().map(|r| r.value.clone()).collect()
    }

    /// Remove records not refreshed since `min_timestamp`
    ///
    /// Returns the number of records dropped.
    pub fn cleanup(&mut self, min_timestamp: u64) -> usize {
        let mut removed = 0;
        for records in self.entries.values_mut() {
            let before = records.len();
            records.retain(|r| r.stored_at >= min_timestamp);
            removed += before - records.len();
        }
        self.entries.retain(|_, v| !v.is_empty());
        removed
    }

    /// Number of keys with at least one value
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let mut storage = RecordStore::new(10);
        storage.store("orca/market/abc", "10.0.0.1:8080", 1000);
        storage.store("orca/market/abc", "10.0.0.2:8080", 1001);

        assert_eq!(
            storage.get("orca/market/abc"),
            vec!["10.0.0.1:8080", "10.0.0.2:8080"]
        );
        assert!(storage.get("orca/market/other").is_empty());
    }

    #[test]
    fn test_restore_refreshes_instead_of_duplicating() {
        let mut storage = RecordStore::new(10);
        storage.store("k", "v", 1000);
        storage.store("k", "v", 2000);

        assert_eq!(storage.get("k"), vec!["v"]);
        assert_eq!(storage.cleanup(1500), 0);
    }

    #[test]
    fn test_oldest_replaced_when_full() {
        let mut storage = RecordStore::new(2);
        storage.store("k", "a", 1);
        storage.store("k", "b", 2);
        storage.store("k", "c", 3);

        assert_eq!(storage.get("k"), vec!["b", "c"]);
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let mut storage = RecordStore::new(10);
        storage.store("old", "a", 100);
        storage.store("new", "b", 500);

        assert_eq!(storage.cleanup(300), 1);
        assert!(storage.get("old").is_empty());
        assert_eq!(storage.key_count(), 1);
    }
}
