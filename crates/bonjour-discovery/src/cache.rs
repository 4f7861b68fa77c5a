//! Concurrency-safe store of resolved services

use crate::types::{ScanResult, ServiceIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Mapping from service identity to its last resolved record.
///
/// Every operation takes the lock once, so each call is atomic with respect to
/// every other call. `set_many` commits several records under one write lock.
#[derive(Debug, Default)]
pub struct ServiceCache {
    entries: RwLock<HashMap<ServiceIdentity, ScanResult>>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ServiceIdentity) -> Option<ScanResult> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ServiceIdentity) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Inserts or replaces the record for `key`
    pub fn set(&self, key: ServiceIdentity, value: ScanResult) {
        self.entries.write().insert(key, value);
    }

    /// Upserts a group of records atomically
    pub fn set_many(&self, records: impl IntoIterator<Item = (ServiceIdentity, ScanResult)>) {
        let mut entries = self.entries.write();
        for (key, value) in records {
            entries.insert(key, value);
        }
    }

    /// Removes `key`, returning the previous record if there was one
    pub fn remove(&self, key: &ServiceIdentity) -> Option<ScanResult> {
        self.entries.write().remove(key)
    }

    /// Snapshot of all current records, ordered by identity
    pub fn get_all(&self) -> Vec<ScanResult> {
        let entries = self.entries.read();
        let mut snapshot: Vec<(&ServiceIdentity, &ScanResult)> = entries.iter().collect();
        snapshot.sort_by(|a, b| a.0.cmp(b.0));
        snapshot.into_iter().map(|(_, value)| value.clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn identity(name: &str) -> ServiceIdentity {
        ServiceIdentity::new(name, "_http._tcp", Some("local"))
    }

    fn record(name: &str, ip: &str) -> ScanResult {
        ScanResult {
            name: name.to_string(),
            ipv4: Some(ip.to_string()),
            ipv6: None,
            hostname: None,
            port: Some(80),
        }
    }

    #[test]
    fn test_set_get_remove() {
        let cache = ServiceCache::new();
        cache.set(identity("a"), record("a", "10.0.0.1"));

        assert_eq!(cache.get(&identity("a")).unwrap().ipv4.unwrap(), "10.0.0.1");
        assert!(cache.contains(&identity("a")));

        let removed = cache.remove(&identity("a"));
        assert!(removed.is_some());
        assert!(cache.remove(&identity("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_replaces() {
        let cache = ServiceCache::new();
        cache.set(identity("a"), record("a", "10.0.0.1"));
        cache.set(identity("a"), record("a", "10.0.0.2"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&identity("a")).unwrap().ipv4.unwrap(), "10.0.0.2");
    }

    #[test]
    fn test_get_all_and_clear() {
        let cache = ServiceCache::new();
        cache.set_many(vec![
            (identity("b"), record("b", "10.0.0.2")),
            (identity("a"), record("a", "10.0.0.1")),
        ]);

        let names: Vec<String> = cache.get_all().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        cache.clear();
        assert!(cache.get_all().is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = Arc::new(ServiceCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let name = format!("svc-{}-{}", i, j);
                        cache.set(identity(&name), record(&name, "10.0.0.1"));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
    }
}
