//! Resource store.
//!
//! In-memory index correlating CRs with the backend objects created for
//! them. Shared by every reconciler and the garbage collector, so all access
//! goes through short-held locks; no lock is ever held across an await.

use crate::resource::ObjectKey;
use nsx_client::Tag;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// Backend object owned by one CR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// UID of the owning CR
    pub uid: String,
    /// Resource type of the owning CR
    pub kind: &'static str,
    /// Namespaced name of the owning CR when it was last tracked
    pub key: ObjectKey,
    /// NSX policy path of the backend object
    pub backend_path: String,
    /// Tags written on the backend object
    pub tags: Vec<Tag>,
}

#[derive(Debug, Default)]
struct StoreInner {
    by_uid: HashMap<String, StoreEntry>,
    // kind -> key -> uid of the most recently tracked CR with that name
    by_key: HashMap<&'static str, HashMap<ObjectKey, String>>,
}

impl StoreInner {
    // Drops the key index only if it still points at `uid`
    fn remove_key(&mut self, kind: &str, key: &ObjectKey, uid: &str) {
        if let Some(keys) = self.by_key.get_mut(kind) {
            if keys.get(key).is_some_and(|owner| owner == uid) {
                keys.remove(key);
            }
        }
    }
}

/// Concurrency-safe CR UID -> backend object index
#[derive(Debug, Default)]
pub struct ResourceStore {
    inner: RwLock<StoreInner>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.uid`
    pub fn track(&self, entry: StoreEntry) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = inner.by_uid.get(&entry.uid).cloned() {
            if previous.key != entry.key {
                inner.remove_key(previous.kind, &previous.key, &entry.uid);
            }
        }
        inner
            .by_key
            .entry(entry.kind)
            .or_default()
            .insert(entry.key.clone(), entry.uid.clone());
        inner.by_uid.insert(entry.uid.clone(), entry);
    }

    /// Entry owned by a CR UID
    pub fn lookup(&self, uid: &str) -> Option<StoreEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_uid.get(uid).cloned()
    }

    /// Entry for a namespaced name, used once the CR body is gone
    pub fn lookup_by_key(&self, kind: &str, key: &ObjectKey) -> Option<StoreEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_key
            .get(kind)
            .and_then(|keys| keys.get(key))
            .and_then(|uid| inner.by_uid.get(uid))
            .cloned()
    }

    /// Remove the entry for a CR UID, returning it if it existed
    pub fn untrack(&self, uid: &str) -> Option<StoreEntry> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.by_uid.remove(uid)?;
        inner.remove_key(entry.kind, &entry.key, uid);
        Some(entry)
    }

    /// UIDs of every tracked CR of a kind
    pub fn list_tracked_ids(&self, kind: &str) -> BTreeSet<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_uid
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.uid.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(uid: &str, name: &str) -> StoreEntry {
        StoreEntry {
            uid: uid.to_string(),
            kind: "subnet",
            key: ObjectKey::new("ns-1", name),
            backend_path: format!("/vpcs/ns-1/subnets/{}", name),
            tags: vec![Tag::new("nsx-op/subnet_uid", uid)],
        }
    }

    #[test]
    fn test_track_and_lookup() {
        let store = ResourceStore::new();
        store.track(entry("uid-1", "web"));

        assert_eq!(store.lookup("uid-1").unwrap().backend_path, "/vpcs/ns-1/subnets/web");
        assert_eq!(
            store.lookup_by_key("subnet", &ObjectKey::new("ns-1", "web")).unwrap().uid,
            "uid-1"
        );
        assert!(store.lookup_by_key("ipaddressallocation", &ObjectKey::new("ns-1", "web")).is_none());
        assert!(store.lookup("uid-2").is_none());
    }

    #[test]
    fn test_untrack_is_idempotent() {
        let store = ResourceStore::new();
        store.track(entry("uid-1", "web"));

        assert!(store.untrack("uid-1").is_some());
        assert!(store.untrack("uid-1").is_none());
        assert!(store.is_empty());
        assert!(store.lookup_by_key("subnet", &ObjectKey::new("ns-1", "web")).is_none());
    }

    #[test]
    fn test_name_reuse_points_key_at_newest_uid() {
        let store = ResourceStore::new();
        store.track(entry("uid-old", "web"));
        store.track(entry("uid-new", "web"));

        let key = ObjectKey::new("ns-1", "web");
        assert_eq!(store.lookup_by_key("subnet", &key).unwrap().uid, "uid-new");

        // Untracking the old owner must not drop the index of the new one
        store.untrack("uid-old");
        assert_eq!(store.lookup_by_key("subnet", &key).unwrap().uid, "uid-new");
    }

    #[test]
    fn test_list_tracked_ids_filters_by_kind() {
        let store = ResourceStore::new();
        store.track(entry("uid-1", "a"));
        store.track(entry("uid-2", "b"));
        let mut other = entry("uid-3", "c");
        other.kind = "ipaddressallocation";
        store.track(other);

        let ids: Vec<String> = store.list_tracked_ids("subnet").into_iter().collect();
        assert_eq!(ids, vec!["uid-1".to_string(), "uid-2".to_string()]);
    }

    #[test]
    fn test_concurrent_track_untrack() {
        let store = Arc::new(ResourceStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let uid = format!("uid-{}-{}", t, i);
                        store.track(entry(&uid, &uid));
                        if i % 2 == 0 {
                            store.untrack(&uid);
                        }
                        // Every visible entry is whole
                        if let Some(e) = store.lookup(&uid) {
                            assert_eq!(e.key.name, uid);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8 * 100);
    }
}
