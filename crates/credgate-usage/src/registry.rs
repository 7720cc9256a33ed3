use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe auth-id -> snapshot map.
///
/// Writers overwrite the previous snapshot atomically; `reset` exists so
/// tests never share state across cases.
#[derive(Debug, Default)]
pub struct SnapshotRegistry<T: Clone> {
    inner: RwLock<HashMap<String, T>>,
}

impl<T: Clone> SnapshotRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, auth_id: &str, snapshot: T) {
        if auth_id.is_empty() {
            return;
        }
        let mut map = self.inner.write().expect("snapshot registry lock");
        map.insert(auth_id.to_string(), snapshot);
    }

    pub fn get(&self, auth_id: &str) -> Option<T> {
        if auth_id.is_empty() {
            return None;
        }
        let map = self.inner.read().expect("snapshot registry lock");
        map.get(auth_id).cloned()
    }

    pub fn delete(&self, auth_id: &str) {
        if auth_id.is_empty() {
            return;
        }
        let mut map = self.inner.write().expect("snapshot registry lock");
        map.remove(auth_id);
    }

    pub fn reset(&self) {
        let mut map = self.inner.write().expect("snapshot registry lock");
        map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_get_delete_round_trip() {
        let registry: SnapshotRegistry<u32> = SnapshotRegistry::new();
        registry.update("a", 1);
        registry.update("a", 2);
        assert_eq!(registry.get("a"), Some(2));

        registry.delete("a");
        assert_eq!(registry.get("a"), None);
    }

    #[test]
    fn empty_auth_id_is_ignored() {
        let registry: SnapshotRegistry<u32> = SnapshotRegistry::new();
        registry.update("", 1);
        assert_eq!(registry.get(""), None);
    }

    #[test]
    fn reset_clears_everything() {
        let registry: SnapshotRegistry<u32> = SnapshotRegistry::new();
        registry.update("a", 1);
        registry.update("b", 2);
        registry.reset();
        assert_eq!(registry.get("a"), None);
        assert_eq!(registry.get("b"), None);
    }
}
