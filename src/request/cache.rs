use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::core::{Entity, InstanceId, Result};

/// Per-request identity map: at most one live instance per (type, id).
///
/// Keys are plain type names or `"{subtype}!{supertype}"` inheritance keys.
pub struct ObjectEntityCache {
    entries: Mutex<LruCache<(String, String), Entity>>,
    uuids: Mutex<HashMap<InstanceId, String>>,
}

impl ObjectEntityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            uuids: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, type_key: &str, id: &str) -> Result<Option<Entity>> {
        let mut entries = self.entries.lock()?;
        Ok(entries.get(&(type_key.to_string(), id.to_string())).cloned())
    }

    pub fn put(&self, type_key: &str, id: &str, entity: &Entity) -> Result<()> {
        self.entries
            .lock()?
            .put((type_key.to_string(), id.to_string()), entity.clone());
        Ok(())
    }

    /// Stores the entity under its client uuid and remembers the reverse
    /// mapping.
    pub fn put_uuid(&self, type_key: &str, uuid: &str, entity: &Entity) -> Result<()> {
        self.put(type_key, uuid, entity)?;
        self.uuids
            .lock()?
            .entry(entity.instance_id())
            .or_insert_with(|| uuid.to_string());
        Ok(())
    }

    pub fn get_uuid(&self, entity: &Entity) -> Result<Option<String>> {
        Ok(self.uuids.lock()?.get(&entity.instance_id()).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.entries.lock()?.clear();
        self.uuids.lock()?.clear();
        Ok(())
    }
}

pub(crate) fn inheritance_key(subtype: &str, supertype: &str) -> String {
    format!("{}!{}", subtype, supertype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = ObjectEntityCache::new(8);
        let book = Entity::new("book");
        cache.put_uuid("book", "u-1", &book).unwrap();
        cache.put("book", "7", &book).unwrap();

        assert_eq!(cache.get("book", "u-1").unwrap(), Some(book.clone()));
        assert_eq!(cache.get("book", "7").unwrap(), Some(book.clone()));
        assert_eq!(cache.get("author", "u-1").unwrap(), None);
        assert_eq!(cache.get_uuid(&book).unwrap(), Some("u-1".to_string()));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ObjectEntityCache::new(2);
        for i in 0..3 {
            cache.put("book", &i.to_string(), &Entity::new("book")).unwrap();
        }
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.get("book", "0").unwrap().is_none());
        assert!(cache.get("book", "2").unwrap().is_some());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = ObjectEntityCache::new(0);
        cache.put("book", "1", &Entity::new("book")).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
    }
}
