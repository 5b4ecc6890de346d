//! Cache key definitions

use std::fmt;

use crate::entity::EntityKind;

/// Cache key for one entity: `"{prefix}:{id}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Storage key used by the cache backend
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}", self.kind.cache_prefix(), self.id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.cache_prefix(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let key = CacheKey::new(EntityKind::Post, "p1");
        assert_eq!(key.to_storage_key(), "posts:p1");
        assert_eq!(key.to_string(), "posts:p1");
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let post = CacheKey::new(EntityKind::Post, "x");
        let note = CacheKey::new(EntityKind::Notification, "x");
        assert_ne!(post.to_storage_key(), note.to_storage_key());
    }
}
