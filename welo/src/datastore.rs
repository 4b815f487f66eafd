//! Key-value companion store for small pieces of local state.
//!
//! Holds what must survive restarts but is not content addressed: the provider key of a
//! replicator, the last published revisions and the index root of each replica.

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

/// A slash separated, namespaced key like `/welo/replicator/zzzync/provider`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Create a key, normalizing it to start with exactly one `/` and not end with one.
    pub fn new(key: impl AsRef<str>) -> Self {
        let parts: Vec<&str> = key.as_ref().split('/').filter(|p| !p.is_empty()).collect();
        Self(format!("/{}", parts.join("/")))
    }

    /// Append a child segment.
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self::new(format!("{}/{}", self.0, segment.as_ref()))
    }

    /// Whether `self` is `prefix` or lies below it.
    pub fn is_descendant_of(&self, prefix: &Key) -> bool {
        self == prefix
            || prefix.0 == "/"
            || (self.0.starts_with(&prefix.0) && self.0[prefix.0.len()..].starts_with('/'))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contract of the key-value store.
#[async_trait]
pub trait Datastore: fmt::Debug + Send + Sync + 'static {
    /// Read a value.
    async fn get(&self, key: &Key) -> Result<Option<Bytes>>;
    /// Write a value.
    async fn put(&self, key: &Key, value: Bytes) -> Result<()>;
    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &Key) -> Result<()>;
}

/// In memory [`Datastore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    values: Arc<RwLock<BTreeMap<Key, Bytes>>>,
}

impl MemoryDatastore {
    /// Create an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys at or below `prefix`.
    pub fn keys(&self, prefix: &Key) -> Vec<Key> {
        self.values
            .read()
            .keys()
            .filter(|k| k.is_descendant_of(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Bytes>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn put(&self, key: &Key, value: Bytes) -> Result<()> {
        self.values.write().insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized() {
        assert_eq!(Key::new("a/b/").as_str(), "/a/b");
        assert_eq!(Key::new("//a//b").as_str(), "/a/b");
        assert_eq!(Key::new("/a").child("b/c").as_str(), "/a/b/c");
        assert_eq!(Key::new("").as_str(), "/");
    }

    #[test]
    fn descendants() {
        let root = Key::new("/welo/replica");
        assert!(Key::new("/welo/replica/x/root").is_descendant_of(&root));
        assert!(root.is_descendant_of(&root));
        assert!(!Key::new("/welo/replicas").is_descendant_of(&root));
        assert!(root.is_descendant_of(&Key::new("/")));
    }

    #[tokio::test]
    async fn put_get_delete() -> anyhow::Result<()> {
        let store = MemoryDatastore::new();
        let key = Key::new("/provider");
        assert!(store.get(&key).await?.is_none());
        store.put(&key, Bytes::from_static(b"k")).await?;
        assert_eq!(store.get(&key).await?, Some(Bytes::from_static(b"k")));
        assert_eq!(store.keys(&Key::new("/")), vec![key.clone()]);
        store.delete(&key).await?;
        store.delete(&key).await?;
        assert!(store.get(&key).await?.is_none());
        Ok(())
    }
}
