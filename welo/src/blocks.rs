//! Content-addressed block storage.
//!
//! [`ContentStore`] is the contract to the underlying block storage; [`Blocks`] is the handle
//! the rest of the crate uses. It encodes typed values into blocks and refuses bytes that do not
//! hash to the identifier they were requested under.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;
use welo_base::{Block, Cid};

use crate::error::StorageError;

/// Get/put of immutable byte blocks by content identifier.
#[async_trait]
pub trait ContentStore: Debug + Send + Sync + 'static {
    /// Fetch the bytes stored under `cid`.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;
    /// Store bytes under `cid`.
    async fn put(&self, cid: Cid, data: Bytes) -> Result<()>;
    /// Whether bytes are stored under `cid`.
    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.get(cid).await?.is_some())
    }
}

/// Something blocks can be fetched from: the local store, a remote backend, or both.
#[async_trait]
pub trait BlockFetcher: Debug + Send + Sync {
    /// Fetch a verified block, `None` if it is not available from this source.
    async fn fetch(&self, cid: &Cid) -> Result<Option<Block>, StorageError>;
}

/// In memory [`ContentStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blocks: Arc<RwLock<HashMap<Cid, Bytes>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().get(cid).cloned())
    }

    async fn put(&self, cid: Cid, data: Bytes) -> Result<()> {
        self.blocks.write().insert(cid, data);
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }
}

/// Shared handle to a [`ContentStore`].
#[derive(Debug, Clone)]
pub struct Blocks {
    store: Arc<dyn ContentStore>,
}

impl Blocks {
    /// Wrap a content store.
    pub fn new(store: impl ContentStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Blocks backed by a fresh [`MemoryStore`].
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Fetch a block.
    ///
    /// Bytes that do not hash to `cid` are treated as missing.
    pub async fn get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        let Some(data) = self.store.get(cid).await? else {
            return Ok(None);
        };
        match Block::from_parts(*cid, data) {
            Ok(block) => Ok(Some(block)),
            Err(err) => {
                warn!(%cid, "content store returned corrupt block: {err}");
                Ok(None)
            }
        }
    }

    /// Fetch a block that must exist.
    pub async fn require(&self, cid: &Cid) -> Result<Block, StorageError> {
        self.get(cid).await?.ok_or(StorageError::NotFound(*cid))
    }

    /// Store a block.
    pub async fn put(&self, block: &Block) -> Result<(), StorageError> {
        self.store
            .put(*block.cid(), block.data().clone())
            .await
            .map_err(StorageError::from)
    }

    /// Whether a block is stored locally.
    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        self.store.has(cid).await.map_err(StorageError::from)
    }

    /// Encode `value` into a block without storing it.
    pub fn encode<T: Serialize>(value: &T) -> Result<Block, StorageError> {
        let bytes = postcard::to_stdvec(value)?;
        Ok(Block::new(bytes))
    }

    /// Decode a block into a typed value.
    pub fn decode<T: DeserializeOwned>(block: &Block) -> Result<T, postcard::Error> {
        postcard::from_bytes(block.data())
    }
}

#[async_trait]
impl BlockFetcher for Blocks {
    async fn fetch(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        self.get(cid).await
    }
}

/// Tries each fetcher in order and returns the first hit.
///
/// Blocks found by a later fetcher are written back into `cache`, so a remote walk only pays for
/// every block once.
#[derive(Debug)]
pub struct Chained<'a> {
    cache: &'a Blocks,
    remote: &'a dyn BlockFetcher,
}

impl<'a> Chained<'a> {
    /// Look in `cache` first, then in `remote`.
    pub fn new(cache: &'a Blocks, remote: &'a dyn BlockFetcher) -> Self {
        Self { cache, remote }
    }
}

#[async_trait]
impl BlockFetcher for Chained<'_> {
    async fn fetch(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        if let Some(block) = self.cache.get(cid).await? {
            return Ok(Some(block));
        }
        let Some(block) = self.remote.fetch(cid).await? else {
            return Ok(None);
        };
        self.cache.put(&block).await?;
        Ok(Some(block))
    }
}
