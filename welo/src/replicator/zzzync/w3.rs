//! Adapter from the content distribution backend to the index's block fetcher.

use std::{fmt::Debug, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use welo_base::{Block, Cid};

use crate::{blocks::BlockFetcher, error::StorageError};

/// Status of a successful [`Distributor::get`].
pub const STATUS_OK: u16 = 200;

/// Reply of the distribution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP like status code.
    pub status: u16,
    /// Block bytes when `status` is [`STATUS_OK`].
    pub body: Bytes,
}

/// Contract of the content distribution backend.
#[async_trait]
pub trait Distributor: Debug + Send + Sync + 'static {
    /// Store an archive. Returns the archive's root.
    async fn put_archive(&self, car: Bytes) -> Result<Cid>;
    /// Retrieve a block.
    async fn get(&self, cid: &Cid) -> Result<Response>;
}

/// Fetches blocks from a [`Distributor`].
///
/// Anything but [`STATUS_OK`] with bytes hashing to the requested identifier counts as missing.
#[derive(Debug, Clone)]
pub struct W3Fetcher {
    distributor: Arc<dyn Distributor>,
}

impl W3Fetcher {
    /// Fetch through `distributor`.
    pub fn new(distributor: Arc<dyn Distributor>) -> Self {
        Self { distributor }
    }
}

#[async_trait]
impl BlockFetcher for W3Fetcher {
    async fn fetch(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        let response = self.distributor.get(cid).await?;
        if response.status != STATUS_OK {
            debug!(%cid, status = response.status, "block not available");
            return Ok(None);
        }
        match Block::from_parts(*cid, response.body) {
            Ok(block) => Ok(Some(block)),
            Err(err) => {
                warn!(%cid, "distributor returned corrupt block: {err}");
                Ok(None)
            }
        }
    }
}
