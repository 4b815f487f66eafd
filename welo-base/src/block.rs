//! Self-verifying content blocks.

use std::fmt;

use bytes::Bytes;
use cid::Cid;
use multihash::{Code, MultihashDigest};

/// Multicodec for blocks whose bytes carry their own encoding.
pub const RAW: u64 = 0x55;

/// A wrapper around bytes with their [`Cid`].
///
/// The identifier is always derived from the bytes: a [`Block`] can only be built by hashing
/// data, or from a `(cid, data)` pair that has been checked to match.
#[derive(Clone, Eq, PartialEq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("cid", &self.cid.to_string())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Error returned when bytes do not hash to the identifier they were offered under.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// The digest of the data differs from the one in the identifier.
    #[error("block data does not match {0}")]
    HashMismatch(Cid),
    /// The identifier uses a hash function we do not know.
    #[error("unsupported multihash code {0:#x}")]
    UnsupportedHash(u64),
}

impl Block {
    /// Hash `data` and wrap it into a block.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(&data));
        Self { cid, data }
    }

    /// Build a block from bytes received for `cid`, checking that they hash to it.
    pub fn from_parts(cid: Cid, data: impl Into<Bytes>) -> Result<Self, BlockError> {
        let data = data.into();
        verify(&cid, &data)?;
        Ok(Self { cid, data })
    }

    /// The content identifier.
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// The raw bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Split into identifier and bytes.
    pub fn into_parts(self) -> (Cid, Bytes) {
        (self.cid, self.data)
    }
}

/// Check that `data` hashes to `cid`.
pub fn verify(cid: &Cid, data: &[u8]) -> Result<(), BlockError> {
    let code = cid.hash().code();
    let code = Code::try_from(code).map_err(|_| BlockError::UnsupportedHash(code))?;
    if code.digest(data) == *cid.hash() {
        Ok(())
    } else {
        Err(BlockError::HashMismatch(*cid))
    }
}

/// Derive a [`Cid`] from a domain separation tag and a seed identifier.
///
/// Used for keys that must be stable for everyone holding the same seed but must never
/// collide with the seed itself, e.g. discovery keys.
pub fn derive(domain: &str, seed: &Cid) -> Cid {
    let mut input = Vec::with_capacity(domain.len() + 64);
    input.extend_from_slice(domain.as_bytes());
    input.extend_from_slice(&seed.to_bytes());
    Cid::new_v1(RAW, Code::Sha2_256.digest(&input))
}
