//! Manifests: immutable descriptors pinning the protocols of one database.
//!
//! Two nodes open the same database iff they hold the same manifest identifier, its
//! [`Address`].

use std::{collections::BTreeMap, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use welo_base::{Block, Cid, PublicKey};

use crate::{
    access::{ANY, STATIC_PROTOCOL},
    blocks::Blocks,
    entry,
    error::StorageError,
    identity,
};

/// Prefix of the text form of an [`Address`].
pub const ADDRESS_PREFIX: &str = "/welo/";

/// A role bound to a protocol name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    /// Protocol name, looked up in the [`Registry`](crate::registry::Registry).
    pub protocol: String,
}

impl Protocol {
    /// Bind to `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
        }
    }
}

/// Parameters of the access module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessParams {
    /// Identity ids allowed to write, or `"*"` for anyone.
    pub write: Vec<String>,
}

/// The access module and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Protocol name.
    pub protocol: String,
    /// Parameters.
    pub config: AccessParams,
}

/// Encoded form of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestData {
    /// Human readable name.
    pub name: String,
    /// Store reducer protocol.
    pub store: Protocol,
    /// Access control.
    pub access: AccessConfig,
    /// Entry format protocol.
    pub entry: Protocol,
    /// Identity protocol.
    pub identity: Protocol,
    /// Overrides the tag entries are bound to. Defaults to the manifest identifier.
    pub tag: Option<Bytes>,
    /// Free form metadata.
    pub meta: BTreeMap<String, String>,
}

impl ManifestData {
    /// A manifest using the built-in entry, identity and access protocols, with an empty
    /// write list.
    pub fn new(name: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Protocol::new(store),
            access: AccessConfig {
                protocol: STATIC_PROTOCOL.to_string(),
                config: AccessParams::default(),
            },
            entry: Protocol::new(entry::BASAL_PROTOCOL),
            identity: Protocol::new(identity::BASAL_PROTOCOL),
            tag: None,
            meta: BTreeMap::new(),
        }
    }

    /// Allow `id` to write.
    pub fn writer(mut self, id: &PublicKey) -> Self {
        self.access.config.write.push(id.to_string());
        self
    }

    /// Allow anyone to write.
    pub fn write_any(mut self) -> Self {
        self.access.config.write.push(ANY.to_string());
        self
    }
}

/// A manifest together with its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    block: Block,
    data: ManifestData,
}

impl Manifest {
    /// Encode a manifest. Store it with [`Manifest::block`] to make it fetchable.
    pub fn create(data: ManifestData) -> Result<Self, StorageError> {
        let block = Blocks::encode(&data)?;
        Ok(Self { block, data })
    }

    /// Decode a manifest block.
    pub fn from_block(block: Block) -> Result<Self, StorageError> {
        let data = Blocks::decode(&block)?;
        Ok(Self { block, data })
    }

    /// Load the manifest an address points to.
    pub async fn fetch(blocks: &Blocks, address: &Address) -> Result<Self, StorageError> {
        let block = blocks.require(address.cid()).await?;
        Self::from_block(block)
    }

    /// The address of the database.
    pub fn address(&self) -> Address {
        Address(*self.block.cid())
    }

    /// The tag entries of this database carry.
    pub fn tag(&self) -> Bytes {
        match &self.data.tag {
            Some(tag) => tag.clone(),
            None => Bytes::from(self.block.cid().to_bytes()),
        }
    }

    /// The encoded manifest.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Decoded fields.
    pub fn data(&self) -> &ManifestData {
        &self.data
    }
}

/// Identifier of a database: the identifier of its manifest.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::Debug,
)]
#[display("{}{}", ADDRESS_PREFIX, _0)]
#[debug("Address({}{})", ADDRESS_PREFIX, _0)]
pub struct Address(Cid);

impl Address {
    /// Wrap a manifest identifier.
    pub fn new(cid: Cid) -> Self {
        Self(cid)
    }

    /// The manifest identifier.
    pub fn cid(&self) -> &Cid {
        &self.0
    }
}

/// Error when parsing an [`Address`].
#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    /// The text does not start with the address prefix.
    #[error("address must start with {ADDRESS_PREFIX}")]
    Prefix,
    /// The identifier part is not a valid cid.
    #[error("invalid manifest identifier: {0}")]
    Cid(#[from] cid::Error),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cid = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressParseError::Prefix)?;
        Ok(Self(Cid::try_from(cid)?))
    }
}
