//! Entries: signed, content-addressed operations with explicit causal parents.

use std::fmt::Debug;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use welo_base::{Block, Cid, Signature};

use crate::{
    blocks::Blocks,
    error::{EntryError, SigningError},
    identity::{Identity, IdentityVerifier, LocalIdentity},
};

/// Protocol name of [`BasalEntry`].
pub const BASAL_PROTOCOL: &str = "/welo/entry/basal/1.0.0";

/// Encoding version written by [`BasalEntry`].
pub const VERSION: u32 = 1;

/// Encoded form of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    /// Encoding version.
    pub v: u32,
    /// Binds the entry to one database.
    pub tag: Bytes,
    /// Opaque operation.
    pub payload: Bytes,
    /// Causal parents, sorted and deduplicated.
    pub next: Vec<Cid>,
    /// Identity record of the author.
    pub auth: Cid,
    /// Signature over the other fields.
    pub sig: Signature,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    v: u32,
    tag: &'a [u8],
    payload: &'a [u8],
    next: &'a [Cid],
    auth: &'a Cid,
}

fn signed_bytes(
    v: u32,
    tag: &[u8],
    payload: &[u8],
    next: &[Cid],
    auth: &Cid,
) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_stdvec(&SignedFields {
        v,
        tag,
        payload,
        next,
        auth,
    })
}

impl EntryData {
    /// The canonical bytes covered by `sig`.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        signed_bytes(self.v, &self.tag, &self.payload, &self.next, &self.auth)
    }
}

/// A decoded entry together with its block.
#[derive(Debug, Clone)]
pub struct Entry {
    block: Block,
    data: EntryData,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.block.cid() == other.block.cid()
    }
}

impl Eq for Entry {}

impl Entry {
    /// Content identifier.
    pub fn cid(&self) -> &Cid {
        self.block.cid()
    }

    /// The block holding the encoded entry.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Decoded fields.
    pub fn data(&self) -> &EntryData {
        &self.data
    }

    /// The operation.
    pub fn payload(&self) -> &Bytes {
        &self.data.payload
    }

    /// Causal parents.
    pub fn next(&self) -> &[Cid] {
        &self.data.next
    }

    /// Identity reference.
    pub fn auth(&self) -> &Cid {
        &self.data.auth
    }

    /// Database tag.
    pub fn tag(&self) -> &Bytes {
        &self.data.tag
    }
}

/// Creates, decodes and checks entries of one format.
pub trait EntryFormat: Debug + Send + Sync + 'static {
    /// Protocol name this format is registered under.
    fn protocol(&self) -> &'static str;

    /// Build and sign a new entry.
    fn create(
        &self,
        identity: &LocalIdentity,
        tag: Bytes,
        payload: Bytes,
        next: Vec<Cid>,
    ) -> Result<Entry, SigningError>;

    /// Decode a block into an entry. Does not check the signature.
    fn as_entry(&self, block: Block) -> Result<Entry, EntryError>;

    /// Whether the entry's signature was made by `identity`.
    fn verify(&self, entry: &Entry, identity: &Identity, verifier: &dyn IdentityVerifier) -> bool;
}

/// The default entry format: a postcard encoded [`EntryData`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BasalEntry;

impl EntryFormat for BasalEntry {
    fn protocol(&self) -> &'static str {
        BASAL_PROTOCOL
    }

    fn create(
        &self,
        identity: &LocalIdentity,
        tag: Bytes,
        payload: Bytes,
        mut next: Vec<Cid>,
    ) -> Result<Entry, SigningError> {
        next.sort();
        next.dedup();
        let auth = *identity.identity().cid();
        let msg = signed_bytes(VERSION, &tag, &payload, &next, &auth)
            .map_err(|err| SigningError(err.to_string()))?;
        let sig = identity.sign(&msg)?;
        let data = EntryData {
            v: VERSION,
            tag,
            payload,
            next,
            auth,
            sig,
        };
        let block = Blocks::encode(&data).map_err(|err| SigningError(err.to_string()))?;
        Ok(Entry { block, data })
    }

    fn as_entry(&self, block: Block) -> Result<Entry, EntryError> {
        let malformed = |reason: String| EntryError::Malformed {
            cid: *block.cid(),
            reason,
        };
        let data: EntryData = Blocks::decode(&block).map_err(|err| malformed(err.to_string()))?;
        if data.v != VERSION {
            return Err(malformed(format!("unsupported version {}", data.v)));
        }
        if !data.next.windows(2).all(|w| w[0] < w[1]) {
            return Err(malformed("parents are not sorted and unique".into()));
        }
        if data.next.contains(block.cid()) {
            return Err(malformed("entry lists itself as parent".into()));
        }
        Ok(Entry { block, data })
    }

    fn verify(&self, entry: &Entry, identity: &Identity, verifier: &dyn IdentityVerifier) -> bool {
        if entry.auth() != identity.cid() {
            return false;
        }
        match entry.data.signed_bytes() {
            Ok(msg) => verifier.verify(&msg, &entry.data.sig, identity),
            Err(_) => false,
        }
    }
}
