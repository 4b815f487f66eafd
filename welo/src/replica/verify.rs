//! Admission checks run for every entry a replica merges.

use bytes::Bytes;
use tracing::debug;
use welo_base::Block;

use crate::{
    access::Accessor,
    blocks::Blocks,
    entry::{Entry, EntryFormat},
    error::EntryError,
    identity::{Identity, IdentityVerifier},
};

/// Parse, resolve the identity, verify the signature, authorize.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pipeline<'a> {
    pub(crate) format: &'a dyn EntryFormat,
    pub(crate) verifier: &'a dyn IdentityVerifier,
    pub(crate) access: &'a dyn Accessor,
    pub(crate) blocks: &'a Blocks,
    pub(crate) tag: &'a Bytes,
}

impl Pipeline<'_> {
    /// Run all checks on a raw entry block.
    pub(crate) async fn check(&self, block: Block) -> Result<(Entry, Identity), EntryError> {
        let cid = *block.cid();
        let entry = self.format.as_entry(block)?;
        if entry.tag() != self.tag {
            return Err(EntryError::Malformed {
                cid,
                reason: "entry belongs to another database".into(),
            });
        }

        let auth = *entry.auth();
        let identity = self
            .verifier
            .fetch(self.blocks, &auth)
            .await
            .map_err(|err| {
                debug!(%cid, %auth, "identity not resolved: {err:#}");
                EntryError::UnresolvedIdentity { cid, auth }
            })?;

        if !self.format.verify(&entry, &identity, self.verifier) {
            return Err(EntryError::InvalidSignature { cid });
        }

        if !self.access.can_append(&entry, &identity) {
            return Err(EntryError::Unauthorized {
                cid,
                identity: *identity.id(),
            });
        }
        Ok((entry, identity))
    }
}
