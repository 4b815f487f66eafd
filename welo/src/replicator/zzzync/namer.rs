//! Revision pointers: signed, sequenced records naming a provider's current root.

use std::{fmt::Debug, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use welo_base::{Cid, PublicKey, SecretKey, Signature, SignatureError};

use crate::{
    datastore::{Datastore, Key},
    error::{ReplicatorError, StorageError},
};

/// Namespace of revision values.
pub const IPFS_NAMESPACE: &str = "/ipfs/";

/// A provider's published pointer to its current index root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// The provider key, which is also the name.
    pub name: PublicKey,
    /// `/ipfs/<root>`.
    pub value: String,
    /// Increases with every publish.
    pub sequence: u64,
    /// Signature by `name` over the other fields.
    pub signature: Signature,
}

fn signed_bytes(name: &PublicKey, value: &str, sequence: u64) -> Vec<u8> {
    let mut out = b"welo/revision".to_vec();
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

impl Revision {
    /// Sign a revision pointing at `root`.
    pub fn new(key: &SecretKey, root: &Cid, sequence: u64) -> Self {
        let name = key.public();
        let value = format!("{IPFS_NAMESPACE}{root}");
        let signature = key.sign(&signed_bytes(&name, &value, sequence));
        Self {
            name,
            value,
            sequence,
            signature,
        }
    }

    /// Check the signature.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.name.verify(
            &signed_bytes(&self.name, &self.value, self.sequence),
            &self.signature,
        )
    }

    /// The root this revision points at.
    pub fn root(&self) -> Result<Cid, ReplicatorError> {
        let cid = self.value.strip_prefix(IPFS_NAMESPACE).ok_or_else(|| {
            ReplicatorError::InvalidRevision(format!(
                "value {:?} does not start with {IPFS_NAMESPACE}",
                self.value
            ))
        })?;
        Cid::try_from(cid).map_err(|err| ReplicatorError::InvalidRevision(err.to_string()))
    }
}

/// Contract of the naming system.
#[async_trait]
pub trait NameService: Debug + Send + Sync + 'static {
    /// Publish a revision. Fails for bad signatures and stale sequence numbers.
    async fn publish(&self, revision: Revision) -> Result<()>;
    /// The latest revision published under `name`, `None` if there is none.
    async fn resolve(&self, name: &PublicKey) -> Result<Option<Revision>>;
}

/// Local record of the last revision published per name.
#[derive(Debug, Clone)]
pub struct RevisionState {
    datastore: Arc<dyn Datastore>,
    prefix: Key,
}

impl RevisionState {
    /// Keep revisions in `datastore`, below `prefix`.
    pub fn new(datastore: Arc<dyn Datastore>, prefix: Key) -> Self {
        Self { datastore, prefix }
    }

    fn key(&self, name: &PublicKey) -> Key {
        self.prefix.child(name.to_string())
    }

    /// The last revision stored for `name`.
    pub async fn get(&self, name: &PublicKey) -> Result<Option<Revision>, StorageError> {
        match self.datastore.get(&self.key(name)).await? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a revision.
    pub async fn put(&self, revision: &Revision) -> Result<(), StorageError> {
        let bytes = postcard::to_stdvec(revision)?;
        self.datastore
            .put(&self.key(&revision.name), Bytes::from(bytes))
            .await?;
        Ok(())
    }
}

/// Publishes and resolves revisions, tracking sequence numbers locally.
#[derive(Debug, Clone)]
pub struct Namer {
    service: Arc<dyn NameService>,
    revisions: RevisionState,
}

impl Namer {
    /// Combine a name service with local revision state.
    pub fn new(service: Arc<dyn NameService>, revisions: RevisionState) -> Self {
        Self { service, revisions }
    }

    /// The last revision published under `name`: from local state, else from the service.
    pub async fn revision(&self, name: &PublicKey) -> Result<Option<Revision>, ReplicatorError> {
        if let Some(revision) = self.revisions.get(name).await? {
            return Ok(Some(revision));
        }
        self.service
            .resolve(name)
            .await
            .map_err(ReplicatorError::Backend)
    }

    /// Point `key`'s name at `root`.
    pub async fn publish(&self, key: &SecretKey, root: &Cid) -> Result<Revision, ReplicatorError> {
        let sequence = match self.revision(&key.public()).await? {
            Some(prior) => prior.sequence + 1,
            None => 0,
        };
        let revision = Revision::new(key, root, sequence);
        self.service
            .publish(revision.clone())
            .await
            .map_err(ReplicatorError::Backend)?;
        self.revisions.put(&revision).await?;
        Ok(revision)
    }

    /// The root `name` currently points at.
    ///
    /// Revisions with a bad signature, for another name or with an invalid value are errors.
    pub async fn resolve(&self, name: &PublicKey) -> Result<Option<Cid>> {
        let Some(revision) = self.service.resolve(name).await? else {
            return Ok(None);
        };
        if &revision.name != name {
            return Err(anyhow!("resolved revision for another name"));
        }
        revision.verify()?;
        Ok(Some(revision.root()?))
    }
}
