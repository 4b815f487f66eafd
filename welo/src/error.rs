//! Error types shared across the crate.
//!
//! Failures scoped to a single entry ([`EntryError`]) or a single provider ([`ProviderError`])
//! are recoverable: they are reported next to the successful results and never abort a batch.
//! [`StorageError`] propagates to whoever triggered the storage access, and
//! [`MissingCapabilityError`] aborts construction.

use welo_base::{Cid, PublicKey};

/// Why a candidate entry was not admitted into a replica.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntryError {
    /// The bytes do not decode into an entry.
    #[error("malformed entry {cid}: {reason}")]
    Malformed {
        /// Identifier of the offending block.
        cid: Cid,
        /// Decoder message.
        reason: String,
    },
    /// The identity referenced by `auth` could not be fetched or is not a valid identity.
    #[error("identity {auth} of entry {cid} could not be resolved")]
    UnresolvedIdentity {
        /// The entry.
        cid: Cid,
        /// The identity reference.
        auth: Cid,
    },
    /// The signature does not verify against the resolved identity.
    #[error("invalid signature on entry {cid}")]
    InvalidSignature {
        /// The entry.
        cid: Cid,
    },
    /// The identity may not write to this database.
    #[error("identity {identity} may not append entry {cid}")]
    Unauthorized {
        /// The entry.
        cid: Cid,
        /// The identity that signed it.
        identity: PublicKey,
    },
    /// The entry block could not be fetched.
    #[error("entry {cid} is not available")]
    Unavailable {
        /// The entry.
        cid: Cid,
    },
    /// Some causal parents are neither in the replica nor in the merged batch.
    #[error("entry {cid} is missing {} parent(s)", missing.len())]
    MissingParents {
        /// The entry.
        cid: Cid,
        /// Parents that never resolved.
        missing: Vec<Cid>,
    },
}

impl EntryError {
    /// Identifier of the entry this error is about.
    pub fn cid(&self) -> &Cid {
        match self {
            EntryError::Malformed { cid, .. }
            | EntryError::UnresolvedIdentity { cid, .. }
            | EntryError::InvalidSignature { cid }
            | EntryError::Unauthorized { cid, .. }
            | EntryError::Unavailable { cid }
            | EntryError::MissingParents { cid, .. } => cid,
        }
    }
}

/// Failure of the content store or the datastore.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend failed.
    #[error("storage backend: {0:#}")]
    Backend(#[from] anyhow::Error),
    /// A stored value could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] postcard::Error),
    /// A block that must be present is not.
    #[error("block {0} not found")]
    NotFound(Cid),
}

/// The local identity could not produce a signature.
#[derive(Debug, thiserror::Error)]
#[error("signing failed: {0}")]
pub struct SigningError(pub String);

/// Why a local write was refused.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The local identity could not sign the entry.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// The local identity is not allowed to write.
    #[error("identity {0} is not allowed to write")]
    Unauthorized(PublicKey),
    /// Persisting the entry failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A required collaborator was not supplied.
#[derive(Debug, thiserror::Error)]
#[error("{component} needs the {capability} capability")]
pub struct MissingCapabilityError {
    /// The component that cannot be built.
    pub component: &'static str,
    /// The missing capability.
    pub capability: &'static str,
}

/// Why a discovered provider was skipped.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Resolving the revision pointer failed.
    #[error("provider {provider} unreachable: {source:#}")]
    Unreachable {
        /// The provider.
        provider: PublicKey,
        /// Cause.
        source: anyhow::Error,
    },
    /// The provider has not published a revision yet.
    #[error("provider {0} has no revision")]
    Unresolved(PublicKey),
    /// The provider's index could not be walked.
    #[error("diffing against provider {provider} failed: {source}")]
    Diff {
        /// The provider.
        provider: PublicKey,
        /// Cause.
        source: StorageError,
    },
}

impl ProviderError {
    /// The provider this error is about.
    pub fn provider(&self) -> &PublicKey {
        match self {
            ProviderError::Unreachable { provider, .. } | ProviderError::Diff { provider, .. } => {
                provider
            }
            ProviderError::Unresolved(provider) => provider,
        }
    }
}

/// Failure of a replicator operation.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    /// The operation needs a started replicator.
    #[error("replicator is not started")]
    NotStarted,
    /// A revision could not be interpreted.
    #[error("invalid revision: {0}")]
    InvalidRevision(String),
    /// Local storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Building or reading an archive failed.
    #[error("archive: {0}")]
    Archive(#[from] welo_car::Error),
    /// An external collaborator failed.
    #[error("backend: {0:#}")]
    Backend(anyhow::Error),
}
