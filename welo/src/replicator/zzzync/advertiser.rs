//! Discovery of collaborators through a provider records network.

use std::fmt::{self, Debug};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use welo_base::{Cid, PublicKey};

/// Identity of a peer in the discovery network.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerId {
    /// An ed25519 key, usable as a revision name.
    Ed25519(PublicKey),
    /// Any other key type, ignored by the replicator.
    Other(Bytes),
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Ed25519(key) => write!(f, "PeerId::Ed25519({})", key.fmt_short()),
            PeerId::Other(bytes) => write!(f, "PeerId::Other({} bytes)", bytes.len()),
        }
    }
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Its identity.
    pub id: PeerId,
}

/// One step of a discovery query.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Peers that announced themselves as providers.
    Provider {
        /// The providers, possibly none.
        providers: Vec<PeerInfo>,
    },
    /// Any other query progress.
    Progress,
}

/// Contract of the discovery network.
#[async_trait]
pub trait Advertiser: Debug + Send + Sync + 'static {
    /// Announce `provider` as a collaborator on `dcid`.
    async fn collaborate(&self, dcid: &Cid, provider: &PublicKey) -> Result<()>;

    /// Run one discovery round for `dcid`. The stream ends when the round is over.
    fn find_collaborators(&self, dcid: &Cid) -> BoxStream<'static, DiscoveryEvent>;
}
