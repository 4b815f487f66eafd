//! In memory collaborators of the zzzync replicator, for tests and single process setups.
//!
//! Handles are cheap to clone and share state, so several replicators can use the same
//! simulated network.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use welo_base::{Cid, PublicKey};

use super::{
    advertiser::{Advertiser, DiscoveryEvent, PeerId, PeerInfo},
    namer::{NameService, Revision},
    w3::{Distributor, Response, STATUS_OK},
};

/// In memory [`NameService`].
#[derive(Debug, Clone, Default)]
pub struct MemoryNameService {
    revisions: Arc<RwLock<HashMap<PublicKey, Revision>>>,
    unreachable: Arc<RwLock<HashSet<PublicKey>>>,
}

impl MemoryNameService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make resolving `name` fail.
    pub fn set_unreachable(&self, name: PublicKey, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }
}

#[async_trait]
impl NameService for MemoryNameService {
    async fn publish(&self, revision: Revision) -> Result<()> {
        revision.verify()?;
        let mut revisions = self.revisions.write();
        if let Some(current) = revisions.get(&revision.name) {
            ensure!(
                revision.sequence > current.sequence,
                "stale revision {} for {}, current is {}",
                revision.sequence,
                revision.name.fmt_short(),
                current.sequence
            );
        }
        revisions.insert(revision.name, revision);
        Ok(())
    }

    async fn resolve(&self, name: &PublicKey) -> Result<Option<Revision>> {
        if self.unreachable.read().contains(name) {
            bail!("name service unreachable for {}", name.fmt_short());
        }
        Ok(self.revisions.read().get(name).cloned())
    }
}

/// In memory [`Advertiser`].
#[derive(Debug, Clone, Default)]
pub struct MemoryAdvertiser {
    records: Arc<RwLock<BTreeMap<Cid, Vec<PeerId>>>>,
    announcements: Arc<AtomicUsize>,
}

impl MemoryAdvertiser {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw provider record, including duplicates and foreign key types.
    pub fn announce(&self, dcid: Cid, peer: PeerId) {
        self.records.write().entry(dcid).or_default().push(peer);
    }

    /// Number of [`Advertiser::collaborate`] calls so far.
    pub fn announcements(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advertiser for MemoryAdvertiser {
    async fn collaborate(&self, dcid: &Cid, provider: &PublicKey) -> Result<()> {
        self.announcements.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.write();
        let peers = records.entry(*dcid).or_default();
        let peer = PeerId::Ed25519(*provider);
        if !peers.contains(&peer) {
            peers.push(peer);
        }
        Ok(())
    }

    fn find_collaborators(&self, dcid: &Cid) -> BoxStream<'static, DiscoveryEvent> {
        let peers = self.records.read().get(dcid).cloned().unwrap_or_default();
        let events = std::iter::once(DiscoveryEvent::Progress).chain(peers.into_iter().map(|id| {
            DiscoveryEvent::Provider {
                providers: vec![PeerInfo { id }],
            }
        }));
        stream::iter(events).boxed()
    }
}

/// In memory [`Distributor`]: ingests archives and serves their blocks.
#[derive(Debug, Clone, Default)]
pub struct MemoryDistributor {
    blocks: Arc<RwLock<HashMap<Cid, Bytes>>>,
    offline: Arc<AtomicBool>,
    archives: Arc<AtomicUsize>,
}

impl MemoryDistributor {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of archives stored so far.
    pub fn archives(&self) -> usize {
        self.archives.load(Ordering::SeqCst)
    }

    /// Forget a block, as if it was never uploaded. Returns whether it was held.
    pub fn remove(&self, cid: &Cid) -> bool {
        self.blocks.write().remove(cid).is_some()
    }

    /// Number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether no block is held.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    fn check_online(&self) -> Result<()> {
        ensure!(!self.offline.load(Ordering::SeqCst), "distributor offline");
        Ok(())
    }
}

#[async_trait]
impl Distributor for MemoryDistributor {
    async fn put_archive(&self, car: Bytes) -> Result<Cid> {
        self.check_online()?;
        let (header, blocks) = welo_car::unpack(&car).await?;
        let root = *header
            .roots()
            .first()
            .ok_or_else(|| anyhow!("archive without root"))?;
        let mut store = self.blocks.write();
        for block in blocks {
            let (cid, data) = block.into_parts();
            store.insert(cid, data);
        }
        self.archives.fetch_add(1, Ordering::SeqCst);
        Ok(root)
    }

    async fn get(&self, cid: &Cid) -> Result<Response> {
        self.check_online()?;
        Ok(match self.blocks.read().get(cid) {
            Some(body) => Response {
                status: STATUS_OK,
                body: body.clone(),
            },
            None => Response {
                status: 404,
                body: Bytes::new(),
            },
        })
    }
}
