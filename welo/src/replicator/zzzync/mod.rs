//! Replication through a naming system, a discovery network and a content distribution
//! backend, for peers that are rarely online at the same time.
//!
//! [`Zzzync::upload`] packs every block a peer needs to move from the previously published root
//! to the live one into a single archive, stores it with the [`Distributor`], points the
//! provider's [`Revision`] at the new root and, at most once per republish interval, announces
//! the provider on the database's discovery key.
//!
//! [`Zzzync::download`] discovers providers, resolves their revisions, diffs against each root
//! through the distributor and merges everything missing in one batch. A failing provider or
//! entry is reported and skipped; it never fails the batch.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, FutureExt, StreamExt};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, trace, warn};
use welo_base::{Block, Cid, PublicKey, SecretKey};
use welo_car::{CarHeader, CarWriter};

use super::{Config, Replicator, ReplicatorModule};
use crate::{
    blocks::{BlockFetcher, Blocks, Chained},
    datastore::{Datastore, Key},
    entry::Entry,
    error::{EntryError, MissingCapabilityError, ProviderError, ReplicatorError, StorageError},
    manifest::Address,
    playable::{Playable, Status},
    replica::{MergeOutcome, Replica},
};

pub mod advertiser;
pub mod mem;
pub mod namer;
pub mod w3;

pub use self::{
    advertiser::{Advertiser, DiscoveryEvent, PeerId, PeerInfo},
    namer::{NameService, Namer, Revision, RevisionState},
    w3::{Distributor, Response, W3Fetcher},
};

/// Protocol name of the zzzync replicator.
pub const PROTOCOL: &str = "/welo/replicator/zzzync/1.0.0";

/// Domain separation of discovery keys.
const DCID_DOMAIN: &str = "/welo/replicator/zzzync/dcid";

/// Root of the local state of the replicator. Each database gets its own subtree.
const STATE_PREFIX: &str = "/welo/replicator/zzzync";

/// Datastore subtree holding the provider key and revisions of one database.
pub fn state_prefix(address: &Address) -> Key {
    Key::new(STATE_PREFIX).child(address.cid().to_string())
}

/// The discovery key of a database.
///
/// Derived from, but never equal to, the manifest identifier, so providers of a database can be
/// found without announcing the manifest itself.
pub fn dcid(address: &Address) -> Cid {
    welo_base::block::derive(DCID_DOMAIN, address.cid())
}

/// Options of the zzzync replicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZzzyncConfig {
    /// Minimum time between two announcements on the discovery network.
    #[serde(with = "humantime_serde")]
    pub republish_interval: Duration,
    /// Entries fetched concurrently per provider during a download.
    pub fetch_concurrency: usize,
}

impl Default for ZzzyncConfig {
    fn default() -> Self {
        Self {
            republish_interval: Duration::from_secs(10 * 60 * 60),
            fetch_concurrency: 16,
        }
    }
}

/// Collaborators of the zzzync replicator.
#[derive(Debug, Clone, Default)]
pub struct ZzzyncOptions {
    /// Publishes and resolves revisions.
    pub name_service: Option<Arc<dyn NameService>>,
    /// Announces and discovers providers.
    pub advertiser: Option<Arc<dyn Advertiser>>,
    /// Stores archives and serves blocks.
    pub distributor: Option<Arc<dyn Distributor>>,
    /// Tuning.
    pub config: ZzzyncConfig,
}

/// Creates [`Zzzync`] replicators.
#[derive(Debug, Clone, Default)]
pub struct ZzzyncModule {
    options: ZzzyncOptions,
}

impl ZzzyncModule {
    /// A module with the given collaborators.
    pub fn new(options: ZzzyncOptions) -> Self {
        Self { options }
    }

    /// Create the concrete replicator.
    pub fn build(&self, config: Config) -> Result<Zzzync, MissingCapabilityError> {
        let missing = |capability| MissingCapabilityError {
            component: "zzzync replicator",
            capability,
        };
        let opts = &self.options;
        let name_service = opts.name_service.clone().ok_or(missing("name service"))?;
        let advertiser = opts.advertiser.clone().ok_or(missing("advertiser"))?;
        let distributor = opts.distributor.clone().ok_or(missing("distributor"))?;
        let state = state_prefix(&config.replica.address());
        let namer = Namer::new(
            name_service,
            RevisionState::new(config.datastore.clone(), state.child("revisions")),
        );
        Ok(Zzzync {
            dcid: dcid(&config.replica.address()),
            fetcher: W3Fetcher::new(distributor.clone()),
            replica: config.replica,
            blocks: config.blocks,
            datastore: config.datastore,
            namer,
            advertiser,
            distributor,
            config: opts.config.clone(),
            playable: Playable::new(),
            provider: parking_lot::Mutex::new(None),
            uploading: Mutex::new(None),
        })
    }
}

impl ReplicatorModule for ZzzyncModule {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn create(&self, config: Config) -> Result<Arc<dyn Replicator>, MissingCapabilityError> {
        Ok(Arc::new(self.build(config)?))
    }
}

/// Result of [`Zzzync::upload`].
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// The root now published.
    pub root: Cid,
    /// The new revision, `None` if the root was already published.
    pub revision: Option<Revision>,
    /// Blocks in the uploaded archive.
    pub blocks: usize,
    /// Whether the provider was announced on the discovery network.
    pub advertised: bool,
}

/// Result of [`Zzzync::download`].
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    /// Distinct providers found, not counting ourselves.
    pub providers: usize,
    /// Providers that were skipped.
    pub provider_failures: Vec<ProviderError>,
    /// Entries that could not be fetched.
    pub fetch_failures: Vec<EntryError>,
    /// The merge of everything fetched.
    pub merge: MergeOutcome,
}

/// The zzzync replicator.
#[derive(Debug)]
pub struct Zzzync {
    replica: Replica,
    blocks: Blocks,
    datastore: Arc<dyn Datastore>,
    namer: Namer,
    advertiser: Arc<dyn Advertiser>,
    distributor: Arc<dyn Distributor>,
    fetcher: W3Fetcher,
    config: ZzzyncConfig,
    dcid: Cid,
    playable: Playable,
    provider: parking_lot::Mutex<Option<SecretKey>>,
    /// Serializes uploads; holds the time of the last announcement.
    uploading: Mutex<Option<Instant>>,
}

impl Zzzync {
    /// The discovery key this replicator announces and queries.
    pub fn dcid(&self) -> &Cid {
        &self.dcid
    }

    /// The provider identity, once started.
    pub fn provider(&self) -> Option<PublicKey> {
        self.provider.lock().as_ref().map(SecretKey::public)
    }

    fn provider_key(&self) -> Result<SecretKey, ReplicatorError> {
        if self.playable.status() != Status::Started {
            return Err(ReplicatorError::NotStarted);
        }
        self.provider.lock().clone().ok_or(ReplicatorError::NotStarted)
    }

    async fn load_provider(&self) -> Result<SecretKey, ReplicatorError> {
        let key = state_prefix(&self.replica.address()).child("provider");
        if let Some(bytes) = self.datastore.get(&key).await.map_err(StorageError::from)? {
            let secret = SecretKey::try_from(&bytes[..]).map_err(|err| {
                StorageError::Backend(anyhow!("stored provider key is invalid: {err}"))
            })?;
            return Ok(secret);
        }
        let secret = SecretKey::generate(&mut OsRng);
        self.datastore
            .put(&key, Bytes::copy_from_slice(&secret.to_bytes()))
            .await
            .map_err(StorageError::from)?;
        info!(provider = %secret.public().fmt_short(), "generated provider key");
        Ok(secret)
    }

    /// Publish the local state.
    ///
    /// Uploads are serialized; a concurrent call waits for the running one.
    pub async fn upload(&self) -> Result<UploadOutcome, ReplicatorError> {
        let key = self.provider_key()?;
        let name = key.public();
        let mut last_advertised = self.uploading.lock().await;

        let prior = self.namer.revision(&name).await?;
        let prior_root = match &prior {
            Some(revision) => revision.root()?,
            None => Replica::empty_root(),
        };
        let root = self.replica.root().await;

        let mut outcome = UploadOutcome {
            root,
            revision: None,
            blocks: 0,
            advertised: false,
        };
        if prior.is_none() || root != prior_root {
            // the prior root's nodes may only exist remotely if local state was lost
            let diff = self
                .replica
                .diff_at(&root, &prior_root, Some(&self.fetcher))
                .await?;
            let mut blocks: Vec<Block> = Vec::new();
            for cid in diff.local_only() {
                let block = self.blocks.require(cid).await?;
                let entry = self
                    .replica
                    .decode(block.clone())
                    .map_err(|err| ReplicatorError::Storage(StorageError::Backend(err.into())))?;
                blocks.push(block);
                blocks.push(self.blocks.require(entry.auth()).await?);
            }
            if root != prior_root {
                blocks.extend(diff.shards.additions);
            } else {
                // first publish of an empty log: the root alone
                blocks.push(self.blocks.require(&root).await?);
            }

            let mut writer = CarWriter::new(CarHeader::new(vec![root]), Vec::new());
            for block in &blocks {
                writer.write(block).await?;
            }
            outcome.blocks = writer.len();
            let car = writer.finish().await?;
            self.distributor
                .put_archive(car.into())
                .await
                .map_err(ReplicatorError::Backend)?;
            let revision = self.namer.publish(&key, &root).await?;
            debug!(%root, sequence = revision.sequence, blocks = outcome.blocks, "uploaded");
            outcome.revision = Some(revision);
        }

        let now = Instant::now();
        let due = match *last_advertised {
            None => true,
            Some(last) => now.duration_since(last) > self.config.republish_interval,
        };
        if due {
            self.advertiser
                .collaborate(&self.dcid, &name)
                .await
                .map_err(ReplicatorError::Backend)?;
            *last_advertised = Some(now);
            outcome.advertised = true;
            debug!(dcid = %self.dcid, "advertised provider");
        }
        Ok(outcome)
    }

    /// Pull state from every discovered provider and merge it.
    pub async fn download(&self) -> Result<DownloadOutcome, ReplicatorError> {
        let me = self.provider_key()?.public();

        let mut providers: BTreeMap<String, PublicKey> = BTreeMap::new();
        let mut events = self.advertiser.find_collaborators(&self.dcid);
        while let Some(event) = events.next().await {
            let DiscoveryEvent::Provider { providers: found } = event else {
                continue;
            };
            for peer in found {
                match peer.id {
                    PeerId::Ed25519(key) if key != me => {
                        providers.entry(key.to_string()).or_insert(key);
                    }
                    PeerId::Ed25519(_) => {}
                    other => trace!(?other, "ignoring provider with foreign key type"),
                }
            }
        }

        let pulls = providers.values().map(|provider| self.pull(*provider));
        let results = future::join_all(pulls).await;

        let mut outcome = DownloadOutcome {
            providers: providers.len(),
            ..Default::default()
        };
        let mut fetched: BTreeMap<Cid, Entry> = BTreeMap::new();
        for result in results {
            match result {
                Ok((entries, failures)) => {
                    fetched.extend(entries.into_iter().map(|e| (*e.cid(), e)));
                    outcome.fetch_failures.extend(failures);
                }
                Err(err) => {
                    warn!(provider = %err.provider().fmt_short(), "skipping provider: {err}");
                    outcome.provider_failures.push(err);
                }
            }
        }

        outcome.merge = self.replica.merge(fetched.into_values()).await?;
        debug!(
            providers = outcome.providers,
            admitted = outcome.merge.admitted.len(),
            "downloaded"
        );
        Ok(outcome)
    }

    /// Fetch everything `provider` has that we lack.
    async fn pull(
        &self,
        provider: PublicKey,
    ) -> Result<(Vec<Entry>, Vec<EntryError>), ProviderError> {
        let root = match self.namer.resolve(&provider).await {
            Ok(Some(root)) => root,
            Ok(None) => return Err(ProviderError::Unresolved(provider)),
            Err(source) => return Err(ProviderError::Unreachable { provider, source }),
        };
        let diff = self
            .replica
            .diff(&root, Some(&self.fetcher))
            .await
            .map_err(|source| ProviderError::Diff { provider, source })?;

        let wanted: Vec<Cid> = diff.remote_only().copied().collect();
        trace!(provider = %provider.fmt_short(), wanted = wanted.len(), "diffed");
        let results: Vec<Result<Entry, EntryError>> = futures::stream::iter(wanted)
            .map(|cid| self.fetch_entry(cid))
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(provider = %provider.fmt_short(), "entry not fetched: {err}");
                    failures.push(err);
                }
            }
        }
        Ok((entries, failures))
    }

    /// Fetch an entry and make its identity available locally.
    async fn fetch_entry(&self, cid: Cid) -> Result<Entry, EntryError> {
        let fetcher = Chained::new(&self.blocks, &self.fetcher);
        let block = match fetcher.fetch(&cid).await {
            Ok(Some(block)) => block,
            Ok(None) => return Err(EntryError::Unavailable { cid }),
            Err(err) => {
                debug!(%cid, "fetching entry failed: {err}");
                return Err(EntryError::Unavailable { cid });
            }
        };
        let entry = self.replica.decode(block)?;
        let auth = *entry.auth();

        // both sources serve the same immutable record, take whichever answers first
        let verifier = self.replica.verifier();
        let direct = async {
            let block = self
                .fetcher
                .fetch(&auth)
                .await?
                .ok_or_else(|| anyhow!("identity {auth} not distributed"))?;
            verifier.as_identity(block)
        }
        .boxed();
        let local = verifier.fetch(&self.blocks, &auth).boxed();
        let (identity, _loser) = future::select_ok([direct, local])
            .await
            .map_err(|_| EntryError::UnresolvedIdentity { cid, auth })?;
        self.blocks
            .put(identity.block())
            .await
            .map_err(|_| EntryError::UnresolvedIdentity { cid, auth })?;
        Ok(entry)
    }
}

#[async_trait]
impl Replicator for Zzzync {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn start(&self) -> Result<(), ReplicatorError> {
        self.playable
            .start(|| async {
                let key = self.load_provider().await?;
                *self.provider.lock() = Some(key);
                Ok(())
            })
            .await
    }

    async fn stop(&self) -> Result<(), ReplicatorError> {
        // nothing to release, the network belongs to the collaborators
        self.playable.stop(|| async { Ok(()) }).await
    }

    fn status(&self) -> Status {
        self.playable.status()
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::{
        mem::{MemoryAdvertiser, MemoryDistributor, MemoryNameService},
        *,
    };
    use crate::{
        blocks::Blocks,
        datastore::MemoryDatastore,
        manifest::{Manifest, ManifestData},
        test_utils::{identities, manifest, replica, replica_with, STORE},
    };

    #[derive(Debug, Clone, Default)]
    struct Net {
        names: MemoryNameService,
        ads: MemoryAdvertiser,
        dist: MemoryDistributor,
    }

    impl Net {
        fn module(&self, config: ZzzyncConfig) -> ZzzyncModule {
            ZzzyncModule::new(ZzzyncOptions {
                name_service: Some(Arc::new(self.names.clone())),
                advertiser: Some(Arc::new(self.ads.clone())),
                distributor: Some(Arc::new(self.dist.clone())),
                config,
            })
        }
    }

    #[tokio::test]
    async fn missing_collaborators() {
        let ids = identities(20, 1);
        let replica = replica(&manifest(&[&ids[0]]), &ids[0]).await;
        let net = Net::default();
        let mut options = ZzzyncOptions {
            name_service: Some(Arc::new(net.names.clone())),
            advertiser: Some(Arc::new(net.ads.clone())),
            ..Default::default()
        };
        let err = ZzzyncModule::new(options.clone())
            .create(Config::new(replica.clone()))
            .unwrap_err();
        assert_eq!(err.capability, "distributor");
        options.name_service = None;
        let err = ZzzyncModule::new(options)
            .create(Config::new(replica))
            .unwrap_err();
        assert_eq!(err.capability, "name service");
    }

    #[tokio::test]
    async fn provider_key_is_stable() -> TestResult {
        let ids = identities(21, 1);
        let replica = replica(&manifest(&[&ids[0]]), &ids[0]).await;
        let net = Net::default();

        let first = net.module(Default::default()).build(Config::new(replica.clone()))?;
        assert!(first.provider().is_none());
        assert!(matches!(first.upload().await, Err(ReplicatorError::NotStarted)));
        first.start().await?;
        let provider = first.provider().expect("started");
        first.stop().await?;
        assert_eq!(first.status(), Status::Stopped);
        assert!(matches!(first.download().await, Err(ReplicatorError::NotStarted)));

        let second = net.module(Default::default()).build(Config::new(replica))?;
        second.start().await?;
        assert_eq!(second.provider(), Some(provider));
        Ok(())
    }

    #[tokio::test]
    async fn state_is_kept_per_database() -> TestResult {
        let ids = identities(23, 1);
        let first = manifest(&[&ids[0]]);
        let second =
            Manifest::create(ManifestData::new("second", STORE).writer(ids[0].identity().id()))?;
        assert_ne!(state_prefix(&first.address()), state_prefix(&second.address()));

        let blocks = Blocks::memory();
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let net = Net::default();
        let mut providers = Vec::new();
        for manifest in [&first, &second] {
            let replica = replica_with(manifest, &ids[0], blocks.clone(), datastore.clone()).await;
            let zzzync = net.module(Default::default()).build(Config::new(replica))?;
            zzzync.start().await?;
            providers.push(zzzync.provider().expect("started"));
        }
        assert_ne!(providers[0], providers[1]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn advertisement_is_throttled() -> TestResult {
        let ids = identities(22, 1);
        let replica = replica(&manifest(&[&ids[0]]), &ids[0]).await;
        let net = Net::default();
        let config = ZzzyncConfig {
            republish_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let zzzync = net.module(config).build(Config::new(replica.clone()))?;
        zzzync.start().await?;

        // the first upload publishes the empty root and announces
        let first = zzzync.upload().await?;
        assert!(first.advertised);
        assert_eq!(first.revision.as_ref().map(|r| r.sequence), Some(0));
        assert_eq!(first.root, Replica::empty_root());
        assert_eq!(net.ads.announcements(), 1);

        replica.write(&b"a"[..]).await?;
        let second = zzzync.upload().await?;
        assert!(!second.advertised);
        assert_eq!(second.revision.as_ref().map(|r| r.sequence), Some(1));
        // entry, identity and the new root leaf
        assert_eq!(second.blocks, 3);

        // nothing changed: no archive, no revision
        let archives = net.dist.archives();
        let third = zzzync.upload().await?;
        assert!(third.revision.is_none());
        assert_eq!(net.dist.archives(), archives);

        tokio::time::advance(Duration::from_secs(61)).await;
        let fourth = zzzync.upload().await?;
        assert!(fourth.advertised);
        assert_eq!(net.ads.announcements(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn dcid_is_derived() -> TestResult {
        let ids = identities(23, 1);
        let manifest = manifest(&[&ids[0]]);
        let d = dcid(&manifest.address());
        assert_ne!(&d, manifest.address().cid());
        assert_eq!(d, dcid(&manifest.address()));
        Ok(())
    }
}
