//! The replica: a node's copy of the signed entry log of one database.
//!
//! Entries form a causal graph; their identifiers are also kept in a content-addressed
//! [`shard`] index whose root summarizes the whole log. Writes and merges are serialized on the
//! graph so an entry is never admitted before its parents.

use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use welo_base::{Block, Cid};

use crate::{
    access::Accessor,
    blocks::{BlockFetcher, Blocks, Chained},
    datastore::{Datastore, Key},
    entry::{Entry, EntryFormat},
    error::{EntryError, StorageError, WriteError},
    identity::{IdentityVerifier, LocalIdentity},
    manifest::{Address, Manifest},
    registry::Components,
};

mod graph;
pub mod shard;
mod verify;

use self::{graph::Graph, verify::Pipeline};
pub use self::shard::{Diff, Presence, ShardDiff};

/// Capacity of the event channel. Slow subscribers observe a lag error and should resync from
/// [`Replica::traverse`].
const EVENT_CAPACITY: usize = 256;

/// Where admitted entries came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Origin {
    /// Written on this node.
    Local,
    /// Merged from elsewhere.
    Remote,
}

/// Notifications sent to [`Replica::subscribe`]rs.
#[derive(Debug, Clone)]
pub enum Event {
    /// Entries were admitted, in causal order.
    Update {
        /// Where they came from.
        origin: Origin,
        /// The admitted entries.
        entries: Vec<Entry>,
    },
    /// The replica was closed.
    Closed,
}

/// Result of [`Replica::merge`].
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Newly admitted entries, in causal order.
    pub admitted: Vec<Entry>,
    /// Entries that were not admitted and why.
    pub rejected: Vec<EntryError>,
}

/// What a replica is built from.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    /// The database.
    pub manifest: Manifest,
    /// Block storage.
    pub blocks: Blocks,
    /// Companion key-value store, holds the index root.
    pub datastore: Arc<dyn Datastore>,
    /// Identity used to sign local writes.
    pub identity: LocalIdentity,
    /// Protocol modules resolved from the manifest.
    pub components: Components,
}

/// Handle to a replica. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Replica {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    manifest: Manifest,
    blocks: Blocks,
    datastore: Arc<dyn Datastore>,
    identity: LocalIdentity,
    access: Arc<dyn Accessor>,
    format: Arc<dyn EntryFormat>,
    verifier: Arc<dyn IdentityVerifier>,
    tag: Bytes,
    root_key: Key,
    graph: Mutex<Graph>,
    events: broadcast::Sender<Event>,
}

impl Inner {
    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            format: self.format.as_ref(),
            verifier: self.verifier.as_ref(),
            access: self.access.as_ref(),
            blocks: &self.blocks,
            tag: &self.tag,
        }
    }

    /// Verify entries outside the graph lock. Known and duplicate entries are skipped.
    async fn check_all(
        &self,
        entries: impl IntoIterator<Item = Entry>,
    ) -> (Vec<Entry>, Vec<EntryError>) {
        let mut seen = BTreeSet::new();
        let mut fresh = Vec::new();
        {
            let graph = self.graph.lock().await;
            for entry in entries {
                if !graph.has(entry.cid()) && seen.insert(*entry.cid()) {
                    fresh.push(entry);
                }
            }
        }

        let pipeline = self.pipeline();
        let mut checked = Vec::new();
        let mut rejected = Vec::new();
        for entry in fresh {
            match pipeline.check(entry.block().clone()).await {
                Ok((entry, _identity)) => checked.push(entry),
                Err(err) => {
                    warn!(db = %self.manifest.address(), "rejected entry: {err}");
                    rejected.push(err);
                }
            }
        }
        (checked, rejected)
    }

    /// Index, persist and add entries that are in causal order with all parents present.
    async fn admit(&self, graph: &mut Graph, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            self.blocks.put(entry.block()).await?;
        }
        let keys: Vec<Cid> = entries.iter().map(|e| *e.cid()).collect();
        let update = shard::insert(&self.blocks, &graph.root, keys).await?;
        for block in &update.blocks {
            self.blocks.put(block).await?;
        }
        self.datastore
            .put(&self.root_key, Bytes::from(update.root.to_bytes()))
            .await?;
        graph.root = update.root;
        for entry in entries {
            graph.add(entry.clone());
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        // no subscribers is fine
        self.events.send(event).ok();
    }
}

impl Replica {
    /// Open the replica of `options.manifest`, reloading the log persisted in the datastore.
    pub async fn open(options: ReplicaOptions) -> Result<Self, StorageError> {
        let ReplicaOptions {
            manifest,
            blocks,
            datastore,
            identity,
            components,
        } = options;
        let empty = shard::empty();
        blocks.put(&empty).await?;
        let root_key = root_key(&manifest.address());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            tag: manifest.tag(),
            manifest,
            blocks,
            datastore,
            identity,
            access: components.access,
            format: components.entry,
            verifier: components.identity,
            root_key,
            graph: Mutex::new(Graph::new(*empty.cid())),
            events,
        };

        if let Some(bytes) = inner.datastore.get(&inner.root_key).await? {
            let root = Cid::try_from(bytes.as_ref())
                .map_err(|err| StorageError::Backend(anyhow::Error::from(err)))?;
            let mut candidates = Vec::new();
            for cid in shard::keys(&inner.blocks, &root).await? {
                candidates.push(inner.blocks.require(&cid).await?);
            }
            let pipeline = inner.pipeline();
            let mut checked = Vec::new();
            for block in candidates {
                match pipeline.check(block).await {
                    Ok((entry, _)) => checked.push(entry),
                    Err(err) => warn!("dropping persisted entry: {err}"),
                }
            }
            let mut graph = inner.graph.lock().await;
            let (ordered, missing) = graph.order(checked);
            for err in &missing {
                warn!("dropping persisted entry: {err}");
            }
            inner.admit(&mut graph, &ordered).await?;
            debug!(db = %inner.manifest.address(), entries = graph.len(), "replica loaded");
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Root of an index without entries.
    pub fn empty_root() -> Cid {
        *shard::empty().cid()
    }

    /// Append a new entry whose parents are the current heads.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<Entry, WriteError> {
        let inner = &self.inner;
        let mut graph = inner.graph.lock().await;
        let next = graph.heads().iter().copied().collect();
        let entry = inner
            .format
            .create(&inner.identity, inner.tag.clone(), payload.into(), next)?;
        let identity = inner.identity.identity();
        if !inner.access.can_append(&entry, identity) {
            return Err(WriteError::Unauthorized(*identity.id()));
        }
        inner.blocks.put(identity.block()).await?;
        inner.admit(&mut graph, std::slice::from_ref(&entry)).await?;
        drop(graph);

        debug!(db = %inner.manifest.address(), cid = %entry.cid(), "wrote entry");
        inner.emit(Event::Update {
            origin: Origin::Local,
            entries: vec![entry.clone()],
        });
        Ok(entry)
    }

    /// Admit entries from elsewhere.
    ///
    /// Every entry goes through the admission checks; failures are reported in the outcome and
    /// never abort the batch. Entries may arrive in any order. Those whose parents are neither
    /// present nor admitted within the same batch are rejected. Known entries are skipped, and
    /// an [`Event::Update`] is sent only if something new was admitted.
    pub async fn merge(
        &self,
        entries: impl IntoIterator<Item = Entry>,
    ) -> Result<MergeOutcome, StorageError> {
        let inner = &self.inner;
        let (checked, mut rejected) = inner.check_all(entries).await;

        let mut graph = inner.graph.lock().await;
        // a concurrent merge may have admitted some of them meanwhile
        let checked = checked.into_iter().filter(|e| !graph.has(e.cid())).collect();
        let (admitted, missing) = graph.order(checked);
        for err in &missing {
            warn!(db = %inner.manifest.address(), "rejected entry: {err}");
        }
        rejected.extend(missing);
        inner.admit(&mut graph, &admitted).await?;
        drop(graph);

        if !admitted.is_empty() {
            debug!(db = %inner.manifest.address(), count = admitted.len(), "merged entries");
            inner.emit(Event::Update {
                origin: Origin::Remote,
                entries: admitted.clone(),
            });
        }
        Ok(MergeOutcome { admitted, rejected })
    }

    /// Compare the local root against `other`.
    ///
    /// `other` is the base: [`Diff::local_only`] lists entries `other` lacks,
    /// [`Diff::remote_only`] entries only `other` has, and the shard additions are the index
    /// nodes needed to go from `other` to the local root. Index nodes missing locally are read
    /// through `remote` and cached.
    pub async fn diff(
        &self,
        other: &Cid,
        remote: Option<&dyn BlockFetcher>,
    ) -> Result<Diff, StorageError> {
        let root = self.root().await;
        self.diff_at(&root, other, remote).await
    }

    /// Like [`Replica::diff`], for a local root captured earlier.
    pub async fn diff_at(
        &self,
        root: &Cid,
        other: &Cid,
        remote: Option<&dyn BlockFetcher>,
    ) -> Result<Diff, StorageError> {
        match remote {
            Some(remote) => {
                let chained = Chained::new(&self.inner.blocks, remote);
                shard::diff(&chained, root, other).await
            }
            None => shard::diff(&self.inner.blocks, root, other).await,
        }
    }

    /// Decode an entry block with this database's entry format. Does not verify it.
    pub fn decode(&self, block: Block) -> Result<Entry, EntryError> {
        self.inner.format.as_entry(block)
    }

    /// Current index root.
    pub async fn root(&self) -> Cid {
        self.inner.graph.lock().await.root
    }

    /// Entries no other entry refers to.
    pub async fn heads(&self) -> Vec<Cid> {
        self.inner.graph.lock().await.heads().iter().copied().collect()
    }

    /// Whether an entry has been admitted.
    pub async fn has(&self, cid: &Cid) -> bool {
        self.inner.graph.lock().await.has(cid)
    }

    /// An admitted entry.
    pub async fn get(&self, cid: &Cid) -> Option<Entry> {
        self.inner.graph.lock().await.get(cid).cloned()
    }

    /// Number of admitted entries.
    pub async fn len(&self) -> usize {
        self.inner.graph.lock().await.len()
    }

    /// Whether no entry has been admitted.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All entries, parents before children, concurrent entries ordered by identifier.
    pub async fn traverse(&self) -> Vec<Entry> {
        self.inner.graph.lock().await.traverse()
    }

    /// Subscribe to [`Event`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Notify subscribers that the replica is closing.
    pub fn close(&self) {
        self.inner.emit(Event::Closed);
    }

    /// The manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// The database address.
    pub fn address(&self) -> Address {
        self.inner.manifest.address()
    }

    /// The identity signing local writes.
    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// The identity verifier of this database.
    pub fn verifier(&self) -> &Arc<dyn IdentityVerifier> {
        &self.inner.verifier
    }

    /// Block storage.
    pub fn blocks(&self) -> &Blocks {
        &self.inner.blocks
    }

    /// The companion key-value store.
    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.inner.datastore
    }
}

fn root_key(address: &Address) -> Key {
    Key::new("/welo/replica")
        .child(address.cid().to_string())
        .child("root")
}
