//! Gossip replication for directly connected swarms.
//!
//! Every local write is broadcast on a topic derived from the database address, and everything
//! received on that topic goes straight into [`Replica::merge`]. There are no revision pointers
//! and no archives. Entries arriving before their parents are parked in a bounded orphan buffer
//! while their parents are requested with a [`Op::Want`].

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};
use welo_base::{Block, Cid};

use super::{Config, Replicator, ReplicatorModule};
use crate::{
    entry::Entry,
    error::{EntryError, MissingCapabilityError, ReplicatorError},
    playable::{Playable, Status},
    pubsub::PubSub,
    replica::{Event, Origin, Replica},
};

/// Protocol name of the live replicator.
pub const PROTOCOL: &str = "/welo/replicator/live/1.0.0";

/// Options of the live replicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Entries kept while waiting for their parents. The oldest are dropped first.
    pub max_orphans: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { max_orphans: 1024 }
    }
}

/// Gossip message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Entry blocks, each with the block of its identity.
    Put {
        /// `(entry, identity)` block bytes.
        entries: Vec<(Bytes, Bytes)>,
    },
    /// Request entries by identifier.
    Want(Vec<Cid>),
    /// The sender's current heads, sent when it starts and after it missed local writes.
    Heads(Vec<Cid>),
}

/// Creates [`Live`] replicators.
#[derive(Debug, Clone, Default)]
pub struct LiveModule {
    pubsub: Option<Arc<dyn PubSub>>,
    config: LiveConfig,
}

impl LiveModule {
    /// A module without a transport; set one with [`LiveModule::pubsub`].
    pub fn new(config: LiveConfig) -> Self {
        Self {
            pubsub: None,
            config,
        }
    }

    /// Use `pubsub` as the transport.
    pub fn pubsub(mut self, pubsub: impl PubSub) -> Self {
        self.pubsub = Some(Arc::new(pubsub));
        self
    }
}

impl ReplicatorModule for LiveModule {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn create(&self, config: Config) -> Result<Arc<dyn Replicator>, MissingCapabilityError> {
        let pubsub = self.pubsub.clone().ok_or(MissingCapabilityError {
            component: "live replicator",
            capability: "pubsub",
        })?;
        Ok(Arc::new(Live::new(config.replica, pubsub, self.config.clone())))
    }
}

/// The gossip replicator.
#[derive(Debug)]
pub struct Live {
    replica: Replica,
    pubsub: Arc<dyn PubSub>,
    config: LiveConfig,
    topic: String,
    playable: Playable,
    actor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Live {
    /// Create a stopped replicator.
    pub fn new(replica: Replica, pubsub: Arc<dyn PubSub>, config: LiveConfig) -> Self {
        let topic = topic(&replica);
        Self {
            replica,
            pubsub,
            config,
            topic,
            playable: Playable::new(),
            actor: Mutex::new(None),
        }
    }

    /// The gossip topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn topic(replica: &Replica) -> String {
    format!("{PROTOCOL}/{}", replica.address().cid())
}

#[async_trait]
impl Replicator for Live {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn start(&self) -> Result<(), ReplicatorError> {
        self.playable
            .start(|| async {
                let events = self.replica.subscribe();
                let messages = self
                    .pubsub
                    .subscribe(&self.topic)
                    .await
                    .map_err(ReplicatorError::Backend)?;
                let cancel = CancellationToken::new();
                let actor = Actor {
                    replica: self.replica.clone(),
                    pubsub: self.pubsub.clone(),
                    topic: self.topic.clone(),
                    events,
                    orphans: Orphans::new(self.config.max_orphans),
                    cancel: cancel.clone(),
                };
                actor.announce().await.map_err(ReplicatorError::Backend)?;
                let span = error_span!("live", db = %self.replica.address());
                let handle = tokio::spawn(actor.run(messages).instrument(span));
                *self.actor.lock() = Some((cancel, handle));
                Ok(())
            })
            .await
    }

    async fn stop(&self) -> Result<(), ReplicatorError> {
        self.playable
            .stop(|| async {
                let actor = self.actor.lock().take();
                if let Some((cancel, handle)) = actor {
                    cancel.cancel();
                    // the actor finishes the message it is handling before it exits
                    if let Err(err) = handle.await {
                        warn!("live actor failed: {err}");
                    }
                }
                self.pubsub
                    .unsubscribe(&self.topic)
                    .await
                    .map_err(ReplicatorError::Backend)
            })
            .await
    }

    fn status(&self) -> Status {
        self.playable.status()
    }
}

/// Entries waiting for parents, bounded, oldest evicted first.
#[derive(Debug)]
struct Orphans {
    cap: usize,
    entries: BTreeMap<Cid, Entry>,
    order: VecDeque<Cid>,
}

impl Orphans {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, entry: Entry) {
        if self.cap == 0 || self.entries.contains_key(entry.cid()) {
            return;
        }
        while self.entries.len() >= self.cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                trace!(cid = %oldest, "evicted orphan");
            }
        }
        self.order.push_back(*entry.cid());
        self.entries.insert(*entry.cid(), entry);
    }

    fn contains(&self, cid: &Cid) -> bool {
        self.entries.contains_key(cid)
    }

    fn drain(&mut self) -> Vec<Entry> {
        self.order.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Actor {
    replica: Replica,
    pubsub: Arc<dyn PubSub>,
    topic: String,
    events: broadcast::Receiver<Event>,
    orphans: Orphans,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut messages: BoxStream<'static, Bytes>) {
        debug!(topic = %self.topic, "live replicator started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(Event::Update { origin: Origin::Local, entries }) => {
                        if let Err(err) = self.put(&entries).await {
                            warn!("broadcast failed: {err:#}");
                        }
                    }
                    Ok(Event::Update { origin: Origin::Remote, .. }) => {}
                    Ok(Event::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("missed {n} replica events, announcing heads instead");
                        if let Err(err) = self.announce().await {
                            warn!("announcing heads failed: {err:#}");
                        }
                    }
                },
                msg = messages.next() => match msg {
                    Some(msg) => {
                        if let Err(err) = self.handle(msg).await {
                            warn!("dropping gossip message: {err:#}");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(topic = %self.topic, "live replicator stopped");
    }

    async fn send(&self, op: &Op) -> Result<()> {
        let bytes = postcard::to_stdvec(op)?;
        self.pubsub.publish(&self.topic, bytes.into()).await
    }

    /// Send the current heads so peers can request what they lack.
    async fn announce(&self) -> Result<()> {
        let heads = self.replica.heads().await;
        if heads.is_empty() {
            return Ok(());
        }
        self.send(&Op::Heads(heads)).await
    }

    async fn put(&self, entries: &[Entry]) -> Result<()> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let identity = self
                .replica
                .blocks()
                .require(entry.auth())
                .await
                .with_context(|| format!("identity of {}", entry.cid()))?;
            out.push((entry.block().data().clone(), identity.data().clone()));
        }
        self.send(&Op::Put { entries: out }).await
    }

    async fn handle(&mut self, msg: Bytes) -> Result<()> {
        let op: Op = postcard::from_bytes(&msg).context("decoding gossip message")?;
        match op {
            Op::Put { entries } => self.on_put(entries).await,
            Op::Want(cids) => {
                let mut found = Vec::new();
                for cid in cids {
                    if let Some(entry) = self.replica.get(&cid).await {
                        found.push(entry);
                    }
                }
                if found.is_empty() {
                    return Ok(());
                }
                trace!(count = found.len(), "answering want");
                self.put(&found).await
            }
            Op::Heads(heads) => {
                let mut unknown = Vec::new();
                for cid in heads {
                    if !self.replica.has(&cid).await {
                        unknown.push(cid);
                    }
                }
                if unknown.is_empty() {
                    return Ok(());
                }
                self.send(&Op::Want(unknown)).await
            }
        }
    }

    async fn on_put(&mut self, entries: Vec<(Bytes, Bytes)>) -> Result<()> {
        let mut candidates = Vec::with_capacity(entries.len());
        for (entry, identity) in entries {
            self.replica.blocks().put(&Block::new(identity)).await?;
            match self.replica.decode(Block::new(entry)) {
                Ok(entry) => candidates.push(entry),
                Err(err) => warn!("dropping gossiped entry: {err}"),
            }
        }
        candidates.extend(self.orphans.drain());
        let by_cid: BTreeMap<Cid, Entry> =
            candidates.into_iter().map(|e| (*e.cid(), e)).collect();
        let outcome = match self.replica.merge(by_cid.values().cloned()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // keep them for the next put
                for entry in by_cid.into_values() {
                    self.orphans.insert(entry);
                }
                return Err(err.into());
            }
        };
        if !outcome.admitted.is_empty() {
            debug!(count = outcome.admitted.len(), "merged gossiped entries");
        }

        let mut wanted = BTreeSet::new();
        for err in outcome.rejected {
            if let EntryError::MissingParents { cid, missing } = err {
                if let Some(entry) = by_cid.get(&cid) {
                    self.orphans.insert(entry.clone());
                }
                wanted.extend(missing);
            }
        }
        wanted.retain(|cid| !self.orphans.contains(cid));
        if wanted.is_empty() {
            return Ok(());
        }
        debug!(orphans = self.orphans.len(), wanted = wanted.len(), "requesting parents");
        self.send(&Op::Want(wanted.into_iter().collect())).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        blocks::{Blocks, ContentStore, MemoryStore},
        datastore::MemoryDatastore,
        entry::{BasalEntry, EntryFormat},
        pubsub::MemoryNetwork,
        test_utils::{identities, manifest, replica, replica_with},
    };

    /// Refuses blocks it does not hold yet while `full` is set.
    #[derive(Debug, Clone, Default)]
    struct FullStore {
        inner: MemoryStore,
        full: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ContentStore for FullStore {
        async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
            self.inner.get(cid).await
        }

        async fn put(&self, cid: Cid, data: Bytes) -> Result<()> {
            if self.full.load(Ordering::SeqCst) && !self.inner.has(&cid).await? {
                anyhow::bail!("store is full");
            }
            self.inner.put(cid, data).await
        }
    }

    fn actor(replica: &Replica, pubsub: Arc<dyn PubSub>) -> Actor {
        Actor {
            replica: replica.clone(),
            pubsub,
            topic: topic(replica),
            events: replica.subscribe(),
            orphans: Orphans::new(16),
            cancel: CancellationToken::new(),
        }
    }

    async fn gossip(replica: &Replica, entry: &Entry) -> TestResult<(Bytes, Bytes)> {
        let identity = replica.blocks().require(entry.auth()).await?;
        Ok((entry.block().data().clone(), identity.data().clone()))
    }

    async fn admitted(events: &mut broadcast::Receiver<Event>, n: usize) -> TestResult {
        let mut seen = 0;
        while seen < n {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
            if let Event::Update { entries, .. } = event {
                seen += entries.len();
            }
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn writes_propagate() -> TestResult {
        let ids = identities(10, 2);
        let manifest = manifest(&[&ids[0], &ids[1]]);
        let network = MemoryNetwork::new();
        let a = replica(&manifest, &ids[0]).await;
        let b = replica(&manifest, &ids[1]).await;
        let module = LiveModule::new(LiveConfig::default()).pubsub(network.join());
        let live_a = module.create(Config::new(a.clone()))?;
        let live_b = LiveModule::new(LiveConfig::default())
            .pubsub(network.join())
            .create(Config::new(b.clone()))?;
        live_a.start().await?;
        live_b.start().await?;
        assert_eq!(live_a.status(), Status::Started);

        let mut b_events = b.subscribe();
        let entry = a.write(&b"hello"[..]).await?;
        admitted(&mut b_events, 1).await?;
        assert!(b.has(entry.cid()).await);
        assert_eq!(a.root().await, b.root().await);

        live_a.stop().await?;
        live_b.stop().await?;
        assert_eq!(live_a.status(), Status::Stopped);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn late_joiner_catches_up() -> TestResult {
        let ids = identities(11, 2);
        let manifest = manifest(&[&ids[0]]);
        let network = MemoryNetwork::new();
        let a = replica(&manifest, &ids[0]).await;
        let b = replica(&manifest, &ids[1]).await;
        let live_a = Live::new(a.clone(), Arc::new(network.join()), LiveConfig::default());
        live_a.start().await?;
        for i in 0..5u8 {
            a.write(vec![i]).await?;
        }

        // b announces nothing, but a's heads arrive once a restarts
        let live_b = Live::new(b.clone(), Arc::new(network.join()), LiveConfig::default());
        live_b.start().await?;
        let mut b_events = b.subscribe();
        live_a.stop().await?;
        live_a.start().await?;

        admitted(&mut b_events, 5).await?;
        assert_eq!(b.len().await, 5);
        assert_eq!(a.root().await, b.root().await);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_merge_keeps_orphans() -> TestResult {
        let ids = identities(14, 2);
        let manifest = manifest(&[&ids[0]]);
        let writer = replica(&manifest, &ids[0]).await;
        let first = writer.write(&b"first"[..]).await?;
        let second = writer.write(&b"second"[..]).await?;

        let store = FullStore::default();
        let reader = replica_with(
            &manifest,
            &ids[1],
            Blocks::new(store.clone()),
            Arc::new(MemoryDatastore::new()),
        )
        .await;
        let network = MemoryNetwork::new();
        let mut actor = actor(&reader, Arc::new(network.join()));

        actor.on_put(vec![gossip(&writer, &second).await?]).await?;
        assert!(actor.orphans.contains(second.cid()));

        store.full.store(true, Ordering::SeqCst);
        assert!(actor
            .on_put(vec![gossip(&writer, &first).await?])
            .await
            .is_err());
        assert_eq!(actor.orphans.len(), 2);
        assert!(!reader.has(first.cid()).await);

        store.full.store(false, Ordering::SeqCst);
        actor.on_put(vec![]).await?;
        assert_eq!(actor.orphans.len(), 0);
        assert_eq!(reader.len().await, 2);
        assert_eq!(reader.root().await, writer.root().await);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn lagging_actor_announces_heads() -> TestResult {
        let ids = identities(15, 1);
        let manifest = manifest(&[&ids[0]]);
        let a = replica(&manifest, &ids[0]).await;
        let network = MemoryNetwork::new();
        let observer = network.join();
        let mut observed = observer.subscribe(&topic(&a)).await?;
        let pubsub = network.join();
        let messages = pubsub.subscribe(&topic(&a)).await?;
        let actor = actor(&a, Arc::new(pubsub));

        // more writes than the event channel holds, none read yet
        for i in 0..300u16 {
            a.write(i.to_be_bytes().to_vec()).await?;
        }
        let cancel = actor.cancel.clone();
        let task = tokio::spawn(actor.run(messages));

        let first = tokio::time::timeout(Duration::from_secs(5), observed.next())
            .await?
            .expect("gossip ended");
        let op: Op = postcard::from_bytes(&first)?;
        assert_eq!(op, Op::Heads(a.heads().await));

        cancel.cancel();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_pubsub_is_a_capability_error() {
        let ids = identities(12, 1);
        let manifest = manifest(&[&ids[0]]);
        let a = replica(&manifest, &ids[0]).await;
        let err = LiveModule::default().create(Config::new(a)).unwrap_err();
        assert_eq!(err.capability, "pubsub");
    }

    #[test]
    fn orphan_buffer_is_bounded() {
        let ids = identities(13, 1);
        let mut orphans = Orphans::new(2);
        let entries: Vec<Entry> = (0..3u8)
            .map(|i| {
                BasalEntry
                    .create(&ids[0], Bytes::new(), Bytes::from(vec![i]), vec![])
                    .unwrap()
            })
            .collect();
        for entry in &entries {
            orphans.insert(entry.clone());
        }
        assert_eq!(orphans.len(), 2);
        assert!(!orphans.contains(entries[0].cid()));
        assert!(orphans.contains(entries[2].cid()));
        assert_eq!(orphans.drain().len(), 2);
        assert_eq!(orphans.len(), 0);
    }
}
