#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use welo::{
    datastore::MemoryDatastore,
    replica::ReplicaOptions,
    store::{Reducer, StoreModule},
    Blocks, Event, LocalIdentity, Manifest, ManifestData, Registry, Replica,
};

pub const STORE: &str = "/test/store/noop";

#[derive(Debug)]
pub struct Noop;

#[async_trait]
impl Reducer for Noop {
    async fn load(&mut self, _replica: &Replica) -> Result<()> {
        Ok(())
    }

    async fn update(&mut self, _replica: &Replica, _event: &Event) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoopStore;

impl StoreModule for NoopStore {
    fn protocol(&self) -> &'static str {
        STORE
    }

    fn create(&self, _manifest: &Manifest) -> Box<dyn Reducer> {
        Box::new(Noop)
    }
}

pub fn identities(seed: u64, n: usize) -> Vec<LocalIdentity> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| LocalIdentity::generate(&mut rng).expect("identity"))
        .collect()
}

pub fn manifest(writers: &[&LocalIdentity]) -> Manifest {
    let data = writers
        .iter()
        .fold(ManifestData::new("integration", STORE), |data, w| {
            data.writer(w.identity().id())
        });
    Manifest::create(data).expect("manifest")
}

pub fn registry() -> Registry {
    Registry::new().with_store(NoopStore)
}

/// A replica with fresh stores that already knows the identities of `peers`.
pub async fn replica(
    manifest: &Manifest,
    identity: &LocalIdentity,
    peers: &[&LocalIdentity],
) -> Result<Replica> {
    let blocks = Blocks::memory();
    for peer in peers {
        blocks.put(peer.identity().block()).await?;
    }
    let replica = Replica::open(ReplicaOptions {
        manifest: manifest.clone(),
        blocks,
        datastore: Arc::new(MemoryDatastore::new()),
        identity: identity.clone(),
        components: registry().resolve(manifest)?,
    })
    .await?;
    Ok(replica)
}
