//! Helpers for unit tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    blocks::Blocks,
    datastore::{Datastore, MemoryDatastore},
    identity::LocalIdentity,
    manifest::{Manifest, ManifestData},
    registry::Registry,
    replica::{Event, Replica, ReplicaOptions},
    store::{Reducer, StoreModule},
};

pub(crate) const STORE: &str = "/test/store/noop";

#[derive(Debug)]
pub(crate) struct Noop;

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
pub(crate) struct NoopStore;

impl StoreModule for NoopStore {
    fn protocol(&self) -> &'static str {
        STORE
    }

    fn create(&self, _manifest: &Manifest) -> Box<dyn Reducer> {
        Box::new(Noop)
    }
}

pub(crate) fn identities(seed: u64, n: usize) -> Vec<LocalIdentity> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| LocalIdentity::generate(&mut rng).expect("identity"))
        .collect()
}

pub(crate) fn manifest(writers: &[&LocalIdentity]) -> Manifest {
    let data = writers
        .iter()
        .fold(ManifestData::new("test", STORE), |data, w| {
            data.writer(w.identity().id())
        });
    Manifest::create(data).expect("manifest")
}

/// A replica with its own fresh stores.
pub(crate) async fn replica(manifest: &Manifest, identity: &LocalIdentity) -> Replica {
    replica_with(
        manifest,
        identity,
        Blocks::memory(),
        Arc::new(MemoryDatastore::new()),
    )
    .await
}

pub(crate) async fn replica_with(
    manifest: &Manifest,
    identity: &LocalIdentity,
    blocks: Blocks,
    datastore: Arc<dyn Datastore>,
) -> Replica {
    let components = Registry::new()
        .with_store(NoopStore)
        .resolve(manifest)
        .expect("resolve");
    Replica::open(ReplicaOptions {
        manifest: manifest.clone(),
        blocks,
        datastore,
        identity: identity.clone(),
        components,
    })
    .await
    .expect("open replica")
}
