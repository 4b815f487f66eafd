//! A database: a replica, its replicators and the reducer folding it into state.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    sync::{broadcast::error::RecvError, Mutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, error_span, warn, Instrument};

use crate::{
    blocks::Blocks,
    datastore::Datastore,
    entry::Entry,
    error::{MissingCapabilityError, ReplicatorError, StorageError, WriteError},
    identity::LocalIdentity,
    manifest::{Address, Manifest},
    registry::{Registry, UnknownProtocol},
    replica::{Event, Replica, ReplicaOptions},
    replicator::{self, Config, Replicator, ReplicatorModule},
    store::Reducer,
};

/// Everything needed to open a database.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// The database.
    pub manifest: Manifest,
    /// The identity writing on this node.
    pub identity: LocalIdentity,
    /// Block storage.
    pub blocks: Blocks,
    /// Companion key-value store.
    pub datastore: Arc<dyn Datastore>,
    /// Modules the manifest's protocols are resolved against.
    pub registry: Registry,
    /// Replication strategies to run.
    pub replicators: Vec<Arc<dyn ReplicatorModule>>,
    /// Start the replicators right away.
    pub start: bool,
}

/// Why a database could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The manifest names an unknown protocol.
    #[error(transparent)]
    UnknownProtocol(#[from] UnknownProtocol),
    /// Loading the replica failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A replicator module lacks a collaborator.
    #[error(transparent)]
    MissingCapability(#[from] MissingCapabilityError),
    /// A replicator failed to start.
    #[error(transparent)]
    Replicator(#[from] ReplicatorError),
    /// The reducer failed to load.
    #[error("store: {0:#}")]
    Store(anyhow::Error),
}

/// An open database.
#[derive(Debug)]
pub struct Database {
    replica: Replica,
    replicators: Vec<Arc<dyn Replicator>>,
    reducer: Arc<Mutex<Box<dyn Reducer>>>,
    task: JoinHandle<()>,
}

impl Database {
    /// Open a database and start feeding its reducer.
    pub async fn open(options: OpenOptions) -> Result<Self, OpenError> {
        let OpenOptions {
            manifest,
            identity,
            blocks,
            datastore,
            registry,
            replicators,
            start,
        } = options;
        let components = registry.resolve(&manifest)?;
        let store = components.store.clone();
        blocks.put(manifest.block()).await?;
        blocks.put(identity.identity().block()).await?;
        let replica = Replica::open(ReplicaOptions {
            manifest: manifest.clone(),
            blocks: blocks.clone(),
            datastore: datastore.clone(),
            identity,
            components,
        })
        .await?;

        let mut reducer = store.create(&manifest);
        // subscribe before loading so no update falls between the two
        let events = replica.subscribe();
        reducer.load(&replica).await.map_err(OpenError::Store)?;
        let reducer = Arc::new(Mutex::new(reducer));
        let span = error_span!("db", address = %replica.address());
        let task = tokio::spawn(
            reduce(replica.clone(), reducer.clone(), events).instrument(span),
        );

        let mut running = Vec::with_capacity(replicators.len());
        for module in &replicators {
            let config = Config {
                replica: replica.clone(),
                blocks: blocks.clone(),
                datastore: datastore.clone(),
            };
            running.push(module.create(config)?);
        }
        let db = Self {
            replica,
            replicators: running,
            reducer,
            task,
        };
        if start {
            for replicator in &db.replicators {
                if let Err(err) = replicator.start().await {
                    db.shutdown().await;
                    return Err(err.into());
                }
            }
        }
        debug!(address = %db.address(), "opened database");
        Ok(db)
    }

    /// The database address.
    pub fn address(&self) -> Address {
        self.replica.address()
    }

    /// The manifest.
    pub fn manifest(&self) -> &Manifest {
        self.replica.manifest()
    }

    /// The replica.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Append an entry.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<Entry, WriteError> {
        self.replica.write(payload).await
    }

    /// The running replicators.
    pub fn replicators(&self) -> &[Arc<dyn Replicator>] {
        &self.replicators
    }

    /// The first replicator of type `R`.
    pub fn replicator<R: Replicator>(&self) -> Option<Arc<R>> {
        self.replicators.iter().find_map(replicator::downcast::<R>)
    }

    /// Lock the reducer.
    pub async fn reducer(&self) -> MutexGuard<'_, Box<dyn Reducer>> {
        self.reducer.lock().await
    }

    /// Start every replicator.
    pub async fn start(&self) -> Result<(), ReplicatorError> {
        for replicator in &self.replicators {
            replicator.start().await?;
        }
        Ok(())
    }

    /// Stop the replicators, close the replica and wait for the reducer to finish.
    pub async fn close(mut self) {
        self.shutdown().await;
        if let Err(err) = (&mut self.task).await {
            if !err.is_cancelled() {
                warn!("reducer task failed: {err}");
            }
        }
        debug!(address = %self.address(), "closed database");
    }

    async fn shutdown(&self) {
        for replicator in &self.replicators {
            if let Err(err) = replicator.stop().await {
                warn!(protocol = replicator.protocol(), "stopping replicator failed: {err}");
            }
        }
        self.replica.close();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reduce(
    replica: Replica,
    reducer: Arc<Mutex<Box<dyn Reducer>>>,
    mut events: tokio::sync::broadcast::Receiver<Event>,
) {
    loop {
        let event = match events.recv().await {
            Ok(Event::Closed) | Err(RecvError::Closed) => break,
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("reducer lagged by {n} events, reloading");
                if let Err(err) = reducer.lock().await.load(&replica).await {
                    warn!("reloading store failed: {err:#}");
                }
                continue;
            }
        };
        if let Err(err) = reducer.lock().await.update(&replica, &event).await {
            warn!("store update failed: {err:#}");
        }
    }
    debug!("reducer stopped");
}
