//! Replicators move entries between replicas of the same database.
//!
//! A replicator is a long-running service with the [`Playable`](crate::playable::Playable)
//! lifecycle. It reads the replica to find out what to send and hands everything it receives to
//! [`Replica::merge`]; it never mutates the graph directly. Two strategies ship with the crate:
//! [`live`] broadcasts entries to connected peers, [`zzzync`] publishes snapshots through a
//! naming system and discovers collaborators through a DHT.

use std::{any::Any, fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    blocks::Blocks,
    datastore::Datastore,
    error::{MissingCapabilityError, ReplicatorError},
    playable::Status,
    replica::Replica,
};

pub mod live;
pub mod zzzync;

/// Helper trait to cast an `Arc<dyn Replicator>` back to its concrete type.
///
/// Implemented for every type, there is no need to implement it yourself.
pub trait IntoArcAny {
    /// Upcast to `Arc<dyn Any>`.
    fn into_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> IntoArcAny for T {
    fn into_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A synchronization strategy bound to one replica.
#[async_trait]
pub trait Replicator: IntoArcAny + Debug + Send + Sync + 'static {
    /// Protocol name of the strategy.
    fn protocol(&self) -> &'static str;

    /// Start the service. Starting a started replicator does nothing.
    async fn start(&self) -> Result<(), ReplicatorError>;

    /// Stop the service. In-flight operations complete on their own.
    async fn stop(&self) -> Result<(), ReplicatorError>;

    /// Current lifecycle status.
    fn status(&self) -> Status;
}

/// What a replicator is created from.
#[derive(Debug, Clone)]
pub struct Config {
    /// The replica to synchronize.
    pub replica: Replica,
    /// Block storage, shared with the replica.
    pub blocks: Blocks,
    /// Key-value store for the replicator's own state.
    pub datastore: Arc<dyn Datastore>,
}

impl Config {
    /// A config using the replica's own stores.
    pub fn new(replica: Replica) -> Self {
        Self {
            blocks: replica.blocks().clone(),
            datastore: replica.datastore().clone(),
            replica,
        }
    }
}

/// Creates replicators of one strategy.
pub trait ReplicatorModule: Debug + Send + Sync + 'static {
    /// Protocol name of the strategy.
    fn protocol(&self) -> &'static str;

    /// Create a replicator for `config.replica`.
    ///
    /// Fails if a collaborator the strategy needs was not supplied to the module.
    fn create(&self, config: Config) -> Result<Arc<dyn Replicator>, MissingCapabilityError>;
}

/// Cast a replicator to its concrete type.
pub fn downcast<R: Replicator>(replicator: &Arc<dyn Replicator>) -> Option<Arc<R>> {
    replicator.clone().into_arc_any().downcast().ok()
}
