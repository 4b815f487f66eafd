//! Contract of the store modules that fold a replica into application state.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    manifest::Manifest,
    replica::{Event, Replica},
};

/// Creates the reducer of a database.
pub trait StoreModule: Debug + Send + Sync + 'static {
    /// Protocol name this module is registered under.
    fn protocol(&self) -> &'static str;

    /// Create a reducer for the database described by `manifest`.
    fn create(&self, manifest: &Manifest) -> Box<dyn Reducer>;
}

/// Folds the entries of a replica into application state.
///
/// Concurrent entries must be folded deterministically, e.g. by ordering them through
/// [`Replica::traverse`].
#[async_trait]
pub trait Reducer: Debug + Send + 'static {
    /// Called once when the database opens, before any event.
    async fn load(&mut self, replica: &Replica) -> Result<()>;

    /// Called for every replica event.
    async fn update(&mut self, replica: &Replica, event: &Event) -> Result<()>;
}
