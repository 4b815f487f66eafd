//! A peer-to-peer database replicated over a signed, content-addressed log.
//!
//! Every database is described by an immutable [`Manifest`]; its content-identifier is the
//! database [`Address`]. Writers append signed [`Entry`]s to a causal graph held by a
//! [`Replica`], which indexes the graph in a sharded set so two replicas can be compared
//! cheaply with [`Replica::diff`]. [`replicator`]s move entries between replicas and a store
//! module folds the graph into application state.
//!
//! [`Database::open`] wires all of it together from a [`Registry`] of modules.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod access;
pub mod blocks;
pub mod config;
pub mod database;
pub mod datastore;
pub mod entry;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod playable;
pub mod pubsub;
pub mod registry;
pub mod replica;
pub mod replicator;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use welo_base as base;
pub use welo_car as car;
pub use welo_base::{Block, Cid};

pub use self::blocks::Blocks;
pub use self::config::Config;
pub use self::database::{Database, OpenError, OpenOptions};
pub use self::entry::Entry;
pub use self::identity::{Identity, LocalIdentity};
pub use self::manifest::{Address, Manifest, ManifestData};
pub use self::registry::Registry;
pub use self::replica::{Event, Origin, Replica};
