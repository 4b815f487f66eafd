//! Lookup of protocol modules by name.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    access::{AccessModule, Accessor, StaticAccessModule},
    entry::{BasalEntry, EntryFormat},
    identity::{BasalIdentity, IdentityVerifier},
    manifest::Manifest,
    store::StoreModule,
};

/// A manifest names a protocol that is not registered.
#[derive(Debug, thiserror::Error)]
#[error("no {role} module registered for {protocol}")]
pub struct UnknownProtocol {
    /// The role: `access`, `entry`, `identity` or `store`.
    pub role: &'static str,
    /// The requested protocol name.
    pub protocol: String,
}

/// The concrete modules a manifest resolves to.
#[derive(Debug, Clone)]
pub struct Components {
    /// Access control configured from the manifest.
    pub access: Arc<dyn Accessor>,
    /// Entry format.
    pub entry: Arc<dyn EntryFormat>,
    /// Identity verifier.
    pub identity: Arc<dyn IdentityVerifier>,
    /// Store module.
    pub store: Arc<dyn StoreModule>,
}

/// Known modules per role, keyed by protocol name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    access: BTreeMap<&'static str, Arc<dyn AccessModule>>,
    entry: BTreeMap<&'static str, Arc<dyn EntryFormat>>,
    identity: BTreeMap<&'static str, Arc<dyn IdentityVerifier>>,
    store: BTreeMap<&'static str, Arc<dyn StoreModule>>,
}

impl Registry {
    /// A registry with the built-in access, entry and identity modules and no stores.
    pub fn new() -> Self {
        Self::default()
            .with_access(StaticAccessModule)
            .with_entry(BasalEntry)
            .with_identity(BasalIdentity)
    }

    /// Register an access module.
    pub fn with_access(mut self, module: impl AccessModule) -> Self {
        self.access.insert(module.protocol(), Arc::new(module));
        self
    }

    /// Register an entry format.
    pub fn with_entry(mut self, format: impl EntryFormat) -> Self {
        self.entry.insert(format.protocol(), Arc::new(format));
        self
    }

    /// Register an identity verifier.
    pub fn with_identity(mut self, verifier: impl IdentityVerifier) -> Self {
        self.identity.insert(verifier.protocol(), Arc::new(verifier));
        self
    }

    /// Register a store module.
    pub fn with_store(mut self, module: impl StoreModule) -> Self {
        self.store.insert(module.protocol(), Arc::new(module));
        self
    }

    /// Resolve every role of `manifest`.
    pub fn resolve(&self, manifest: &Manifest) -> Result<Components, UnknownProtocol> {
        let data = manifest.data();
        let access = lookup(&self.access, "access", &data.access.protocol)?;
        Ok(Components {
            access: access.create(manifest),
            entry: lookup(&self.entry, "entry", &data.entry.protocol)?.clone(),
            identity: lookup(&self.identity, "identity", &data.identity.protocol)?.clone(),
            store: lookup(&self.store, "store", &data.store.protocol)?.clone(),
        })
    }
}

fn lookup<'a, T: ?Sized>(
    modules: &'a BTreeMap<&'static str, Arc<T>>,
    role: &'static str,
    protocol: &str,
) -> Result<&'a Arc<T>, UnknownProtocol> {
    modules.get(protocol).ok_or_else(|| UnknownProtocol {
        role,
        protocol: protocol.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        manifest::ManifestData,
        replica::{Event, Replica},
        store::Reducer,
    };

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl Reducer for Noop {
        async fn load(&mut self, _replica: &Replica) -> Result<()> {
            Ok(())
        }

        async fn update(&mut self, _replica: &Replica, _event: &Event) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NoopStore;

    impl StoreModule for NoopStore {
        fn protocol(&self) -> &'static str {
            "/test/store"
        }

        fn create(&self, _manifest: &Manifest) -> Box<dyn Reducer> {
            Box::new(Noop)
        }
    }

    #[test]
    fn resolve_known_and_unknown() {
        let manifest = Manifest::create(ManifestData::new("db", "/test/store")).unwrap();
        let err = Registry::new().resolve(&manifest).unwrap_err();
        assert_eq!(err.role, "store");

        let registry = Registry::new().with_store(NoopStore);
        let components = registry.resolve(&manifest).unwrap();
        assert_eq!(components.entry.protocol(), crate::entry::BASAL_PROTOCOL);
        assert_eq!(components.store.protocol(), "/test/store");

        let mut data = ManifestData::new("db", "/test/store");
        data.identity.protocol = "/nope".into();
        let err = registry
            .resolve(&Manifest::create(data).unwrap())
            .unwrap_err();
        assert_eq!(err.role, "identity");
        assert_eq!(err.protocol, "/nope");
    }
}
