//! Access control: who may append to a database.

use std::{collections::BTreeSet, fmt::Debug, sync::Arc};

use welo_base::PublicKey;

use crate::{entry::Entry, identity::Identity, manifest::Manifest};

/// Protocol name of [`StaticAccess`].
pub const STATIC_PROTOCOL: &str = "/welo/access/static/1.0.0";

/// Write list wildcard admitting every identity.
pub const ANY: &str = "*";

/// Decides whether an identity may append an entry.
pub trait Accessor: Debug + Send + Sync + 'static {
    /// Whether `identity` may append `entry`.
    fn can_append(&self, entry: &Entry, identity: &Identity) -> bool;
}

/// Builds the [`Accessor`] of a database from its manifest.
pub trait AccessModule: Debug + Send + Sync + 'static {
    /// Protocol name this module is registered under.
    fn protocol(&self) -> &'static str;

    /// Create the accessor configured by `manifest`.
    fn create(&self, manifest: &Manifest) -> Arc<dyn Accessor>;
}

/// A fixed write list taken from the manifest.
#[derive(Debug, Clone, Default)]
pub struct StaticAccess {
    write: BTreeSet<String>,
}

impl StaticAccess {
    /// Allow the listed identity ids. The entry `"*"` allows everyone.
    pub fn new<I, S>(write: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            write: write.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the identity named `id` may write.
    pub fn can_write(&self, id: &PublicKey) -> bool {
        self.write.contains(ANY) || self.write.contains(&id.to_string())
    }
}

impl Accessor for StaticAccess {
    fn can_append(&self, _entry: &Entry, identity: &Identity) -> bool {
        self.can_write(identity.id())
    }
}

/// [`AccessModule`] creating a [`StaticAccess`] from `access.config.write`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAccessModule;

impl AccessModule for StaticAccessModule {
    fn protocol(&self) -> &'static str {
        STATIC_PROTOCOL
    }

    fn create(&self, manifest: &Manifest) -> Arc<dyn Accessor> {
        Arc::new(StaticAccess::new(
            manifest.data().access.config.write.iter().cloned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use welo_base::SecretKey;

    use super::*;
    use crate::{
        entry::{BasalEntry, EntryFormat},
        identity::LocalIdentity,
        manifest::ManifestData,
    };

    #[test]
    fn write_list() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let alice = SecretKey::generate(&mut rng).public();
        let bob = SecretKey::generate(&mut rng).public();

        let access = StaticAccess::new([alice.to_string()]);
        assert!(access.can_write(&alice));
        assert!(!access.can_write(&bob));

        let open = StaticAccess::new([ANY]);
        assert!(open.can_write(&bob));

        assert!(!StaticAccess::default().can_write(&alice));
    }

    #[test]
    fn module_reads_manifest() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let me = LocalIdentity::generate(&mut rng).unwrap();
        let manifest =
            Manifest::create(ManifestData::new("db", "/test/store").writer(me.identity().id()))
                .unwrap();
        let entry = BasalEntry
            .create(&me, manifest.tag(), bytes::Bytes::from_static(b"op"), vec![])
            .unwrap();
        let access = StaticAccessModule.create(&manifest);
        assert!(access.can_append(&entry, me.identity()));

        let stranger = LocalIdentity::generate(&mut rng).unwrap();
        assert!(!access.can_append(&entry, stranger.identity()));
    }
}
