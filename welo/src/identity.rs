//! Identities: content-addressed records binding a root key to a signing key.
//!
//! The root key (`id`) names the identity and is what access control lists refer to. It
//! delegates to a signing key (`signer`) that signs entries, so the root key can stay offline.

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use welo_base::{Block, Cid, PublicKey, SecretKey, Signature};

use crate::{blocks::Blocks, error::SigningError};

/// Protocol name of [`BasalIdentity`].
pub const BASAL_PROTOCOL: &str = "/welo/identity/basal/1.0.0";

/// Domain separation for delegation signatures.
const DELEGATION_CONTEXT: &[u8] = b"welo/identity/delegation";

/// Encoded form of an identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityData {
    /// Root key naming the identity.
    pub id: PublicKey,
    /// Key that signs entries on behalf of `id`.
    pub signer: PublicKey,
    /// Signature by `id` over `signer`.
    pub delegation: Signature,
}

fn delegation_message(signer: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DELEGATION_CONTEXT.len() + PublicKey::LENGTH);
    msg.extend_from_slice(DELEGATION_CONTEXT);
    msg.extend_from_slice(signer.as_bytes());
    msg
}

/// An identity record together with the block it is stored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    block: Block,
    data: IdentityData,
}

impl Identity {
    /// Decode an identity from its block and check the delegation signature.
    pub fn from_block(block: Block) -> Result<Self> {
        let data: IdentityData = Blocks::decode(&block).context("decoding identity")?;
        data.id
            .verify(&delegation_message(&data.signer), &data.delegation)
            .map_err(|_| anyhow!("invalid delegation in identity {}", block.cid()))?;
        Ok(Self { block, data })
    }

    /// Content identifier, the value entries reference in `auth`.
    pub fn cid(&self) -> &Cid {
        self.block.cid()
    }

    /// The block holding the record.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Root key naming this identity.
    pub fn id(&self) -> &PublicKey {
        &self.data.id
    }

    /// Key that signs entries.
    pub fn signer(&self) -> &PublicKey {
        &self.data.signer
    }
}

/// An identity whose signing key is held locally.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    identity: Identity,
    signer: SecretKey,
}

impl LocalIdentity {
    /// Generate a fresh root key and signing key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let root = SecretKey::generate(rng);
        let signer = SecretKey::generate(rng);
        Self::delegate(&root, signer)
    }

    /// Delegate from `root` to `signer`.
    pub fn delegate(root: &SecretKey, signer: SecretKey) -> Result<Self> {
        let data = IdentityData {
            id: root.public(),
            signer: signer.public(),
            delegation: root.sign(&delegation_message(&signer.public())),
        };
        let block = Blocks::encode(&data)?;
        let identity = Identity { block, data };
        Ok(Self { identity, signer })
    }

    /// Pair a published identity with its signing key.
    pub fn from_parts(identity: Identity, signer: SecretKey) -> Self {
        Self { identity, signer }
    }

    /// The public record.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sign `data` with the delegated key.
    ///
    /// Fails if the held key is not the one the record delegates to.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, SigningError> {
        if self.signer.public() != *self.identity.signer() {
            return Err(SigningError(format!(
                "held key {} is not the signer of identity {}",
                self.signer.public().fmt_short(),
                self.identity.id().fmt_short()
            )));
        }
        Ok(self.signer.sign(data))
    }
}

/// Resolves identity references and checks signatures made by identities.
#[async_trait]
pub trait IdentityVerifier: Debug + Send + Sync + 'static {
    /// Protocol name this verifier is registered under.
    fn protocol(&self) -> &'static str;

    /// Interpret a block as an identity record.
    fn as_identity(&self, block: Block) -> Result<Identity>;

    /// Resolve the identity stored under `auth`.
    async fn fetch(&self, blocks: &Blocks, auth: &Cid) -> Result<Identity> {
        let block = blocks
            .get(auth)
            .await?
            .ok_or_else(|| anyhow!("identity {auth} not found"))?;
        self.as_identity(block)
    }

    /// Whether `signature` over `data` was made by `identity`.
    fn verify(&self, data: &[u8], signature: &Signature, identity: &Identity) -> bool;
}

/// The default identity format: a root key delegating to a single signing key.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasalIdentity;

#[async_trait]
impl IdentityVerifier for BasalIdentity {
    fn protocol(&self) -> &'static str {
        BASAL_PROTOCOL
    }

    fn as_identity(&self, block: Block) -> Result<Identity> {
        Identity::from_block(block)
    }

    fn verify(&self, data: &[u8], signature: &Signature, identity: &Identity) -> bool {
        identity.signer().verify(data, signature).is_ok()
    }
}
