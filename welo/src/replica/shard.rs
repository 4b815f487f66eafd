//! Persistent, content-addressed index over entry identifiers.
//!
//! A hash array mapped trie: each branch fans out over one nibble of the key's digest, each leaf
//! holds up to [`LEAF_CAPACITY`] sorted keys. The shape depends only on the set of keys, never on
//! insertion order, so two replicas holding the same entries share a root and every identical
//! subtree. Diffing two roots therefore only visits the nodes along the paths that differ.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use welo_base::{Block, Cid};

use crate::{
    blocks::{BlockFetcher, Blocks},
    error::StorageError,
};

/// Keys a leaf holds before it splits.
pub const LEAF_CAPACITY: usize = 32;

/// Depth at which leaves stop splitting: the number of nibbles in a sha2-256 digest.
pub const MAX_DEPTH: usize = 64;

/// Encoding of the empty leaf, the root of an empty index.
const EMPTY_LEAF: [u8; 2] = [0, 0];

/// A node of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Sorted, unique keys.
    Leaf(Vec<Cid>),
    /// Children by nibble. Empty children are omitted.
    Branch(BTreeMap<u8, Cid>),
}

/// The root block of an empty index.
pub fn empty() -> Block {
    Block::new(EMPTY_LEAF.to_vec())
}

fn nibble(key: &Cid, depth: usize) -> u8 {
    match key.hash().digest().get(depth / 2) {
        Some(byte) if depth % 2 == 0 => byte >> 4,
        Some(byte) => byte & 0x0f,
        None => 0,
    }
}

async fn load(fetcher: &dyn BlockFetcher, cid: &Cid) -> Result<(Block, Node), StorageError> {
    let block = fetcher
        .fetch(cid)
        .await?
        .ok_or(StorageError::NotFound(*cid))?;
    let node = Blocks::decode(&block)?;
    Ok((block, node))
}

/// Build the canonical subtree for `keys`, which must be sorted, unique and share their path
/// down to `depth`.
fn build(keys: Vec<Cid>, depth: usize, out: &mut Vec<Block>) -> Result<Cid, StorageError> {
    let node = if keys.len() <= LEAF_CAPACITY || depth >= MAX_DEPTH {
        Node::Leaf(keys)
    } else {
        let mut buckets: BTreeMap<u8, Vec<Cid>> = BTreeMap::new();
        for key in keys {
            buckets.entry(nibble(&key, depth)).or_default().push(key);
        }
        let mut children = BTreeMap::new();
        for (n, keys) in buckets {
            children.insert(n, build(keys, depth + 1, out)?);
        }
        Node::Branch(children)
    };
    let block = Blocks::encode(&node)?;
    let cid = *block.cid();
    out.push(block);
    Ok(cid)
}

/// Build an index from scratch. Returns the root and every node.
pub fn build_from_keys(keys: impl IntoIterator<Item = Cid>) -> Result<(Cid, Vec<Block>), StorageError> {
    let keys: BTreeSet<Cid> = keys.into_iter().collect();
    let mut blocks = Vec::new();
    let root = build(keys.into_iter().collect(), 0, &mut blocks)?;
    Ok((root, blocks))
}

/// Result of [`insert`].
#[derive(Debug, Clone)]
pub struct Update {
    /// The new root.
    pub root: Cid,
    /// Nodes reachable from `root` that did not exist before.
    pub blocks: Vec<Block>,
}

/// Insert `keys` below `root`.
///
/// Reads existing nodes through `fetcher` and does not write anything; the caller stores
/// [`Update::blocks`].
pub async fn insert(
    fetcher: &dyn BlockFetcher,
    root: &Cid,
    keys: impl IntoIterator<Item = Cid>,
) -> Result<Update, StorageError> {
    let mut staged: HashMap<Cid, Block> = HashMap::new();
    let mut root = *root;

    for key in keys {
        let mut path: Vec<(BTreeMap<u8, Cid>, u8)> = Vec::new();
        let mut cid = root;
        let mut depth = 0;
        let replacement = loop {
            let node = match staged.get(&cid) {
                Some(block) => Blocks::decode(block)?,
                None => load(fetcher, &cid).await?.1,
            };
            match node {
                Node::Branch(children) => {
                    let n = nibble(&key, depth);
                    let child = children.get(&n).copied();
                    path.push((children, n));
                    match child {
                        Some(child) => {
                            cid = child;
                            depth += 1;
                        }
                        None => break Some(stage(&mut staged, Node::Leaf(vec![key]))?),
                    }
                }
                Node::Leaf(mut leaf) => {
                    let Err(pos) = leaf.binary_search(&key) else {
                        break None;
                    };
                    leaf.insert(pos, key);
                    let mut out = Vec::new();
                    let cid = build(leaf, depth, &mut out)?;
                    staged.extend(out.into_iter().map(|b| (*b.cid(), b)));
                    break Some(cid);
                }
            }
        };
        let Some(mut cid) = replacement else {
            continue;
        };
        while let Some((mut children, n)) = path.pop() {
            children.insert(n, cid);
            cid = stage(&mut staged, Node::Branch(children))?;
        }
        root = cid;
    }

    // keep only the staged nodes the final root still uses
    let mut blocks = Vec::new();
    let mut stack = vec![root];
    while let Some(cid) = stack.pop() {
        let Some(block) = staged.remove(&cid) else {
            continue;
        };
        if let Node::Branch(children) = Blocks::decode(&block)? {
            stack.extend(children.into_values());
        }
        blocks.push(block);
    }
    Ok(Update { root, blocks })
}

fn stage(staged: &mut HashMap<Cid, Block>, node: Node) -> Result<Cid, StorageError> {
    let block = Blocks::encode(&node)?;
    let cid = *block.cid();
    staged.insert(cid, block);
    Ok(cid)
}

/// Every key below `root`.
pub async fn keys(fetcher: &dyn BlockFetcher, root: &Cid) -> Result<Vec<Cid>, StorageError> {
    let (block, node) = load(fetcher, root).await?;
    let mut keys = BTreeSet::new();
    expand(fetcher, block, node, &mut keys, &mut Vec::new()).await?;
    Ok(keys.into_iter().collect())
}

/// Collect all keys and nodes of the subtree rooted at `node`.
async fn expand(
    fetcher: &dyn BlockFetcher,
    block: Block,
    node: Node,
    keys: &mut BTreeSet<Cid>,
    nodes: &mut Vec<Block>,
) -> Result<(), StorageError> {
    let mut stack = vec![(block, node)];
    while let Some((block, node)) = stack.pop() {
        match node {
            Node::Leaf(leaf) => keys.extend(leaf),
            Node::Branch(children) => {
                for child in children.values() {
                    stack.push(load(fetcher, child).await?);
                }
            }
        }
        nodes.push(block);
    }
    Ok(())
}

/// Which side of a diff holds a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    /// Present below the local root.
    pub local: bool,
    /// Present below the remote root.
    pub remote: bool,
}

/// Index nodes that differ between two roots.
#[derive(Debug, Clone, Default)]
pub struct ShardDiff {
    /// Local nodes the remote side lacks. Together with the remote nodes they reconstruct the
    /// local root.
    pub additions: Vec<Block>,
    /// Remote nodes the local side does not use.
    pub removals: Vec<Cid>,
}

/// Difference between a local and a remote root.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Keys present on exactly one side.
    pub keys: BTreeMap<Cid, Presence>,
    /// Nodes present on exactly one side.
    pub shards: ShardDiff,
}

impl Diff {
    /// Keys only the local side has.
    pub fn local_only(&self) -> impl Iterator<Item = &Cid> {
        self.keys
            .iter()
            .filter(|(_, p)| p.local && !p.remote)
            .map(|(k, _)| k)
    }

    /// Keys only the remote side has.
    pub fn remote_only(&self) -> impl Iterator<Item = &Cid> {
        self.keys
            .iter()
            .filter(|(_, p)| p.remote && !p.local)
            .map(|(k, _)| k)
    }

    /// Whether both roots hold the same keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Compare two roots, visiting only the nodes that differ.
///
/// Nodes of both trees are read through `fetcher`, so it must be able to reach the remote
/// side's blocks.
pub async fn diff(
    fetcher: &dyn BlockFetcher,
    local: &Cid,
    remote: &Cid,
) -> Result<Diff, StorageError> {
    let mut out = Diff::default();
    let mut stack = vec![(Some(*local), Some(*remote))];
    while let Some((l, r)) = stack.pop() {
        if l == r {
            continue;
        }
        let l = match l {
            Some(cid) => Some(load(fetcher, &cid).await?),
            None => None,
        };
        let r = match r {
            Some(cid) => Some(load(fetcher, &cid).await?),
            None => None,
        };
        match (l, r) {
            (Some((lb, Node::Branch(lc))), Some((rb, Node::Branch(rc)))) => {
                out.shards.additions.push(lb);
                out.shards.removals.push(*rb.cid());
                let nibbles: BTreeSet<u8> = lc.keys().chain(rc.keys()).copied().collect();
                for n in nibbles {
                    stack.push((lc.get(&n).copied(), rc.get(&n).copied()));
                }
            }
            (l, r) => {
                let mut local_keys = BTreeSet::new();
                let mut remote_keys = BTreeSet::new();
                if let Some((block, node)) = l {
                    expand(fetcher, block, node, &mut local_keys, &mut out.shards.additions)
                        .await?;
                }
                if let Some((block, node)) = r {
                    let mut nodes = Vec::new();
                    expand(fetcher, block, node, &mut remote_keys, &mut nodes).await?;
                    out.shards.removals.extend(nodes.iter().map(|b| *b.cid()));
                }
                for key in local_keys.symmetric_difference(&remote_keys) {
                    let presence = Presence {
                        local: local_keys.contains(key),
                        remote: remote_keys.contains(key),
                    };
                    out.keys.insert(*key, presence);
                }
            }
        }
    }
    Ok(out)
}
