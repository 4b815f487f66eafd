//! The causal graph of admitted entries.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use welo_base::Cid;

use crate::{entry::Entry, error::EntryError};

/// Admitted entries, their heads and the index root covering them.
#[derive(Debug, Clone)]
pub(crate) struct Graph {
    pub(crate) root: Cid,
    nodes: BTreeMap<Cid, Entry>,
    heads: BTreeSet<Cid>,
    referenced: BTreeSet<Cid>,
}

impl Graph {
    pub(crate) fn new(root: Cid) -> Self {
        Self {
            root,
            nodes: BTreeMap::new(),
            heads: BTreeSet::new(),
            referenced: BTreeSet::new(),
        }
    }

    pub(crate) fn has(&self, cid: &Cid) -> bool {
        self.nodes.contains_key(cid)
    }

    pub(crate) fn get(&self, cid: &Cid) -> Option<&Entry> {
        self.nodes.get(cid)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn heads(&self) -> &BTreeSet<Cid> {
        &self.heads
    }

    /// Add an entry whose parents are all present.
    pub(crate) fn add(&mut self, entry: Entry) {
        debug_assert!(entry.next().iter().all(|p| self.has(p)));
        for parent in entry.next() {
            self.heads.remove(parent);
            self.referenced.insert(*parent);
        }
        let cid = *entry.cid();
        if !self.referenced.contains(&cid) {
            self.heads.insert(cid);
        }
        self.nodes.insert(cid, entry);
    }

    /// Order `candidates` so every entry comes after its parents.
    ///
    /// Candidates already in the graph must be filtered out by the caller. Returns the
    /// admissible entries in causal order, and an error for every candidate with a parent that
    /// is neither in the graph nor admissible.
    pub(crate) fn order(&self, candidates: Vec<Entry>) -> (Vec<Entry>, Vec<EntryError>) {
        let mut pending: BTreeMap<Cid, (Entry, usize)> = BTreeMap::new();
        for entry in candidates {
            pending.insert(*entry.cid(), (entry, 0));
        }

        // child lists keyed by the pending parent they wait for
        let mut waiting: HashMap<Cid, Vec<Cid>> = HashMap::new();
        let mut ready = BTreeSet::new();
        for (cid, (entry, missing)) in pending.iter_mut() {
            for parent in entry.next() {
                if !self.has(parent) {
                    *missing += 1;
                    waiting.entry(*parent).or_default().push(*cid);
                }
            }
            if *missing == 0 {
                ready.insert(*cid);
            }
        }

        let mut admitted = Vec::new();
        while let Some(cid) = ready.pop_first() {
            let Some((entry, _)) = pending.remove(&cid) else {
                continue;
            };
            for child in waiting.remove(&cid).unwrap_or_default() {
                if let Some((_, missing)) = pending.get_mut(&child) {
                    *missing -= 1;
                    if *missing == 0 {
                        ready.insert(child);
                    }
                }
            }
            admitted.push(entry);
        }

        let present: BTreeSet<Cid> = admitted.iter().map(|e| *e.cid()).collect();
        let rejected = pending
            .into_values()
            .map(|(entry, _)| EntryError::MissingParents {
                cid: *entry.cid(),
                missing: entry
                    .next()
                    .iter()
                    .filter(|p| !self.has(p) && !present.contains(p))
                    .copied()
                    .collect(),
            })
            .collect();
        (admitted, rejected)
    }

    /// All entries, parents before children, ties broken by identifier.
    pub(crate) fn traverse(&self) -> Vec<Entry> {
        let mut missing: BTreeMap<Cid, usize> = BTreeMap::new();
        let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();
        let mut ready = BTreeSet::new();
        for (cid, entry) in &self.nodes {
            missing.insert(*cid, entry.next().len());
            for parent in entry.next() {
                children.entry(*parent).or_default().push(*cid);
            }
            if entry.next().is_empty() {
                ready.insert(*cid);
            }
        }
        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some(cid) = ready.pop_first() {
            for child in children.remove(&cid).unwrap_or_default() {
                if let Some(count) = missing.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(child);
                    }
                }
            }
            if let Some(entry) = self.nodes.get(&cid) {
                out.push(entry.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::{
        entry::{BasalEntry, EntryFormat},
        identity::LocalIdentity,
        replica::shard,
    };

    fn entry(me: &LocalIdentity, payload: &'static [u8], next: &[&Entry]) -> Entry {
        BasalEntry
            .create(
                me,
                Bytes::new(),
                Bytes::from_static(payload),
                next.iter().map(|e| *e.cid()).collect(),
            )
            .unwrap()
    }

    #[test]
    fn heads_follow_admission() {
        let me = LocalIdentity::generate(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let a = entry(&me, b"a", &[]);
        let b = entry(&me, b"b", &[&a]);
        let c = entry(&me, b"c", &[&a]);
        let mut graph = Graph::new(*shard::empty().cid());
        graph.add(a.clone());
        assert_eq!(graph.heads(), &BTreeSet::from([*a.cid()]));
        graph.add(b.clone());
        graph.add(c.clone());
        assert_eq!(graph.heads(), &BTreeSet::from([*b.cid(), *c.cid()]));
        let d = entry(&me, b"d", &[&b, &c]);
        graph.add(d.clone());
        assert_eq!(graph.heads(), &BTreeSet::from([*d.cid()]));
        assert_eq!(graph.len(), 4);

        let order: Vec<Cid> = graph.traverse().iter().map(|e| *e.cid()).collect();
        assert_eq!(order[0], *a.cid());
        assert_eq!(order[3], *d.cid());
        let (first, second) = if b.cid() < c.cid() { (&b, &c) } else { (&c, &b) };
        assert_eq!(&order[1..3], &[*first.cid(), *second.cid()]);
    }

    #[test]
    fn order_reports_unresolved_parents() {
        let me = LocalIdentity::generate(&mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        let a = entry(&me, b"a", &[]);
        let b = entry(&me, b"b", &[&a]);
        let c = entry(&me, b"c", &[&b]);
        let orphan_parent = entry(&me, b"x", &[]);
        let orphan = entry(&me, b"y", &[&orphan_parent]);

        let graph = Graph::new(*shard::empty().cid());
        // children first: ordering must not depend on arrival
        let (admitted, rejected) = graph.order(vec![c.clone(), orphan.clone(), b.clone(), a.clone()]);
        let admitted: Vec<Cid> = admitted.iter().map(|e| *e.cid()).collect();
        assert_eq!(admitted, vec![*a.cid(), *b.cid(), *c.cid()]);
        assert_eq!(rejected.len(), 1);
        match &rejected[0] {
            EntryError::MissingParents { cid, missing } => {
                assert_eq!(cid, orphan.cid());
                assert_eq!(missing, &vec![*orphan_parent.cid()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
