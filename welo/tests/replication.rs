use std::collections::BTreeSet;

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use testresult::TestResult;
use welo::{
    entry::{BasalEntry, EntryFormat},
    error::{EntryError, WriteError},
    Cid, Entry, Manifest, ManifestData, Replica,
};

mod common;

use common::{identities, manifest, replica, STORE};

fn put(key: &str, value: i64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({"op": "put", "key": key, "value": value}))
        .expect("json")
}

/// A small graph with forks and joins written by two writers.
async fn history(a: &Replica, b: &Replica) -> TestResult<Vec<Entry>> {
    let mut all = Vec::new();
    for i in 0..4 {
        all.push(a.write(put("a", i)).await?);
        all.push(b.write(put("b", i)).await?);
        if i % 2 == 1 {
            let outcome = a.merge(all.clone()).await?;
            assert!(outcome.rejected.is_empty());
            let outcome = b.merge(all.clone()).await?;
            assert!(outcome.rejected.is_empty());
        }
    }
    Ok(all)
}

#[tokio::test]
async fn sibling_writes_are_both_kept() -> TestResult {
    let ids = identities(100, 3);
    let manifest = manifest(&[&ids[0], &ids[1]]);
    let a = replica(&manifest, &ids[0], &[]).await?;
    let b = replica(&manifest, &ids[1], &[]).await?;
    let peer = replica(&manifest, &ids[2], &[&ids[0], &ids[1]]).await?;

    let x = a.write(put("k", 1)).await?;
    let y = b.write(put("k", 1)).await?;
    assert_ne!(x.cid(), y.cid());

    let outcome = peer.merge(vec![x.clone(), y.clone()]).await?;
    assert_eq!(outcome.admitted.len(), 2);
    let heads: BTreeSet<Cid> = peer.heads().await.into_iter().collect();
    assert_eq!(heads, BTreeSet::from([*x.cid(), *y.cid()]));

    let diff = peer.diff(&Replica::empty_root(), None).await?;
    let local: BTreeSet<Cid> = diff.local_only().copied().collect();
    assert_eq!(local, heads);
    assert_eq!(diff.remote_only().count(), 0);

    // against one writer, only the other writer's entry is missing there
    let diff = peer.diff(&a.root().await, Some(a.blocks())).await?;
    assert_eq!(diff.local_only().collect::<Vec<_>>(), vec![y.cid()]);
    assert_eq!(diff.remote_only().count(), 0);
    Ok(())
}

#[tokio::test]
async fn merge_order_and_repetition_do_not_matter() -> TestResult {
    let ids = identities(101, 2);
    let manifest = manifest(&[&ids[0], &ids[1]]);
    let a = replica(&manifest, &ids[0], &[&ids[1]]).await?;
    let b = replica(&manifest, &ids[1], &[&ids[0]]).await?;
    let all = history(&a, &b).await?;
    a.merge(all.clone()).await?;
    let expected = a.root().await;

    for seed in 0..8 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut shuffled = all.clone();
        shuffled.extend(all.iter().take(3).cloned());
        shuffled.shuffle(&mut rng);

        let reader = replica(&manifest, &ids[0], &[&ids[0], &ids[1]]).await?;
        let outcome = reader.merge(shuffled.clone()).await?;
        assert_eq!(outcome.admitted.len(), all.len());
        assert!(outcome.rejected.is_empty());
        assert_eq!(reader.root().await, expected);

        let again = reader.merge(shuffled).await?;
        assert!(again.admitted.is_empty());
        assert_eq!(reader.root().await, expected);
        assert_eq!(
            reader.traverse().await.iter().map(Entry::cid).collect::<Vec<_>>(),
            a.traverse().await.iter().map(Entry::cid).collect::<Vec<_>>(),
        );
    }
    Ok(())
}

#[tokio::test]
async fn admitted_entries_have_their_parents() -> TestResult {
    let ids = identities(102, 2);
    let manifest = manifest(&[&ids[0]]);
    let writer = replica(&manifest, &ids[0], &[]).await?;
    let reader = replica(&manifest, &ids[1], &[&ids[0]]).await?;

    let mut chain = Vec::new();
    for i in 0..6 {
        chain.push(writer.write(put("k", i)).await?);
    }
    // drop the third entry: everything after it stays out
    let partial: Vec<Entry> = chain
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2)
        .map(|(_, e)| e.clone())
        .collect();
    let outcome = reader.merge(partial).await?;
    assert_eq!(outcome.admitted.len(), 2);
    assert_eq!(outcome.rejected.len(), 3);
    assert!(outcome
        .rejected
        .iter()
        .all(|err| matches!(err, EntryError::MissingParents { .. })));
    for entry in reader.traverse().await {
        for parent in entry.next() {
            assert!(reader.has(parent).await);
        }
    }

    let outcome = reader.merge(chain).await?;
    assert_eq!(outcome.admitted.len(), 4);
    assert_eq!(reader.root().await, writer.root().await);
    Ok(())
}

#[tokio::test]
async fn diff_lists_exactly_the_difference() -> TestResult {
    let ids = identities(103, 2);
    let manifest = manifest(&[&ids[0], &ids[1]]);
    let a = replica(&manifest, &ids[0], &[&ids[1]]).await?;
    let b = replica(&manifest, &ids[1], &[&ids[0]]).await?;
    let shared = history(&a, &b).await?;
    a.merge(shared.clone()).await?;
    b.merge(shared).await?;
    assert_eq!(a.root().await, b.root().await);
    assert!(a.diff(&b.root().await, None).await?.is_empty());

    let mut only_a = BTreeSet::new();
    for i in 0..40 {
        only_a.insert(*a.write(put("a", 100 + i)).await?.cid());
    }
    let only_b = BTreeSet::from([*b.write(put("b", 100)).await?.cid()]);

    let diff = a.diff(&b.root().await, Some(b.blocks())).await?;
    assert_eq!(diff.local_only().copied().collect::<BTreeSet<_>>(), only_a);
    assert_eq!(diff.remote_only().copied().collect::<BTreeSet<_>>(), only_b);

    let reverse = b.diff(&a.root().await, Some(a.blocks())).await?;
    assert_eq!(reverse.local_only().copied().collect::<BTreeSet<_>>(), only_b);
    assert_eq!(reverse.remote_only().copied().collect::<BTreeSet<_>>(), only_a);
    Ok(())
}

#[tokio::test]
async fn writers_outside_the_manifest_are_refused() -> TestResult {
    let ids = identities(104, 2);
    let manifest = manifest(&[&ids[0]]);
    let owner = replica(&manifest, &ids[0], &[&ids[1]]).await?;
    let intruder = replica(&manifest, &ids[1], &[]).await?;

    let err = intruder.write(put("k", 1)).await.unwrap_err();
    assert!(matches!(err, WriteError::Unauthorized(_)), "{err}");
    assert!(intruder.is_empty().await);

    // a correctly signed entry from a writer the manifest does not list
    let forged = BasalEntry.create(&ids[1], manifest.tag(), put("k", 1).into(), vec![])?;
    let outcome = owner.merge(vec![forged.clone()]).await?;
    assert!(outcome.admitted.is_empty());
    assert!(matches!(
        &outcome.rejected[..],
        [EntryError::Unauthorized { cid, .. }] if cid == forged.cid()
    ));
    assert!(owner.is_empty().await);

    // the same entry is accepted where anyone may write
    let open = Manifest::create(ManifestData::new("integration", STORE).write_any())?;
    let forged = BasalEntry.create(&ids[1], open.tag(), put("k", 1).into(), vec![])?;
    let anyone = replica(&open, &ids[0], &[&ids[1]]).await?;
    assert_eq!(anyone.merge(vec![forged]).await?.admitted.len(), 1);
    Ok(())
}

#[tokio::test]
async fn entries_of_another_database_are_rejected() -> TestResult {
    let ids = identities(105, 1);
    let first = manifest(&[&ids[0]]);
    let second = Manifest::create(ManifestData::new("other", STORE).writer(ids[0].identity().id()))?;
    let a = replica(&first, &ids[0], &[]).await?;
    let b = replica(&second, &ids[0], &[&ids[0]]).await?;

    let entry = a.write(put("k", 1)).await?;
    let outcome = b.merge(vec![entry]).await?;
    assert!(outcome.admitted.is_empty());
    assert!(matches!(&outcome.rejected[..], [EntryError::Malformed { .. }]));
    Ok(())
}
