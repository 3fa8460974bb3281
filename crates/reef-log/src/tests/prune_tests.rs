//! Tests for pruning.

use super::{append, make_entry, test_identity, test_log};
use crate::entry::EntryType;
use crate::log::AppendOptions;

#[tokio::test]
async fn test_prune_keeps_heads_and_shallow_rows() {
    let (log, store) = test_log(1).await;
    let a = append(&log, "a").await;
    let b = append(&log, "b").await;
    let c = append(&log, "c").await;
    let mut changes = log.subscribe();

    let mut pruned = log.prune(|_| true).await.unwrap();
    pruned.sort();
    let mut expected = vec![a.hash(), b.hash()];
    expected.sort();
    assert_eq!(pruned, expected);

    let change = changes.recv().await.unwrap();
    assert_eq!(change.removed.len(), 2);

    assert_eq!(log.length().await.unwrap(), 1);
    assert_eq!(store.len(), 1);
    assert!(!log.has(&a.hash()).await.unwrap());
    assert!(log.get(&a.hash()).await.unwrap().is_none());
    assert_eq!(log.head_hashes().await.unwrap(), vec![c.hash()]);

    // Ancestry metadata survives the blocks.
    let ancestors = log.ancestors(&c.hash()).await.unwrap();
    assert!(ancestors.contains(&a.hash()) && ancestors.contains(&b.hash()));
}

#[tokio::test]
async fn test_children_of_pruned_entries_still_join() {
    let (log, _store) = test_log(1).await;
    let a = append(&log, "a").await;
    let b = append(&log, "b").await;
    log.prune(|e| e.hash() == a.hash()).await.unwrap();

    let remote = test_identity(4);
    let sibling = make_entry(&remote, "sibling", std::slice::from_ref(&a), 0);
    let outcome = log.join(vec![sibling.clone()]).await.unwrap();

    assert_eq!(outcome.added_hashes(), vec![sibling.hash()]);
    assert!(outcome.missing.is_empty());
    assert_eq!(log.heads().await.unwrap().len(), 2);
    assert!(log.has(&b.hash()).await.unwrap());
}

#[tokio::test]
async fn test_rejoining_pruned_entry_is_noop() {
    let (log, _store) = test_log(1).await;
    let a = append(&log, "a").await;
    append(&log, "b").await;
    log.prune(|_| true).await.unwrap();

    let outcome = log.join(vec![a.clone()]).await.unwrap();
    assert!(outcome.added.is_empty());
    assert_eq!(log.length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cut_makes_ancestors_disposable() {
    let (log, _store) = test_log(1).await;
    let a = append(&log, "a").await;
    let b = append(&log, "b").await;
    let cut = log
        .append(
            b"checkpoint".to_vec(),
            AppendOptions {
                kind: EntryType::Cut,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .entry;
    let d = append(&log, "d").await;

    let mut pruned = log.prune(|_| false).await.unwrap();
    pruned.sort();
    let mut expected = vec![a.hash(), b.hash()];
    expected.sort();
    assert_eq!(pruned, expected);

    assert!(log.has(&cut.hash()).await.unwrap());
    assert!(log.has(&d.hash()).await.unwrap());
    assert_eq!(log.length().await.unwrap(), 2);
}

#[tokio::test]
async fn test_prune_nothing_when_predicate_refuses() {
    let (log, store) = test_log(1).await;
    append(&log, "a").await;
    append(&log, "b").await;

    assert!(log.prune(|_| false).await.unwrap().is_empty());
    assert_eq!(log.length().await.unwrap(), 2);
    assert_eq!(store.len(), 2);
}
