mod common;

use std::sync::mpsc;

use revdb::{RevId, RevisionStore, Status};
use serde_json::json;

fn history(ids: &[&str]) -> Vec<RevId> {
    ids.iter().map(|id| id.parse().unwrap()).collect()
}

#[test]
fn test_divergent_history_is_kept_as_conflict() -> anyhow::Result<()> {
    common::init_tracing();
    let store = RevisionStore::in_memory()?;

    store.force_insert("doc", &history(&["1-a", "2-local"]), json!({"side": "local"}), false, None)?;
    let status = store.force_insert(
        "doc",
        &history(&["1-a", "2-remote", "3-remote"]),
        json!({"side": "remote"}),
        false,
        Some("peer"),
    )?;
    assert_eq!(status, Status::Created);

    let leaves = store.all_revisions_of("doc", true)?;
    assert_eq!(leaves.len(), 2);

    // Higher generation wins; the other leaf is reported, not dropped
    let winner = store.get_document("doc", None)?;
    assert_eq!(winner.rev_id.to_string(), "3-remote");
    assert_eq!(winner.get("side"), Some(&json!("remote")));
    assert_eq!(store.conflicting_revisions("doc")?, history(&["2-local"]));

    let stub = store.get_document("doc", Some(&"2-remote".parse::<RevId>()?))?;
    assert!(stub.properties.is_none());
    assert!(!stub.current);
    Ok(())
}

#[test]
fn test_winner_compares_generations_numerically() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    let long: Vec<String> = (1..=10).map(|g| format!("{}-long", g)).collect();
    let long: Vec<&str> = long.iter().map(String::as_str).collect();
    store.force_insert("doc", &history(&long), json!({"branch": "long"}), false, None)?;

    let short: Vec<String> = (1..=9).map(|g| format!("{}-zzzz", g)).collect();
    let short: Vec<&str> = short.iter().map(String::as_str).collect();
    store.force_insert("doc", &history(&short), json!({"branch": "short"}), false, None)?;

    // "10-long" sorts before "9-zzzz" as text but wins on generation
    let winner = store.get_document("doc", None)?;
    assert_eq!(winner.rev_id.to_string(), "10-long");
    assert_eq!(store.all_revisions_of("doc", true)?.winner().unwrap().rev_id, winner.rev_id);

    // Same generation: digest byte order decides
    store.force_insert("tie", &history(&["1-aaa"]), json!({}), false, None)?;
    store.force_insert("tie", &history(&["1-bbb"]), json!({}), false, None)?;
    assert_eq!(store.get_document("tie", None)?.rev_id.to_string(), "1-bbb");
    Ok(())
}

#[test]
fn test_known_history_is_a_noop() -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel();
    let store = RevisionStore::in_memory()?.with_listener(tx);
    let ids = history(&["1-a", "2-b", "3-c"]);

    assert_eq!(store.force_insert("doc", &ids, json!({"v": 3}), false, Some("peer"))?, Status::Created);
    let change = rx.try_recv()?;
    assert_eq!(change.source.as_deref(), Some("peer"));
    assert_eq!(change.rev_id.to_string(), "3-c");

    let last = store.last_sequence()?;
    assert_eq!(store.force_insert("doc", &ids, json!({"v": 3}), false, Some("peer"))?, Status::Ok);
    assert_eq!(store.last_sequence()?, last);
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[test]
fn test_extending_local_leaf_demotes_it() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    let local = store.put_revision(Some("doc"), None, json!({"v": 1}), false)?;

    let ids: Vec<RevId> = vec![local.rev_id.clone(), "2-remote".parse()?];
    store.force_insert("doc", &ids, json!({"v": 2}), false, None)?;

    let leaves = store.all_revisions_of("doc", true)?;
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves.winner().unwrap().rev_id.to_string(), "2-remote");
    assert!(store.conflicting_revisions("doc")?.is_empty());

    let history = store.get_revision_history(&store.get_document("doc", None)?)?;
    let ids: Vec<String> = history.iter().map(|r| r.rev_id.to_string()).collect();
    assert_eq!(ids, vec!["2-remote".to_string(), local.rev_id.to_string()]);
    Ok(())
}

#[test]
fn test_remote_tombstone() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    store.force_insert("doc", &history(&["1-a"]), json!({"v": 1}), false, None)?;
    store.force_insert("doc", &history(&["1-a", "2-gone"]), json!({}), true, Some("peer"))?;

    assert!(store.get_document("doc", None).is_err());
    let changes: Vec<_> = store.changes_since(0, None).collect::<revdb::Result<_>>()?;
    assert_eq!(changes.len(), 1);
    assert!(changes[0].deleted);
    Ok(())
}

#[test]
fn test_revs_diff_and_checkpoints() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    store.force_insert("doc", &history(&["1-a", "2-b"]), json!({}), false, None)?;

    let offered: Vec<(String, RevId)> = vec![
        ("doc".to_string(), "1-a".parse()?),
        ("doc".to_string(), "3-c".parse()?),
        ("new".to_string(), "1-x".parse()?),
    ];
    let missing = store.missing_revisions(&offered)?;
    assert_eq!(missing, offered[1..].to_vec());

    store.set_last_sequence("42", "https://peer.example/db", false)?;
    assert_eq!(
        store.last_sequence_with_remote("https://peer.example/db", false)?.as_deref(),
        Some("42")
    );
    assert!(store.last_sequence_with_remote("https://peer.example/db", true)?.is_none());
    Ok(())
}
