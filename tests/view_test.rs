mod common;

use revdb::{Emitter, QueryOptions, QueryResult, RevId, RevisionStore, Status};
use serde_json::{json, Map, Value};

fn emit_x(doc: &Map<String, Value>, emitter: &mut Emitter) {
    if let Some(x) = doc.get("x") {
        emitter.emit(x.clone(), Value::Null);
    }
}

fn ids(ids: &[&str]) -> Vec<RevId> {
    ids.iter().map(|id| id.parse().unwrap()).collect()
}

fn keys(result: &QueryResult) -> Vec<Value> {
    result.rows.iter().map(|row| row.key.clone()).collect()
}

#[test]
fn test_query_ascending_and_descending() -> anyhow::Result<()> {
    common::init_tracing();
    let store = RevisionStore::in_memory()?;
    for x in [1, 3, 2] {
        store.put_revision(None, None, json!({ "x": x }), false)?;
    }

    let view = store.view("by_x")?;
    view.set_map_function(emit_x, "1")?;

    let ascending = view.query(&QueryOptions::new())?;
    assert_eq!(keys(&ascending), vec![json!(1), json!(2), json!(3)]);
    assert!(ascending.rows.iter().all(|row| row.value == Value::Null));

    let descending = view.query(&QueryOptions::new().descending(true))?;
    assert_eq!(keys(&descending), vec![json!(3), json!(2), json!(1)]);
    Ok(())
}

#[test]
fn test_update_index_twice_is_stable() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    for x in 0..4 {
        store.put_revision(Some(&format!("d{}", x)), None, json!({ "x": x }), false)?;
    }
    let view = store.view("by_x")?;
    view.set_map_function(emit_x, "1")?;

    view.update_index()?;
    let first = view.dump()?;
    let last = view.last_sequence_indexed()?;

    let second = view.update_index()?;
    assert!(!second.is_modified());
    assert_eq!(view.dump()?, first);
    assert_eq!(view.last_sequence_indexed()?, last);
    Ok(())
}

#[test]
fn test_deleted_documents_leave_the_index() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    let a = store.put_revision(Some("A"), None, json!({"x": 1}), false)?;
    store.put_revision(Some("B"), None, json!({"x": 2}), false)?;

    let view = store.view("by_x")?;
    view.set_map_function(emit_x, "1")?;
    assert_eq!(view.query(&QueryOptions::new())?.rows.len(), 2);

    store.put_revision(Some("A"), Some(&a.rev_id.to_string()), json!({}), true)?;
    let result = view.query(&QueryOptions::new())?;
    assert_eq!(keys(&result), vec![json!(2)]);
    assert_eq!(result.rows[0].id, "B");
    assert_eq!(result.total_rows, 1);
    Ok(())
}

#[test]
fn test_only_the_winner_is_indexed() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    store.force_insert("doc", &ids(&["1-a", "2-b"]), json!({"x": "winner"}), false, None)?;
    let view = store.view("by_x")?;
    view.set_map_function(emit_x, "1")?;
    view.update_index()?;

    // A losing conflict arrives after indexing
    store.force_insert("doc", &ids(&["1-a", "2-a"]), json!({"x": "loser"}), false, None)?;
    let result = view.query(&QueryOptions::new())?;
    assert_eq!(keys(&result), vec![json!("winner")]);

    // The winner is deleted; the surviving conflict takes over
    let winner = store.get_document("doc", None)?;
    store.put_revision(Some("doc"), Some(&winner.rev_id.to_string()), json!({}), true)?;
    let result = view.query(&QueryOptions::new().include_docs(true))?;
    assert_eq!(keys(&result), vec![json!("loser")]);
    assert_eq!(result.rows[0].doc.as_ref().unwrap()["_rev"], json!("2-a"));
    Ok(())
}

#[test]
fn test_complex_keys_and_ranges() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    let docs = [
        json!({"type": "post", "date": [2024, 1, 5]}),
        json!({"type": "post", "date": [2024, 2, 1]}),
        json!({"type": "post", "date": [2023, 12, 31]}),
        json!({"type": "comment", "date": [2024, 1, 6]}),
    ];
    for doc in docs {
        store.put_revision(None, None, doc, false)?;
    }

    let view = store.view("posts_by_date")?;
    view.set_map_function(
        |doc: &Map<String, Value>, emitter: &mut Emitter| {
            if doc.get("type") == Some(&json!("post")) {
                emitter.emit(doc["date"].clone(), doc["_id"].clone());
            }
        },
        "1",
    )?;

    let january = view.query(
        &QueryOptions::new()
            .start_key(json!([2024, 1]))
            .end_key(json!([2024, 1, {}])),
    )?;
    assert_eq!(keys(&january), vec![json!([2024, 1, 5])]);

    let latest = view.query(&QueryOptions::new().descending(true).limit(1).update_seq(true))?;
    assert_eq!(keys(&latest), vec![json!([2024, 2, 1])]);
    assert_eq!(latest.total_rows, 3);
    assert_eq!(latest.update_seq, Some(4));
    Ok(())
}

#[test]
fn test_views_are_listed_and_deleted() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    store.view("b")?;
    let a = store.view("a")?;
    a.set_map_function(emit_x, "1")?;
    assert_eq!(store.all_views()?, vec!["a".to_string(), "b".to_string()]);

    assert!(store.delete_view("a")?);
    assert_eq!(store.all_views()?, vec!["b".to_string()]);

    // A recreated view starts without a map function
    let again = store.view("a")?;
    assert!(again.update_index().is_err());
    assert_eq!(again.map_version()?, None);
    Ok(())
}

#[test]
fn test_failed_update_keeps_previous_index() -> anyhow::Result<()> {
    common::init_tracing();
    let store = RevisionStore::in_memory()?;
    store.put_revision(Some("a"), None, json!({"x": 1}), false)?;
    store.put_revision(Some("b"), None, json!({"x": 2}), false)?;

    let view = store.view("by_x")?;
    view.set_map_function(
        |doc: &Map<String, Value>, emitter: &mut Emitter| {
            if doc.get("x") == Some(&json!("boom")) {
                panic!("cannot map {}", doc["_id"]);
            }
            emit_x(doc, emitter);
        },
        "1",
    )?;
    view.update_index()?;
    let rows = view.dump()?;
    let indexed = view.last_sequence_indexed()?;

    store.put_revision(Some("c"), None, json!({"x": 3}), false)?;
    let bad = store.put_revision(Some("d"), None, json!({"x": "boom"}), false)?;
    let err = view.update_index().unwrap_err();
    assert_eq!(err.status(), Status::Internal);
    assert_eq!(view.dump()?, rows);
    assert_eq!(view.last_sequence_indexed()?, indexed);

    // The store stays writable, and the index catches up once the input is fixed
    store.put_revision(Some("d"), Some(&bad.rev_id.to_string()), json!({"x": 4}), false)?;
    assert!(store.view("other").is_ok());
    let result = view.query(&QueryOptions::new())?;
    assert_eq!(keys(&result), vec![json!(1), json!(2), json!(3), json!(4)]);
    assert_eq!(view.last_sequence_indexed()?, store.last_sequence()?);
    Ok(())
}

#[test]
fn test_query_inside_transaction() -> anyhow::Result<()> {
    let store = RevisionStore::in_memory()?;
    let view = store.view("by_x")?;
    view.set_map_function(emit_x, "1")?;

    store.transaction(|_| {
        store.put_revision(Some("a"), None, json!({"x": 7}), false)?;
        let result = view.query(&QueryOptions::new())?;
        assert_eq!(keys(&result), vec![json!(7)]);
        Ok(())
    })?;
    assert_eq!(view.last_sequence_indexed()?, store.last_sequence()?);
    Ok(())
}
