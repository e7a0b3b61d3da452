//! Attachment rows: one per (revision, filename), pointing at a blob

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use super::blob::{BlobKey, BlobStore};
use super::error::{Result, StoreError};

/// An attachment's metadata and bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub length: u64,
    pub digest: String,
    pub data: Vec<u8>,
}

/// A row waiting to be written once the revision has its sequence
#[derive(Debug, Clone)]
pub(crate) struct AttachmentRow {
    filename: String,
    key: BlobKey,
    content_type: Option<String>,
    length: i64,
}

/// Resolve an `_attachments` dictionary into rows.
///
/// Inline `data` is stored as a new blob, `stub` entries copy the parent
/// revision's row, `follows` entries refer to bytes already in the blob store.
pub(crate) fn prepare(
    conn: &Connection,
    blobs: &dyn BlobStore,
    attachments: Option<&Map<String, Value>>,
    parent_sequence: Option<i64>,
) -> Result<Vec<AttachmentRow>> {
    let Some(attachments) = attachments else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::with_capacity(attachments.len());
    for (filename, meta) in attachments {
        let meta = meta.as_object().ok_or_else(|| {
            StoreError::bad_request(format!("attachment {} is not an object", filename))
        })?;
        let content_type = meta
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        let row = if meta.get("stub").and_then(Value::as_bool) == Some(true) {
            let parent = parent_sequence.ok_or_else(|| {
                StoreError::bad_request(format!("stub attachment {} has no parent revision", filename))
            })?;
            find(conn, parent, filename)?.ok_or_else(|| {
                StoreError::bad_request(format!("stub attachment {} not found in parent revision", filename))
            })?
        } else if let Some(data) = meta.get("data") {
            let encoded = data.as_str().ok_or_else(|| {
                StoreError::bad_request(format!("attachment {} data is not a string", filename))
            })?;
            let bytes = STANDARD.decode(encoded).map_err(|_| {
                StoreError::bad_request(format!("attachment {} data is not valid base64", filename))
            })?;
            AttachmentRow {
                filename: filename.clone(),
                key: blobs.store(&bytes)?,
                content_type,
                length: bytes.len() as i64,
            }
        } else if meta.get("follows").and_then(Value::as_bool) == Some(true) {
            let digest = meta.get("digest").and_then(Value::as_str).ok_or_else(|| {
                StoreError::bad_request(format!("attachment {} follows without a digest", filename))
            })?;
            let key = BlobKey::from_digest(digest)
                .map_err(|e| StoreError::bad_request(e.to_string()))?;
            let bytes = blobs.read(&key)?.ok_or_else(|| {
                StoreError::bad_request(format!("attachment {} bytes not in blob store", filename))
            })?;
            AttachmentRow {
                filename: filename.clone(),
                key,
                content_type,
                length: bytes.len() as i64,
            }
        } else {
            return Err(StoreError::bad_request(format!(
                "attachment {} has no data, stub or follows",
                filename
            )));
        };
        rows.push(row);
    }
    Ok(rows)
}

pub(crate) fn insert(conn: &Connection, sequence: i64, rows: &[AttachmentRow]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO attachments (sequence, filename, key, type, length) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for row in rows {
        stmt.execute(params![
            sequence,
            row.filename,
            row.key.as_bytes(),
            row.content_type,
            row.length
        ])?;
    }
    Ok(())
}

fn find(conn: &Connection, sequence: i64, filename: &str) -> Result<Option<AttachmentRow>> {
    let row = conn
        .query_row(
            "SELECT key, type, length FROM attachments WHERE sequence = ?1 AND filename = ?2",
            params![sequence, filename],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(key, content_type, length)| -> Result<AttachmentRow> {
        Ok(AttachmentRow {
            filename: filename.to_string(),
            key: BlobKey::from_bytes(&key)?,
            content_type,
            length,
        })
    })
    .transpose()
}

/// The `_attachments` dictionary of a revision, with every entry a stub
pub(crate) fn stubs(conn: &Connection, sequence: i64) -> Result<Option<Map<String, Value>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT filename, key, type, length FROM attachments WHERE sequence = ?1 ORDER BY filename",
    )?;
    let rows = stmt
        .query_map([sequence], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut dict = Map::new();
    for (filename, key, content_type, length) in rows {
        let key = BlobKey::from_bytes(&key)?;
        let mut meta = json!({
            "length": length,
            "digest": key.digest(),
            "stub": true,
        });
        if let (Some(content_type), Some(obj)) = (content_type, meta.as_object_mut()) {
            obj.insert("content_type".to_string(), Value::String(content_type));
        }
        dict.insert(filename, meta);
    }
    Ok(Some(dict))
}

pub(crate) fn load(
    conn: &Connection,
    blobs: &dyn BlobStore,
    sequence: i64,
    filename: &str,
) -> Result<Attachment> {
    let row = find(conn, sequence, filename)?
        .ok_or_else(|| StoreError::not_found(format!("attachment {}", filename)))?;
    let data = blobs
        .read(&row.key)?
        .ok_or_else(|| StoreError::not_found(format!("attachment {} bytes", filename)))?;
    Ok(Attachment {
        filename: row.filename,
        content_type: row.content_type,
        length: row.length as u64,
        digest: row.key.digest(),
        data,
    })
}

/// Every blob key still referenced by an attachment row
pub(crate) fn referenced_keys(conn: &Connection) -> Result<HashSet<BlobKey>> {
    let mut stmt = conn.prepare("SELECT DISTINCT key FROM attachments")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    keys.iter()
        .map(|key| BlobKey::from_bytes(key).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::database::Database;
    use crate::engine::store::blob::MemoryBlobStore;

    fn revision(conn: &Connection) -> i64 {
        conn.execute("INSERT INTO docs (docid) VALUES ('doc')", []).unwrap();
        conn.execute(
            "INSERT INTO revs (doc_id, revid, current) VALUES (1, '1-a', 1)",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_inline_then_stub() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        let blobs = MemoryBlobStore::new();
        let seq = revision(&conn);

        let inline = json!({"a.txt": {"content_type": "text/plain", "data": STANDARD.encode("hi")}});
        let rows = prepare(&conn, &blobs, inline.as_object(), None).unwrap();
        insert(&conn, seq, &rows).unwrap();

        let dict = stubs(&conn, seq).unwrap().unwrap();
        assert_eq!(dict["a.txt"]["length"], 2);
        assert_eq!(dict["a.txt"]["stub"], true);
        assert_eq!(dict["a.txt"]["content_type"], "text/plain");

        let stub = json!({"a.txt": {"stub": true}});
        let copied = prepare(&conn, &blobs, stub.as_object(), Some(seq)).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].length, 2);

        let attachment = load(&conn, &blobs, seq, "a.txt").unwrap();
        assert_eq!(attachment.data, b"hi");
        assert_eq!(referenced_keys(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_entries() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        let blobs = MemoryBlobStore::new();

        for bad in [
            json!({"a": {"stub": true}}),
            json!({"a": {"data": "%%%"}}),
            json!({"a": {"follows": true, "digest": "sha1-AAAAAAAAAAAAAAAAAAAAAAAAAAA="}}),
            json!({"a": {"content_type": "text/plain"}}),
            json!({"a": 5}),
        ] {
            let err = prepare(&conn, &blobs, bad.as_object(), None).unwrap_err();
            assert!(matches!(err, StoreError::BadRequest(_)), "{:?}", bad);
        }
    }

    #[test]
    fn test_follows_existing_blob() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        let blobs = MemoryBlobStore::new();
        let key = blobs.store(b"payload").unwrap();

        let follows = json!({"p.bin": {"follows": true, "digest": key.digest()}});
        let rows = prepare(&conn, &blobs, follows.as_object(), None).unwrap();
        assert_eq!(rows[0].length, 7);
    }
}
