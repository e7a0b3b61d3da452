//! Document bodies: reserved-key stripping on write, splicing on read

use serde_json::{Map, Value};

use super::error::{Result, StoreError};

/// Keys owned by the store; never persisted inside a body
pub const RESERVED_KEYS: [&str; 4] = ["_id", "_rev", "_deleted", "_attachments"];

/// A body split into what gets stored and the attachment metadata it carried
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrippedBody {
    pub properties: Map<String, Value>,
    pub attachments: Option<Map<String, Value>>,
}

/// Remove the reserved keys, keeping `_attachments` aside for processing.
/// BadRequest if `_attachments` is present but not an object.
pub fn strip(mut body: Map<String, Value>) -> Result<StrippedBody> {
    let attachments = match body.remove("_attachments") {
        Some(Value::Object(map)) => Some(map),
        None | Some(Value::Null) => None,
        Some(other) => {
            return Err(StoreError::bad_request(format!(
                "_attachments must be an object, got {}",
                other
            )))
        }
    };
    for key in RESERVED_KEYS {
        body.remove(key);
    }
    Ok(StrippedBody {
        properties: body,
        attachments,
    })
}

/// Serialize stored properties into the `json` column
pub fn encode(properties: &Map<String, Value>) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(properties)
}

pub fn decode(json: &[u8]) -> serde_json::Result<Map<String, Value>> {
    serde_json::from_slice(json)
}

/// Splice the reserved keys back into stored properties
pub fn splice(
    mut properties: Map<String, Value>,
    doc_id: &str,
    rev_id: &str,
    deleted: bool,
    attachments: Option<Map<String, Value>>,
) -> Map<String, Value> {
    for key in RESERVED_KEYS {
        properties.remove(key);
    }
    properties.insert("_id".to_string(), Value::String(doc_id.to_string()));
    properties.insert("_rev".to_string(), Value::String(rev_id.to_string()));
    if deleted {
        properties.insert("_deleted".to_string(), Value::Bool(true));
    }
    if let Some(attachments) = attachments.filter(|a| !a.is_empty()) {
        properties.insert("_attachments".to_string(), Value::Object(attachments));
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_strip_removes_reserved() {
        let body = object(json!({
            "_id": "doc", "_rev": "1-a", "_deleted": false,
            "_attachments": {"a.txt": {"stub": true}},
            "x": 1
        }));
        let stripped = strip(body).unwrap();
        assert_eq!(Value::Object(stripped.properties), json!({"x": 1}));
        assert!(stripped.attachments.unwrap().contains_key("a.txt"));
    }

    #[test]
    fn test_splice_round_trip_is_idempotent() {
        let stored = strip(object(json!({"x": 1, "nested": {"y": [1, 2]}}))).unwrap().properties;
        let once = splice(stored.clone(), "doc", "2-b", false, None);
        assert_eq!(
            Value::Object(once.clone()),
            json!({"x": 1, "nested": {"y": [1, 2]}, "_id": "doc", "_rev": "2-b"})
        );

        let again = splice(strip(once.clone()).unwrap().properties, "doc", "2-b", false, None);
        assert_eq!(again, once);
    }

    #[test]
    fn test_malformed_attachments_rejected() {
        for attachments in [json!("x"), json!([1]), json!(3)] {
            let err = strip(object(json!({"x": 1, "_attachments": attachments}))).unwrap_err();
            assert!(matches!(err, StoreError::BadRequest(_)));
        }
    }

    #[test]
    fn test_splice_tombstone() {
        let doc = splice(Map::new(), "doc", "3-c", true, Some(Map::new()));
        assert_eq!(Value::Object(doc), json!({"_id": "doc", "_rev": "3-c", "_deleted": true}));
    }

    #[test]
    fn test_encode_decode() {
        let props = object(json!({"a": "b"}));
        assert_eq!(decode(&encode(&props).unwrap()).unwrap(), props);
    }
}
