//! JSON Collation
//!
//! Total ordering over JSON values, independent of SQLite's native text
//! comparison. Registered on every connection as the `JSON`, `JSON_RAW` and
//! `REVID` collations so that indexes, range predicates and `ORDER BY`
//! clauses agree with the in-process comparator.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

/// SQLite collation name for the default JSON ordering
pub const JSON_COLLATION: &str = "JSON";

/// SQLite collation name for CouchDB's "raw" JSON ordering
pub const JSON_RAW_COLLATION: &str = "JSON_RAW";

/// SQLite collation name for revision ids
pub const REVID_COLLATION: &str = "REVID";

/// Collation flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// `null < false < true < numbers < strings < arrays < objects`
    #[default]
    Json,
    /// `numbers < false < null < true < objects < arrays < strings`
    Raw,
}

impl Collation {
    /// Name of the matching SQLite collation
    pub fn sql_name(self) -> &'static str {
        match self {
            Collation::Json => JSON_COLLATION,
            Collation::Raw => JSON_RAW_COLLATION,
        }
    }

    fn rank(self, value: &Value) -> u8 {
        match (self, value) {
            (Collation::Json, Value::Null) => 0,
            (Collation::Json, Value::Bool(false)) => 1,
            (Collation::Json, Value::Bool(true)) => 2,
            (Collation::Json, Value::Number(_)) => 3,
            (Collation::Json, Value::String(_)) => 4,
            (Collation::Json, Value::Array(_)) => 5,
            (Collation::Json, Value::Object(_)) => 6,

            (Collation::Raw, Value::Number(_)) => 0,
            (Collation::Raw, Value::Bool(false)) => 1,
            (Collation::Raw, Value::Null) => 2,
            (Collation::Raw, Value::Bool(true)) => 3,
            (Collation::Raw, Value::Object(_)) => 4,
            (Collation::Raw, Value::Array(_)) => 5,
            (Collation::Raw, Value::String(_)) => 6,
        }
    }

    /// Compare two JSON values
    pub fn compare(self, a: &Value, b: &Value) -> Ordering {
        let (rank_a, rank_b) = (self.rank(a), self.rank(b));
        if rank_a != rank_b {
            return rank_a.cmp(&rank_b);
        }

        match (a, b) {
            (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
            // Rust string comparison is UTF-8 byte order, which is code point order
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Array(x), Value::Array(y)) => {
                for (left, right) in x.iter().zip(y.iter()) {
                    let ord = self.compare(left, right);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            (Value::Object(x), Value::Object(y)) => self.compare_objects(x, y),
            // null/null, false/false, true/true
            _ => Ordering::Equal,
        }
    }

    fn compare_objects(self, a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        let mut left: Vec<(&String, &Value)> = a.iter().collect();
        let mut right: Vec<(&String, &Value)> = b.iter().collect();
        left.sort_by(|x, y| x.0.cmp(y.0));
        right.sort_by(|x, y| x.0.cmp(y.0));

        for ((key_a, val_a), (key_b, val_b)) in left.iter().zip(right.iter()) {
            let ord = key_a.cmp(key_b).then_with(|| self.compare(val_a, val_b));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        left.len().cmp(&right.len())
    }

    /// Compare two JSON-encoded strings, as stored in index rows.
    ///
    /// Text that doesn't parse as JSON sorts after all valid JSON, in byte
    /// order, so the collation stays total.
    pub fn compare_encoded(self, a: &str, b: &str) -> Ordering {
        match (
            serde_json::from_str::<Value>(a),
            serde_json::from_str::<Value>(b),
        ) {
            (Ok(x), Ok(y)) => self.compare(&x, &y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        }
    }
}

/// Compare two values under the default JSON collation
pub fn compare(a: &Value, b: &Value) -> Ordering {
    Collation::Json.compare(a, b)
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Compare revision ids: numeric generation first, then digest bytes.
/// Ids that don't look like `{generation}-{digest}` fall back to byte order.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    match (split_rev_id(a), split_rev_id(b)) {
        (Some((gen_a, digest_a)), Some((gen_b, digest_b))) => gen_a
            .cmp(&gen_b)
            .then_with(|| digest_a.as_bytes().cmp(digest_b.as_bytes())),
        _ => a.as_bytes().cmp(b.as_bytes()),
    }
}

fn split_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (generation, digest) = rev_id.split_once('-')?;
    if generation.is_empty() || !generation.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((generation.parse().ok()?, digest))
}

/// Install the JSON and revision-id collations on a connection
pub fn register_collations(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_collation(JSON_COLLATION, |a: &str, b: &str| {
        Collation::Json.compare_encoded(a, b)
    })?;
    conn.create_collation(JSON_RAW_COLLATION, |a: &str, b: &str| {
        Collation::Raw.compare_encoded(a, b)
    })?;
    conn.create_collation(REVID_COLLATION, compare_rev_ids)?;
    Ok(())
}
