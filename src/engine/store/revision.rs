//! Revisions and revision identifiers

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::error::StoreError;

/// A revision id, `"{generation}-{digest}"`.
///
/// Ordering is the winner rule: higher generation wins, ties broken by the
/// digest's byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    generation: u64,
    digest: String,
}

impl RevId {
    pub fn new(generation: u64, digest: impl Into<String>) -> Result<Self, StoreError> {
        let digest = digest.into();
        if generation == 0 {
            return Err(StoreError::bad_request("revision generation must be >= 1"));
        }
        if digest.is_empty() {
            return Err(StoreError::bad_request("revision digest is empty"));
        }
        Ok(Self { generation, digest })
    }

    /// Mint the id of a child of `parent` (or of a root) with an opaque random digest
    pub fn next(parent: Option<&RevId>) -> Self {
        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| StoreError::bad_request(format!("invalid revision id: {}", s)))?;
        // Digits only, no sign or leading zero, so the id displays as parsed
        let canonical = !generation.is_empty()
            && generation.bytes().all(|c| c.is_ascii_digit())
            && !(generation.len() > 1 && generation.starts_with('0'));
        let generation = generation
            .parse::<u64>()
            .ok()
            .filter(|_| canonical)
            .ok_or_else(|| StoreError::bad_request(format!("invalid revision id: {}", s)))?;
        RevId::new(generation, digest)
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.as_bytes().cmp(other.digest.as_bytes()))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One stored revision of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: RevId,
    pub sequence: i64,
    /// 0 for roots
    pub parent_sequence: i64,
    pub current: bool,
    pub deleted: bool,
    /// Expanded document (`_id`, `_rev`, ... spliced in); `None` for stubs
    /// and compacted revisions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl Revision {
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|p| p.get(field))
    }
}

/// Revisions of one or more documents
#[derive(Debug, Clone, Default)]
pub struct RevisionList(Vec<Revision>);

impl RevisionList {
    pub fn new(revisions: Vec<Revision>) -> Self {
        Self(revisions)
    }

    pub fn find(&self, doc_id: &str, rev_id: &RevId) -> Option<&Revision> {
        self.0
            .iter()
            .find(|r| r.doc_id == doc_id && &r.rev_id == rev_id)
    }

    /// The winning current revision, if any: live leaves beat tombstones,
    /// then the highest `RevId`
    pub fn winner(&self) -> Option<&Revision> {
        self.0
            .iter()
            .filter(|r| r.current)
            .max_by(|a, b| (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Revision> {
        self.0
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
