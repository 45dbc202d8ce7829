//! # Mesh Core
//!
//! Core types for VectorMesh.
//!
//! This crate provides the fundamental building blocks shared by the storage
//! subsystem and its collaborators:
//! - [`EntityKind`] and [`RecordKey`] - Type-safe identifiers for partitioned data
//! - [`NodeHandle`] - Opaque handle to a storage back-end node
//! - [`FieldValue`] - Schema-flexible structured field storage
//! - [`Record`] - A single migratable unit of data

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// A logical entity type whose records are partitioned across shards
/// (e.g. `"novel"`, `"chapter"`, `"memory_anchor"`).
///
/// Uses a newtype pattern to prevent mixing entity kinds with plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityKind(String);

impl EntityKind {
    /// Creates a new entity kind.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the kind as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The partition key of a single record.
///
/// Keys are opaque strings; partitioning strategies operate on their byte
/// representation so that routing is stable across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Creates a new record key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key's byte representation used for routing.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Returns the key's big-endian u64 prefix, zero-padded on the right.
    ///
    /// Range partitioning orders keys by this prefix so that lexicographic
    /// neighbors land on the same shard.
    pub fn prefix64(&self) -> u64 {
        let bytes = self.0.as_bytes();
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// An opaque identifier for a storage back-end node.
///
/// The surrounding system resolves handles to actual storage; the core only
/// routes to them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeHandle(String);

impl NodeHandle {
    /// Creates a new node handle.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the handle as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeHandle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// A schema-flexible field value.
///
/// Replaces untyped dictionaries at the subsystem boundary: cache metadata and
/// migration record fields are tagged values rather than `any`-typed maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / null value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Embedding vector payload.
    Vector(Vec<f32>),
    /// Homogeneous or mixed list.
    List(Vec<FieldValue>),
    /// Nested map, ordered for deterministic serialization.
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Returns the text content, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an `Int` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate in-memory cost of this value in bytes.
    ///
    /// Used by cache byte accounting; intentionally an estimate, not an exact
    /// allocator measurement.
    pub fn cost_bytes(&self) -> usize {
        match self {
            FieldValue::Null => 1,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) => 8,
            FieldValue::Float(_) => 8,
            FieldValue::Text(s) => 24 + s.len(),
            FieldValue::Vector(v) => 24 + v.len() * 4,
            FieldValue::List(items) => 24 + items.iter().map(FieldValue::cost_bytes).sum::<usize>(),
            FieldValue::Map(map) => {
                24 + map
                    .iter()
                    .map(|(k, v)| 24 + k.len() + v.cost_bytes())
                    .sum::<usize>()
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A single migratable record.
///
/// Structured fields and the vector payload are kept separate because
/// migration copies them in distinct passes (structured fields first, vector
/// payloads last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The record's partition key.
    pub key: RecordKey,
    /// Structured fields, ordered for deterministic serialization.
    pub fields: BTreeMap<String, FieldValue>,
    /// Optional embedding payload associated with the record.
    pub vector: Option<Vec<f32>>,
}

impl Record {
    /// Creates a record with no fields and no vector.
    pub fn new(key: impl Into<RecordKey>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            vector: None,
        }
    }

    /// Adds a structured field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attaches a vector payload.
    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Returns a copy of this record without its vector payload.
    pub fn without_vector(&self) -> Self {
        Self {
            key: self.key.clone(),
            fields: self.fields.clone(),
            vector: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
