//! In-memory model of the changeset binary format.
//!
//! A changeset is a concatenation of table groups. Each group starts with a
//! table header and is followed by change records:
//!
//! ```text
//! Table header:
//! ├── Marker: 'T' (0x54)
//! ├── Column count (varint)
//! ├── PK flags (1 byte per column: 0x01 = PK, 0x00 = not)
//! └── Table name (null-terminated UTF-8)
//!
//! Change records (repeated):
//! ├── Operation code: INSERT=0x12, UPDATE=0x17, DELETE=0x09
//! ├── Indirect flag (1 byte, written as 0, ignored on read)
//! ├── old record (DELETE and UPDATE only)
//! └── new record (INSERT and UPDATE only)
//! ```
//!
//! Each record field is self-contained: a type byte (0 undefined, 1 integer,
//! 2 double, 3 text, 4 blob, 5 null) followed by the payload.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

mod display;
pub mod reader;
pub mod varint;
pub mod writer;

pub use reader::ChangesetReader;
pub use writer::ChangesetWriter;

/// Operation codes used in the binary format.
pub mod op_codes {
    /// INSERT operation code.
    pub const INSERT: u8 = 0x12;
    /// DELETE operation code.
    pub const DELETE: u8 = 0x09;
    /// UPDATE operation code.
    pub const UPDATE: u8 = 0x17;
    /// Table header marker ('T').
    pub const TABLE: u8 = b'T';
}

/// Value type bytes used in record fields.
pub mod type_codes {
    /// Unchanged column inside an UPDATE, no payload.
    pub const UNDEFINED: u8 = 0x00;
    /// 8 bytes, big-endian two's-complement.
    pub const INTEGER: u8 = 0x01;
    /// 8 bytes, big-endian IEEE 754.
    pub const DOUBLE: u8 = 0x02;
    /// Varint byte length followed by UTF-8 bytes.
    pub const TEXT: u8 = 0x03;
    /// Varint byte length followed by raw bytes.
    pub const BLOB: u8 = 0x04;
    /// SQL NULL, no payload.
    pub const NULL: u8 = 0x05;
}

/// A single column value inside a change record.
///
/// `Undefined` is distinct from `Null`: it marks a column that did not
/// change within an UPDATE record and carries no payload.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Unchanged column marker (type 0).
    #[default]
    Undefined,
    /// Signed 64-bit integer (type 1).
    Integer(i64),
    /// IEEE 754 binary64 (type 2).
    Double(f64),
    /// UTF-8 text (type 3).
    Text(String),
    /// Opaque bytes (type 4).
    Blob(Vec<u8>),
    /// SQL NULL (type 5).
    Null,
}

impl Value {
    /// Check whether this is the `Undefined` marker.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check whether this is SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            // Bit-exact: no tolerance, and -0.0 != 0.0 on purpose so that a
            // value round-trips byte-for-byte through the format.
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let tag: u8 = match self {
            Value::Undefined => 0,
            Value::Integer(_) => 1,
            Value::Double(_) => 2,
            Value::Text(_) => 3,
            Value::Blob(_) => 4,
            Value::Null => 5,
        };
        tag.hash(state);
        match self {
            Value::Undefined | Value::Null => {}
            Value::Integer(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Blob(v) => v.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Table metadata stored in a changeset table header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesetTable {
    /// Unqualified table name.
    pub name: String,
    /// One flag per column, true when the column is part of the primary key.
    pub primary_keys: Vec<bool>,
}

impl ChangesetTable {
    /// Create a table descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, primary_keys: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            primary_keys,
        }
    }

    /// Number of columns; implicit in the PK flag vector length.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.primary_keys.len()
    }
}

/// Type of the operation recorded by a changeset entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Row insertion; new values carry the full row.
    Insert,
    /// Row update; old/new values follow the undefined-masking rules.
    Update,
    /// Row deletion; old values carry the full row.
    Delete,
}

impl Operation {
    /// The byte this operation is encoded as in the binary format.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Operation::Insert => op_codes::INSERT,
            Operation::Update => op_codes::UPDATE,
            Operation::Delete => op_codes::DELETE,
        }
    }

    /// Decode an operation byte, if known.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            op_codes::INSERT => Some(Operation::Insert),
            op_codes::UPDATE => Some(Operation::Update),
            op_codes::DELETE => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A single change within a changeset.
///
/// Content of the value vectors depends on the operation:
/// - INSERT: `new_values` holds the inserted row, `old_values` is empty.
/// - DELETE: `old_values` holds the deleted row, `new_values` is empty.
/// - UPDATE: both are populated; unchanged non-PK columns are `Undefined`
///   on both sides, PK columns are present in `old_values` (and `Undefined`
///   in `new_values` unless the key itself changed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetEntry {
    /// Operation recorded by this entry.
    pub op: Operation,
    /// Column values of the "old" record (UPDATE and DELETE only).
    pub old_values: Vec<Value>,
    /// Column values of the "new" record (UPDATE and INSERT only).
    pub new_values: Vec<Value>,
    /// The table descriptor governing this entry, shared with the reader
    /// that produced it.
    pub table: Arc<ChangesetTable>,
}

impl ChangesetEntry {
    /// Quick constructor, mostly used by tests and engines building entries
    /// by hand.
    #[must_use]
    pub fn new(
        table: Arc<ChangesetTable>,
        op: Operation,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    ) -> Self {
        Self {
            op,
            old_values,
            new_values,
            table,
        }
    }

    /// The record that identifies the row this entry acts on: new values
    /// for INSERT, old values otherwise.
    #[must_use]
    pub fn identifying_values(&self) -> &[Value] {
        match self.op {
            Operation::Insert => &self.new_values,
            Operation::Update | Operation::Delete => &self.old_values,
        }
    }

    /// The primary key tuple of the row this entry acts on.
    #[must_use]
    pub fn primary_key(&self) -> Vec<Value> {
        let values = self.identifying_values();
        self.table
            .primary_keys
            .iter()
            .zip(values)
            .filter(|(is_pk, _)| **is_pk)
            .map(|(_, v)| v.clone())
            .collect()
    }
}
