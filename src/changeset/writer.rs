//! Streaming writer for the changeset binary format.
//!
//! Usage mirrors the reader in reverse: [`ChangesetWriter::begin_table`]
//! opens a table frame, then zero or more [`ChangesetWriter::write_entry`]
//! calls append change records. The writer accumulates the stream in memory;
//! [`ChangesetWriter::save`] or [`ChangesetWriter::into_bytes`] produce the
//! final artifact.

use std::path::Path;

use crate::changeset::varint::put_varint;
use crate::changeset::{ChangesetEntry, ChangesetTable, Operation, Value, op_codes, type_codes};
use crate::errors::{Error, Result};

/// Writer accumulating a changeset byte stream.
#[derive(Debug, Default)]
pub struct ChangesetWriter {
    buffer: Vec<u8>,
    current_table: Option<ChangesetTable>,
}

impl ChangesetWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Start a new table frame. Every following entry is validated against
    /// this table until the next `begin_table` call.
    pub fn begin_table(&mut self, table: &ChangesetTable) {
        self.buffer.push(op_codes::TABLE);
        put_varint(&mut self.buffer, table.column_count() as u64);
        for &is_pk in &table.primary_keys {
            self.buffer.push(u8::from(is_pk));
        }
        self.buffer.extend_from_slice(table.name.as_bytes());
        self.buffer.push(0);
        self.current_table = Some(table.clone());
    }

    /// Append a change record to the current table frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when no table frame is open or when
    /// the entry violates the content rules: wrong arity, `Undefined`
    /// values inside an INSERT's new record or a DELETE's old record.
    pub fn write_entry(&mut self, entry: &ChangesetEntry) -> Result<()> {
        let table = self
            .current_table
            .as_ref()
            .ok_or_else(|| Error::Unsupported("write_entry before begin_table".into()))?;
        let n = table.column_count();

        match entry.op {
            Operation::Insert => {
                check_full_record(&entry.new_values, n, "INSERT new")?;
                check_empty_record(&entry.old_values, "INSERT old")?;
            }
            Operation::Delete => {
                check_full_record(&entry.old_values, n, "DELETE old")?;
                check_empty_record(&entry.new_values, "DELETE new")?;
            }
            Operation::Update => {
                check_arity(&entry.old_values, n, "UPDATE old")?;
                check_arity(&entry.new_values, n, "UPDATE new")?;
            }
        }

        self.buffer.push(entry.op.code());
        self.buffer.push(0); // "indirect" always false

        if entry.op != Operation::Insert {
            for value in &entry.old_values {
                encode_value(&mut self.buffer, value);
            }
        }
        if entry.op != Operation::Delete {
            for value in &entry.new_values {
                encode_value(&mut self.buffer, value);
            }
        }
        Ok(())
    }

    /// Consume the writer and return the accumulated stream.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Write the accumulated stream to a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.buffer)?;
        Ok(())
    }
}

fn check_arity(values: &[Value], n: usize, what: &str) -> Result<()> {
    if values.len() == n {
        Ok(())
    } else {
        Err(Error::Unsupported(format!(
            "{what} record has {} values, table has {n} columns",
            values.len()
        )))
    }
}

fn check_full_record(values: &[Value], n: usize, what: &str) -> Result<()> {
    check_arity(values, n, what)?;
    if values.iter().any(Value::is_undefined) {
        return Err(Error::Unsupported(format!(
            "{what} record must not contain undefined values"
        )));
    }
    Ok(())
}

fn check_empty_record(values: &[Value], what: &str) -> Result<()> {
    if values.is_empty() {
        Ok(())
    } else {
        Err(Error::Unsupported(format!("{what} record must be empty")))
    }
}

/// Encode one field: a type byte followed by the payload.
fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Undefined => out.push(type_codes::UNDEFINED),
        Value::Null => out.push(type_codes::NULL),
        Value::Integer(v) => {
            out.push(type_codes::INTEGER);
            out.extend(v.to_be_bytes());
        }
        Value::Double(v) => {
            // Bit pattern is preserved as-is so a stream round-trips
            // byte-for-byte through read and write.
            out.push(type_codes::DOUBLE);
            out.extend(v.to_be_bytes());
        }
        Value::Text(s) => {
            out.push(type_codes::TEXT);
            put_varint(out, s.len() as u64);
            out.extend(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(type_codes::BLOB);
            put_varint(out, b.len() as u64);
            out.extend(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetReader;
    use std::sync::Arc;

    fn table() -> ChangesetTable {
        ChangesetTable::new("t", vec![true, false])
    }

    fn entry(op: Operation, old: Vec<Value>, new: Vec<Value>) -> ChangesetEntry {
        ChangesetEntry::new(Arc::new(table()), op, old, new)
    }

    #[test]
    fn writes_table_header_bytes() {
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&table());
        assert_eq!(writer.into_bytes(), vec![b'T', 2, 1, 0, b't', 0]);
    }

    #[test]
    fn insert_round_trips_through_reader() {
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&table());
        writer
            .write_entry(&entry(
                Operation::Insert,
                vec![],
                vec![Value::Integer(4), Value::Text("A".into())],
            ))
            .unwrap();

        let mut reader = ChangesetReader::from_bytes(writer.into_bytes());
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.op, Operation::Insert);
        assert_eq!(
            read.new_values,
            vec![Value::Integer(4), Value::Text("A".into())]
        );
    }

    #[test]
    fn every_value_type_round_trips() {
        let values = vec![
            Value::Null,
            Value::Integer(-1),
            Value::Double(2.5),
            Value::Text("héllo".into()),
            Value::Blob(vec![0, 1, 2, 255]),
        ];
        let tbl = ChangesetTable::new("v", vec![true, false, false, false, false]);
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&tbl);
        writer
            .write_entry(&ChangesetEntry::new(
                Arc::new(tbl),
                Operation::Insert,
                vec![],
                values.clone(),
            ))
            .unwrap();

        let mut reader = ChangesetReader::from_bytes(writer.into_bytes());
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.new_values, values);
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&table());
        let result = writer.write_entry(&entry(
            Operation::Insert,
            vec![],
            vec![Value::Integer(1)],
        ));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn undefined_in_insert_is_rejected() {
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&table());
        let result = writer.write_entry(&entry(
            Operation::Insert,
            vec![],
            vec![Value::Integer(1), Value::Undefined],
        ));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn entry_without_table_is_rejected() {
        let mut writer = ChangesetWriter::new();
        let result = writer.write_entry(&entry(
            Operation::Insert,
            vec![],
            vec![Value::Integer(1), Value::Null],
        ));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
