//! Streaming pull parser for the changeset binary format.
//!
//! The reader owns the whole changeset buffer and walks it entry by entry.
//! Table header frames are consumed transparently: [`ChangesetReader::next_entry`]
//! only ever hands out change records, each carrying a shared reference to
//! the table descriptor that governs it.

use std::path::Path;
use std::sync::Arc;

use crate::changeset::varint::{get_varint, get_varint32};
use crate::changeset::{ChangesetEntry, ChangesetTable, Operation, Value, op_codes, type_codes};
use crate::errors::{Error, Result};

/// Upper bound on the column count of a single table.
pub const MAX_COLUMNS: usize = 65536;

/// Streaming reader over a changeset byte buffer.
pub struct ChangesetReader {
    buffer: Vec<u8>,
    offset: usize,
    current_table: Option<Arc<ChangesetTable>>,
}

impl ChangesetReader {
    /// Read a changeset file into memory and position the reader at its
    /// beginning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        Ok(Self::from_bytes(buffer))
    }

    /// Wrap an in-memory changeset buffer.
    #[must_use]
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            offset: 0,
            current_table: None,
        }
    }

    /// True when the underlying stream holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Return to the beginning of the stream and clear the current table
    /// state.
    pub fn rewind(&mut self) {
        self.offset = 0;
        self.current_table = None;
    }

    /// Advance to the next change record, consuming any table header frames
    /// on the way. Returns `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMalformed`] with the byte offset of the
    /// failure for truncated or unrecognized input.
    pub fn next_entry(&mut self) -> Result<Option<ChangesetEntry>> {
        loop {
            if self.offset >= self.buffer.len() {
                return Ok(None);
            }

            let entry_type = self.read_byte()?;
            if entry_type == op_codes::TABLE {
                self.read_table_record()?;
                continue;
            }

            let Some(op) = Operation::from_code(entry_type) else {
                return Err(self.malformed(format!("unknown entry type {entry_type}")));
            };

            let table = self
                .current_table
                .clone()
                .ok_or_else(|| self.malformed("change record before any table header"))?;

            // Reserved "indirect change" flag; ignored.
            self.read_byte()?;

            let old_values = if op == Operation::Insert {
                Vec::new()
            } else {
                self.read_row_values(table.column_count())?
            };
            let new_values = if op == Operation::Delete {
                Vec::new()
            } else {
                self.read_row_values(table.column_count())?
            };

            return Ok(Some(ChangesetEntry {
                op,
                old_values,
                new_values,
                table,
            }));
        }
    }

    fn malformed(&self, message: impl Into<String>) -> Error {
        Error::FormatMalformed {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .buffer
            .get(self.offset)
            .ok_or_else(|| self.malformed("unexpected end of stream"))?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u64> {
        let (value, len) = get_varint(&self.buffer[self.offset..])
            .ok_or_else(|| self.malformed("truncated varint"))?;
        self.offset += len;
        Ok(value)
    }

    fn read_column_count(&mut self) -> Result<usize> {
        let (value, len) = get_varint32(&self.buffer[self.offset..])
            .ok_or_else(|| self.malformed("truncated or oversized column count varint"))?;
        self.offset += len;
        let count = value as usize;
        if count > MAX_COLUMNS {
            return Err(self.malformed(format!("unexpected number of columns: {count}")));
        }
        Ok(count)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        if self.offset + len > self.buffer.len() {
            return Err(self.malformed("unexpected end of stream"));
        }
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_null_terminated_string(&mut self) -> Result<String> {
        let start = self.offset;
        let end = self.buffer[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|pos| start + pos)
            .ok_or_else(|| self.malformed("table name not null-terminated"))?;
        let name = std::str::from_utf8(&self.buffer[start..end])
            .map_err(|_| self.malformed("table name is not valid UTF-8"))?
            .to_string();
        self.offset = end + 1;
        Ok(name)
    }

    fn read_table_record(&mut self) -> Result<()> {
        let column_count = self.read_column_count()?;
        let mut primary_keys = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            primary_keys.push(self.read_byte()? != 0);
        }
        let name = self.read_null_terminated_string()?;
        self.current_table = Some(Arc::new(ChangesetTable { name, primary_keys }));
        Ok(())
    }

    fn read_row_values(&mut self, column_count: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    fn read_value(&mut self) -> Result<Value> {
        let type_code = self.read_byte()?;
        match type_code {
            type_codes::UNDEFINED => Ok(Value::Undefined),
            type_codes::NULL => Ok(Value::Null),
            type_codes::INTEGER => {
                let bytes: [u8; 8] = self.read_bytes(8)?.try_into().expect("8 bytes");
                Ok(Value::Integer(i64::from_be_bytes(bytes)))
            }
            type_codes::DOUBLE => {
                let bytes: [u8; 8] = self.read_bytes(8)?.try_into().expect("8 bytes");
                Ok(Value::Double(f64::from_be_bytes(bytes)))
            }
            type_codes::TEXT => {
                let len = usize::try_from(self.read_varint()?)
                    .map_err(|_| self.malformed("text length out of range"))?;
                let bytes = self.read_bytes(len)?.to_vec();
                let text = String::from_utf8(bytes)
                    .map_err(|_| self.malformed("text value is not valid UTF-8"))?;
                Ok(Value::Text(text))
            }
            type_codes::BLOB => {
                let len = usize::try_from(self.read_varint()?)
                    .map_err(|_| self.malformed("blob length out of range"))?;
                Ok(Value::Blob(self.read_bytes(len)?.to_vec()))
            }
            other => Err(self.malformed(format!("unknown value type {other}"))),
        }
    }
}
