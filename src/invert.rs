//! Changeset inversion: `apply(invert(D))` undoes `apply(D)`.
//!
//! INSERT and DELETE swap roles with their value vectors moved across;
//! UPDATE swaps old/new records with a fix-up for primary key columns so
//! the inverted entry still carries the key on the side that identifies
//! the row. Inverting twice reproduces the input byte-for-byte.

use crate::changeset::{ChangesetEntry, ChangesetReader, ChangesetWriter, Operation, Value};
use crate::errors::Result;

/// Invert every entry of `reader` into `writer`.
///
/// # Errors
///
/// Propagates reader format errors and writer validation errors.
pub fn invert_changeset(reader: &mut ChangesetReader, writer: &mut ChangesetWriter) -> Result<()> {
    let mut current_table_name: Option<String> = None;

    while let Some(entry) = reader.next_entry()? {
        if current_table_name.as_deref() != Some(entry.table.name.as_str()) {
            writer.begin_table(&entry.table);
            current_table_name = Some(entry.table.name.clone());
        }

        let inverted = invert_entry(&entry);
        writer.write_entry(&inverted)?;
    }
    Ok(())
}

/// Invert a single entry.
#[must_use]
pub fn invert_entry(entry: &ChangesetEntry) -> ChangesetEntry {
    match entry.op {
        Operation::Insert => ChangesetEntry {
            op: Operation::Delete,
            old_values: entry.new_values.clone(),
            new_values: Vec::new(),
            table: entry.table.clone(),
        },
        Operation::Delete => ChangesetEntry {
            op: Operation::Insert,
            old_values: Vec::new(),
            new_values: entry.old_values.clone(),
            table: entry.table.clone(),
        },
        Operation::Update => {
            let mut old_values = entry.new_values.clone();
            let mut new_values = entry.old_values.clone();
            // A primary key column that did not change has its value on the
            // old side and undefined on the new side. After the swap that
            // ends up reversed, so move the key back to the old side.
            for (i, &is_pk) in entry.table.primary_keys.iter().enumerate() {
                if is_pk && old_values[i].is_undefined() {
                    old_values[i] = std::mem::take(&mut new_values[i]);
                }
            }
            ChangesetEntry {
                op: Operation::Update,
                old_values,
                new_values,
                table: entry.table.clone(),
            }
        }
    }
}
