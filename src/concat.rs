//! Concatenation of multiple changesets into one equivalent changeset.
//!
//! Entries are collected per table into a map keyed by the primary key
//! tuple of the row they act on, so two entries collide exactly when they
//! touch the same row of the same table. Colliding entries are reduced
//! pair-wise:
//!
//! | existing \ incoming | Insert  | Update  | Delete |
//! |---------------------|---------|---------|--------|
//! | Insert              | discard | merge   | remove |
//! | Update              | discard | merge   | to Delete |
//! | Delete              | to Update | discard | discard |
//!
//! Discarded sequences make no sense for a single row (e.g. inserting the
//! same key twice); they are logged as warnings and concatenation carries
//! on.

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::warn;

use crate::changeset::{
    ChangesetEntry, ChangesetReader, ChangesetTable, ChangesetWriter, Operation, Value,
};
use crate::errors::{Error, Result};

/// Changes collected for a single table, keyed by primary key tuple.
struct TableChanges {
    table: Arc<ChangesetTable>,
    entries: IndexMap<Vec<Value>, ChangesetEntry>,
}

/// Outcome of reducing two entries that act on the same row.
enum MergeOutcome {
    /// The existing entry was updated in place.
    Modified,
    /// The two entries cancel out; drop the existing one.
    Removed,
    /// The sequence makes no sense; the incoming entry is discarded.
    Unsupported,
}

/// Merge the changesets read from `readers`, in order, into `writer`.
///
/// # Errors
///
/// Returns [`Error::SchemaMismatch`] when two inputs carry different table
/// descriptors for the same table name; format and I/O errors propagate
/// from the readers.
pub fn concat_changesets(
    readers: &mut [ChangesetReader],
    writer: &mut ChangesetWriter,
) -> Result<()> {
    let mut result: IndexMap<String, TableChanges> = IndexMap::new();

    for reader in readers.iter_mut() {
        while let Some(entry) = reader.next_entry()? {
            let changes = result
                .entry(entry.table.name.clone())
                .or_insert_with(|| TableChanges {
                    table: entry.table.clone(),
                    entries: IndexMap::new(),
                });

            if changes.table.primary_keys != entry.table.primary_keys {
                return Err(Error::SchemaMismatch(format!(
                    "table {:?} has different column structure across concatenated changesets",
                    entry.table.name
                )));
            }

            let pk = entry.primary_key();
            match changes.entries.entry(pk) {
                indexmap::map::Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                indexmap::map::Entry::Occupied(mut slot) => {
                    match merge_entries(slot.get_mut(), &entry) {
                        MergeOutcome::Modified => {}
                        MergeOutcome::Removed => {
                            slot.shift_remove();
                        }
                        MergeOutcome::Unsupported => {
                            warn!(
                                table = %entry.table.name,
                                "unsupported sequence of entries for a single row, discarding newer entry"
                            );
                        }
                    }
                }
            }
        }
    }

    for changes in result.values() {
        if changes.entries.is_empty() {
            continue;
        }
        writer.begin_table(&changes.table);
        for entry in changes.entries.values() {
            writer.write_entry(entry)?;
        }
    }
    Ok(())
}

/// Reduce `incoming` into `existing` (both acting on the same row).
fn merge_entries(existing: &mut ChangesetEntry, incoming: &ChangesetEntry) -> MergeOutcome {
    use Operation::{Delete, Insert, Update};

    match (existing.op, incoming.op) {
        // Broken sequences: a row is re-inserted while it exists, or
        // touched after it was deleted.
        (Insert, Insert) | (Update, Insert) | (Delete, Update) | (Delete, Delete) => {
            MergeOutcome::Unsupported
        }

        (Insert, Delete) => MergeOutcome::Removed,

        (Insert, Update) => {
            // Fold the update into the insert wherever it has a newer value.
            for (i, new) in incoming.new_values.iter().enumerate() {
                if !new.is_undefined() {
                    existing.new_values[i] = new.clone();
                }
            }
            MergeOutcome::Modified
        }

        (Update, Update) => {
            match merge_update(
                &existing.table,
                &existing.old_values,
                &incoming.old_values,
                &existing.new_values,
                &incoming.new_values,
            ) {
                Some((old_values, new_values)) => {
                    existing.old_values = old_values;
                    existing.new_values = new_values;
                    MergeOutcome::Modified
                }
                None => MergeOutcome::Removed,
            }
        }

        (Update, Delete) => {
            // Turn into DELETE; the update's pre-image wins where it listed
            // one, the delete's old record fills the rest.
            existing.op = Delete;
            for (i, old) in incoming.old_values.iter().enumerate() {
                if existing.old_values[i].is_undefined() {
                    existing.old_values[i] = old.clone();
                }
            }
            existing.new_values = Vec::new();
            MergeOutcome::Modified
        }

        (Delete, Insert) => {
            match merge_update(
                &existing.table,
                &existing.old_values,
                &[],
                &incoming.new_values,
                &[],
            ) {
                Some((old_values, new_values)) => {
                    existing.op = Update;
                    existing.old_values = old_values;
                    existing.new_values = new_values;
                    MergeOutcome::Modified
                }
                None => MergeOutcome::Removed,
            }
        }
    }
}

fn value_at(values: &[Value], i: usize) -> Value {
    values.get(i).cloned().unwrap_or(Value::Undefined)
}

/// Merge two sequential updates (or a delete+insert pair) of one row into a
/// single per-column old/new pair.
///
/// The earliest pre-image and the latest post-image win; columns whose
/// merged old and new values agree collapse to undefined. Returns `None`
/// when no non-PK column remains changed and the merged entry should be
/// discarded entirely.
fn merge_update(
    table: &ChangesetTable,
    first_old: &[Value],
    second_old: &[Value],
    first_new: &[Value],
    second_new: &[Value],
) -> Option<(Vec<Value>, Vec<Value>)> {
    let n = table.column_count();
    let mut out_old = Vec::with_capacity(n);
    let mut out_new = Vec::with_capacity(n);
    let mut required = false;

    for i in 0..n {
        let v_old = match value_at(first_old, i) {
            Value::Undefined => value_at(second_old, i),
            v => v,
        };
        let v_new = match value_at(second_new, i) {
            Value::Undefined => value_at(first_new, i),
            v => v,
        };

        let is_pk = table.primary_keys[i];
        let changed = v_old != v_new;
        if changed && !is_pk {
            required = true;
        }

        out_old.push(if is_pk || changed {
            v_old
        } else {
            Value::Undefined
        });
        out_new.push(if changed { v_new } else { Value::Undefined });
    }

    required.then_some((out_old, out_new))
}
