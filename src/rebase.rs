//! Rebase: rewrite a local diff so it applies cleanly on top of an
//! upstream diff sharing the same base.
//!
//! Inputs are `base2theirs` (committed upstream changes) and `base2ours`
//! (local changes). The output is `theirs2ours`: ours with row identities
//! and old-record values adjusted to the state that exists after theirs
//! has been applied, plus a report of cell-level conflicts.
//!
//! The algorithm runs in three passes:
//!
//! 1. Summarize theirs: per table, the sets of inserted and deleted PKs
//!    and a map of updated PK → post-image.
//! 2. Build a PK remapping for ours: concurrent inserts get fresh keys,
//!    edits of rows theirs deleted are marked for suppression.
//! 3. Rewrite ours entry by entry, grouping output per table.
//!
//! Only single-column integer primary keys are supported, matching the
//! file-based backend's feature-id convention.

use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::changeset::{
    ChangesetEntry, ChangesetReader, ChangesetTable, ChangesetWriter, Operation, Value,
};
use crate::errors::{Error, Result};

/// Sentinel for rows whose changes are dropped because theirs deleted the
/// row.
const INVALID_FID: i64 = -1;

/// A single cell-level three-way disagreement.
#[derive(Debug, Clone)]
pub struct ConflictItem {
    /// Index of the column that tripped the rule.
    pub column: usize,
    /// The value ours expected (its pre-image).
    pub base: Value,
    /// The value theirs wrote.
    pub theirs: Value,
    /// The value ours wanted to write.
    pub ours: Value,
}

/// All conflicts of one row, identified by table and primary key.
#[derive(Debug, Clone)]
pub struct ConflictFeature {
    /// Table the row belongs to.
    pub table_name: String,
    /// Primary key of the row.
    pub pk: i64,
    /// The individual cell conflicts.
    pub items: Vec<ConflictItem>,
}

/// What theirs did to one table, keyed by primary key.
#[derive(Default)]
struct TableRebaseInfo {
    inserted: BTreeSet<i64>,
    deleted: BTreeSet<i64>,
    updated: HashMap<i64, Vec<Value>>,
}

/// How the rebased changeset's primary keys are rewritten.
#[derive(Default)]
struct RebaseMapping {
    /// table name -> old fid -> new fid
    map_ids: HashMap<String, BTreeMap<i64, i64>>,
    /// Inserts of ours that did not collide with theirs. Remapping can
    /// introduce new collisions with these (if 4,5,6 get mapped 4->6, 5->7
    /// then the original 6 must move to 8), so they are revisited after
    /// the main walk.
    unmapped_insert_ids: HashMap<String, BTreeSet<i64>>,
}

impl RebaseMapping {
    fn add(&mut self, table: &str, old_pk: i64, new_pk: i64) {
        self.map_ids
            .entry(table.to_string())
            .or_default()
            .insert(old_pk, new_pk);
    }

    fn get(&self, table: &str, pk: i64) -> Option<i64> {
        self.map_ids.get(table).and_then(|ids| ids.get(&pk)).copied()
    }
}

/// Index of the single integer PK column, or an error for anything the
/// algorithm cannot reason about.
fn pk_column(table: &ChangesetTable) -> Result<usize> {
    let mut found = None;
    for (i, &is_pk) in table.primary_keys.iter().enumerate() {
        if is_pk {
            if found.is_some() {
                return Err(Error::Unsupported(format!(
                    "rebase does not support composite primary keys (table {:?})",
                    table.name
                )));
            }
            found = Some(i);
        }
    }
    found.ok_or_else(|| {
        Error::Unsupported(format!(
            "rebase requires a primary key (table {:?})",
            table.name
        ))
    })
}

fn entry_pk(entry: &ChangesetEntry) -> Result<(usize, i64)> {
    let column = pk_column(&entry.table)?;
    match entry.identifying_values().get(column) {
        Some(Value::Integer(fid)) => Ok((column, *fid)),
        _ => Err(Error::Unsupported(format!(
            "rebase requires integer primary keys (table {:?})",
            entry.table.name
        ))),
    }
}

/// Pass 1: collect what theirs inserted, deleted and updated.
fn summarize_theirs(reader: &mut ChangesetReader) -> Result<HashMap<String, TableRebaseInfo>> {
    let mut tables: HashMap<String, TableRebaseInfo> = HashMap::new();
    while let Some(entry) = reader.next_entry()? {
        let (_, pk) = entry_pk(&entry)?;
        let info = tables.entry(entry.table.name.clone()).or_default();
        match entry.op {
            Operation::Insert => {
                info.inserted.insert(pk);
            }
            Operation::Delete => {
                info.deleted.insert(pk);
            }
            Operation::Update => {
                info.updated.insert(pk, entry.new_values.clone());
            }
        }
    }
    Ok(tables)
}

/// Pass 2: decide which of ours' primary keys must move.
fn build_mapping(
    reader: &mut ChangesetReader,
    theirs: &HashMap<String, TableRebaseInfo>,
) -> Result<RebaseMapping> {
    // First free key per table, derived from what theirs inserted.
    let mut free_indices: HashMap<String, i64> = HashMap::new();
    for (name, info) in theirs {
        if let Some(max) = info.inserted.iter().next_back() {
            free_indices.insert(name.clone(), max + 1);
        }
    }

    let mut mapping = RebaseMapping::default();

    while let Some(entry) = reader.next_entry()? {
        let table_name = entry.table.name.as_str();
        let Some(info) = theirs.get(table_name) else {
            continue; // theirs never touched this table
        };
        let (_, pk) = entry_pk(&entry)?;

        match entry.op {
            Operation::Insert => {
                if info.inserted.contains(&pk) {
                    // Two concurrent inserts of the same key: ours moves to
                    // the next free key.
                    let free = free_indices.get_mut(table_name).ok_or_else(|| {
                        Error::Unsupported(format!(
                            "internal error: no free index for table {table_name:?}"
                        ))
                    })?;
                    mapping.add(table_name, pk, *free);
                    *free += 1;
                } else {
                    mapping
                        .unmapped_insert_ids
                        .entry(table_name.to_string())
                        .or_default()
                        .insert(pk);
                }
            }
            Operation::Update | Operation::Delete => {
                if info.deleted.contains(&pk) {
                    // The row is gone upstream; drop ours' change in pass 3.
                    mapping.add(table_name, pk, INVALID_FID);
                }
            }
        }
    }

    // Our own remapping may have taken keys that unmapped inserts already
    // use; move those as well, repeatedly, so no two inserts share a key.
    let unmapped = mapping.unmapped_insert_ids.clone();
    for (table_name, pkeys) in &unmapped {
        let mut used_new_pkeys: BTreeSet<i64> = mapping
            .map_ids
            .get(table_name)
            .map(|ids| ids.values().copied().collect())
            .unwrap_or_default();

        for &pk in pkeys {
            if used_new_pkeys.contains(&pk) {
                let free = free_indices.get_mut(table_name).ok_or_else(|| {
                    Error::Unsupported(format!(
                        "internal error: no free index for table {table_name:?}"
                    ))
                })?;
                mapping.add(table_name, pk, *free);
                used_new_pkeys.insert(*free);
                *free += 1;
            }
        }
    }

    Ok(mapping)
}

/// Per-table output buffer so table frames are not interleaved.
struct TableBuffer {
    table: Arc<ChangesetTable>,
    entries: Vec<ChangesetEntry>,
}

/// Pass 3: rewrite ours into the rebased changeset.
fn rewrite_ours(
    reader: &mut ChangesetReader,
    theirs: &HashMap<String, TableRebaseInfo>,
    mapping: &RebaseMapping,
    writer: &mut ChangesetWriter,
) -> Result<Vec<ConflictFeature>> {
    let mut buffers: IndexMap<String, TableBuffer> = IndexMap::new();
    let mut conflicts: Vec<ConflictFeature> = Vec::new();

    while let Some(entry) = reader.next_entry()? {
        let table_name = entry.table.name.clone();
        let buffer = buffers.entry(table_name.clone()).or_insert_with(|| TableBuffer {
            table: entry.table.clone(),
            entries: Vec::new(),
        });

        let Some(info) = theirs.get(&table_name) else {
            // A table theirs never modified: copy the change verbatim.
            buffer.entries.push(entry);
            continue;
        };

        let (pk_col, pk) = entry_pk(&entry)?;

        match entry.op {
            Operation::Insert => {
                let mut rewritten = entry;
                if let Some(new_pk) = mapping.get(&table_name, pk) {
                    rewritten.new_values[pk_col] = Value::Integer(new_pk);
                }
                buffer.entries.push(rewritten);
            }
            Operation::Delete => {
                if mapping.get(&table_name, pk) == Some(INVALID_FID) {
                    // Both sides deleted the row.
                    continue;
                }
                let mut rewritten = entry;
                if let Some(patched) = info.updated.get(&pk) {
                    // Theirs rewrote parts of the row; the delete predicate
                    // must match the post-theirs values.
                    for (i, value) in patched.iter().enumerate() {
                        if !value.is_undefined() {
                            rewritten.old_values[i] = value.clone();
                        }
                    }
                }
                buffer.entries.push(rewritten);
            }
            Operation::Update => {
                if mapping.get(&table_name, pk) == Some(INVALID_FID) {
                    // The row no longer exists upstream.
                    debug!(table = %table_name, pk, "dropping update of row deleted upstream");
                    continue;
                }
                let mut rewritten = entry;
                if let Some(patched) = info.updated.get(&pk) {
                    let mut feature = ConflictFeature {
                        table_name: table_name.clone(),
                        pk,
                        items: Vec::new(),
                    };
                    for (i, value) in patched.iter().enumerate() {
                        if value.is_undefined() {
                            continue;
                        }
                        // A conflict is a genuine disagreement: both sides
                        // changed the cell and to different values. It is
                        // resolved in ours' favor.
                        if !rewritten.new_values[i].is_undefined()
                            && rewritten.new_values[i] != *value
                            && !ignore_conflict(&table_name, i)
                        {
                            feature.items.push(ConflictItem {
                                column: i,
                                base: rewritten.old_values[i].clone(),
                                theirs: value.clone(),
                                ours: rewritten.new_values[i].clone(),
                            });
                        }
                        rewritten.old_values[i] = value.clone();
                    }
                    if !feature.items.is_empty() {
                        conflicts.push(feature);
                    }

                    // Columns where both sides converged on the same value
                    // are no longer a change after the pre-image rewrite;
                    // collapse them to undefined and drop the whole entry
                    // when no real change remains.
                    let mut required = false;
                    for i in 0..rewritten.table.column_count() {
                        if rewritten.table.primary_keys[i]
                            || rewritten.new_values[i].is_undefined()
                        {
                            continue;
                        }
                        if rewritten.new_values[i] == rewritten.old_values[i] {
                            rewritten.old_values[i] = Value::Undefined;
                            rewritten.new_values[i] = Value::Undefined;
                        } else {
                            required = true;
                        }
                    }
                    if !required {
                        debug!(table = %table_name, pk, "dropping update fully absorbed upstream");
                        continue;
                    }
                }
                buffer.entries.push(rewritten);
            }
        }
    }

    for buffer in buffers.values() {
        if buffer.entries.is_empty() {
            continue;
        }
        writer.begin_table(&buffer.table);
        for entry in &buffer.entries {
            writer.write_entry(entry)?;
        }
    }

    Ok(conflicts)
}

/// The spatial-metadata table maintains a "last change" timestamp at a
/// fixed position; concurrent edits always disagree there and the value
/// carries no meaning, so it never counts as a conflict.
fn ignore_conflict(table_name: &str, column: usize) -> bool {
    table_name == "gpkg_contents" && column == 4
}

/// Rebase `base2ours` on top of `base2theirs`, writing the rewritten
/// changeset into `writer` and returning the conflict report.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for composite or non-integer primary
/// keys; reader/writer errors propagate.
pub fn rebase_changeset(
    base2theirs: &mut ChangesetReader,
    base2ours: &mut ChangesetReader,
    writer: &mut ChangesetWriter,
) -> Result<Vec<ConflictFeature>> {
    let theirs = summarize_theirs(base2theirs)?;
    let mapping = build_mapping(base2ours, &theirs)?;
    base2ours.rewind();
    rewrite_ours(base2ours, &theirs, &mapping, writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<ChangesetTable> {
        Arc::new(ChangesetTable::new("simple", vec![true, false]))
    }

    fn to_bytes(entries: &[ChangesetEntry]) -> Vec<u8> {
        let mut writer = ChangesetWriter::new();
        writer.begin_table(&entries[0].table);
        for e in entries {
            writer.write_entry(e).unwrap();
        }
        writer.into_bytes()
    }

    fn insert(pk: i64, name: &str) -> ChangesetEntry {
        ChangesetEntry::new(
            table(),
            Operation::Insert,
            vec![],
            vec![Value::Integer(pk), Value::Text(name.into())],
        )
    }

    fn update(pk: i64, from: &str, to: &str) -> ChangesetEntry {
        ChangesetEntry::new(
            table(),
            Operation::Update,
            vec![Value::Integer(pk), Value::Text(from.into())],
            vec![Value::Undefined, Value::Text(to.into())],
        )
    }

    fn delete(pk: i64, name: &str) -> ChangesetEntry {
        ChangesetEntry::new(
            table(),
            Operation::Delete,
            vec![Value::Integer(pk), Value::Text(name.into())],
            vec![],
        )
    }

    fn rebase(
        theirs: Vec<u8>,
        ours: Vec<u8>,
    ) -> (Vec<ChangesetEntry>, Vec<ConflictFeature>) {
        let mut theirs = ChangesetReader::from_bytes(theirs);
        let mut ours = ChangesetReader::from_bytes(ours);
        let mut writer = ChangesetWriter::new();
        let conflicts = rebase_changeset(&mut theirs, &mut ours, &mut writer).unwrap();
        let mut reader = ChangesetReader::from_bytes(writer.into_bytes());
        let mut entries = Vec::new();
        while let Some(e) = reader.next_entry().unwrap() {
            entries.push(e);
        }
        (entries, conflicts)
    }

    #[test]
    fn concurrent_insert_gets_fresh_key() {
        let theirs = to_bytes(&[insert(4, "B"), insert(5, "C"), insert(6, "D")]);
        let ours = to_bytes(&[insert(4, "A")]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert!(conflicts.is_empty());
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].new_values,
            vec![Value::Integer(7), Value::Text("A".into())]
        );
    }

    #[test]
    fn remapping_cascades_into_unmapped_inserts() {
        // Theirs inserted 4 and 5; ours inserted 4, 5 and 6. 4->6 and 5->7
        // collide with ours' untouched 6, which must move to 8.
        let theirs = to_bytes(&[insert(4, "tA"), insert(5, "tB")]);
        let ours = to_bytes(&[insert(4, "a"), insert(5, "b"), insert(6, "c")]);
        let (entries, _) = rebase(theirs, ours);
        let pks: Vec<i64> = entries
            .iter()
            .map(|e| match e.new_values[0] {
                Value::Integer(v) => v,
                _ => panic!("integer pk expected"),
            })
            .collect();
        assert_eq!(pks, vec![6, 7, 8]);
    }

    #[test]
    fn updates_of_different_columns_do_not_conflict() {
        let three_col = Arc::new(ChangesetTable::new("simple", vec![true, false, false]));
        let theirs = to_bytes(&[ChangesetEntry::new(
            three_col.clone(),
            Operation::Update,
            vec![Value::Integer(2), Value::Undefined, Value::Integer(2)],
            vec![Value::Undefined, Value::Undefined, Value::Integer(22)],
        )]);
        let ours = to_bytes(&[ChangesetEntry::new(
            three_col,
            Operation::Update,
            vec![Value::Integer(2), Value::Text("f".into()), Value::Undefined],
            vec![Value::Undefined, Value::Text("f2".into()), Value::Undefined],
        )]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert!(conflicts.is_empty());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].new_values[1], Value::Text("f2".into()));
        // The untouched column's pre-image is aligned to theirs' post-image.
        assert_eq!(entries[0].old_values[2], Value::Integer(22));
    }

    #[test]
    fn updates_of_same_column_conflict() {
        let theirs = to_bytes(&[update(2, "f", "theirs")]);
        let ours = to_bytes(&[update(2, "f", "ours")]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert_eq!(entries.len(), 1);
        // Ours wins, but its pre-image now names theirs' value.
        assert_eq!(entries[0].old_values[1], Value::Text("theirs".into()));
        assert_eq!(entries[0].new_values[1], Value::Text("ours".into()));
        assert_eq!(conflicts.len(), 1);
        let item = &conflicts[0].items[0];
        assert_eq!(item.base, Value::Text("f".into()));
        assert_eq!(item.theirs, Value::Text("theirs".into()));
        assert_eq!(item.ours, Value::Text("ours".into()));
    }

    #[test]
    fn converging_updates_collapse_to_an_empty_diff() {
        // Both sides changed the same columns to the same values: nothing
        // is left to replay and nothing disagrees.
        let three_col = Arc::new(ChangesetTable::new("simple", vec![true, false, false]));
        let converged = ChangesetEntry::new(
            three_col,
            Operation::Update,
            vec![
                Value::Integer(2),
                Value::Text("feature2".into()),
                Value::Integer(2),
            ],
            vec![
                Value::Undefined,
                Value::Text("feature222".into()),
                Value::Integer(222),
            ],
        );
        let theirs = to_bytes(&[converged.clone()]);
        let ours = to_bytes(&[converged]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert!(entries.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn partially_converging_update_reports_only_the_diverging_column() {
        // Both sides set rating to 222; the name diverges. Only the name
        // survives in the rebased update and only the name is a conflict.
        let three_col = Arc::new(ChangesetTable::new("simple", vec![true, false, false]));
        let theirs = to_bytes(&[ChangesetEntry::new(
            three_col.clone(),
            Operation::Update,
            vec![
                Value::Integer(2),
                Value::Text("feature2".into()),
                Value::Integer(2),
            ],
            vec![
                Value::Undefined,
                Value::Text("feature2B".into()),
                Value::Integer(222),
            ],
        )]);
        let ours = to_bytes(&[ChangesetEntry::new(
            three_col,
            Operation::Update,
            vec![
                Value::Integer(2),
                Value::Text("feature2".into()),
                Value::Integer(2),
            ],
            vec![
                Value::Undefined,
                Value::Text("feature2A".into()),
                Value::Integer(222),
            ],
        )]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].old_values,
            vec![
                Value::Integer(2),
                Value::Text("feature2B".into()),
                Value::Undefined,
            ]
        );
        assert_eq!(
            entries[0].new_values,
            vec![
                Value::Undefined,
                Value::Text("feature2A".into()),
                Value::Undefined,
            ]
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].items.len(), 1);
        let item = &conflicts[0].items[0];
        assert_eq!(item.column, 1);
        assert_eq!(item.base, Value::Text("feature2".into()));
        assert_eq!(item.theirs, Value::Text("feature2B".into()));
        assert_eq!(item.ours, Value::Text("feature2A".into()));
    }

    #[test]
    fn update_of_deleted_row_is_suppressed() {
        let theirs = to_bytes(&[delete(2, "f")]);
        let ours = to_bytes(&[update(2, "f", "f2")]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert!(entries.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn concurrent_deletes_collapse() {
        let theirs = to_bytes(&[delete(2, "f")]);
        let ours = to_bytes(&[delete(2, "f")]);
        let (entries, _) = rebase(theirs, ours);
        assert!(entries.is_empty());
    }

    #[test]
    fn delete_of_updated_row_uses_their_post_image() {
        let theirs = to_bytes(&[update(2, "f", "patched")]);
        let ours = to_bytes(&[delete(2, "f")]);
        let (entries, conflicts) = rebase(theirs, ours);
        assert!(conflicts.is_empty());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, Operation::Delete);
        assert_eq!(
            entries[0].old_values,
            vec![Value::Integer(2), Value::Text("patched".into())]
        );
    }

    #[test]
    fn tables_untouched_by_theirs_pass_through() {
        let other = Arc::new(ChangesetTable::new("other", vec![true, false]));
        let theirs = to_bytes(&[insert(4, "B")]);
        let ours = to_bytes(&[ChangesetEntry::new(
            other,
            Operation::Insert,
            vec![],
            vec![Value::Integer(4), Value::Text("X".into())],
        )]);
        let (entries, _) = rebase(theirs, ours);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].table.name, "other");
        assert_eq!(entries[0].new_values[0], Value::Integer(4));
    }

    #[test]
    fn composite_primary_key_is_rejected() {
        let composite = Arc::new(ChangesetTable::new("c", vec![true, true]));
        let theirs = to_bytes(&[ChangesetEntry::new(
            composite.clone(),
            Operation::Insert,
            vec![],
            vec![Value::Integer(1), Value::Integer(2)],
        )]);
        let ours = to_bytes(&[ChangesetEntry::new(
            composite,
            Operation::Insert,
            vec![],
            vec![Value::Integer(1), Value::Integer(3)],
        )]);
        let mut theirs = ChangesetReader::from_bytes(theirs);
        let mut ours = ChangesetReader::from_bytes(ours);
        let mut writer = ChangesetWriter::new();
        let result = rebase_changeset(&mut theirs, &mut ours, &mut writer);
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
