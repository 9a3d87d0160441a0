//! Human-readable renderings of changesets and conflict reports.
//!
//! Changesets are binary; these helpers render them as JSON for
//! inspection. Geometry blobs are unwrapped to their WKB body (hex) so
//! the output does not depend on the envelope header.

use serde_json::{Value as Json, json};

use crate::changeset::{ChangesetReader, Operation, Value};
use crate::errors::Result;
use crate::gpkg;
use crate::rebase::ConflictFeature;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Undefined | Value::Null => Json::Null,
        Value::Integer(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::Text(v) => json!(v),
        Value::Blob(v) => {
            if gpkg::is_gpkg_blob(v)
                && let Ok(wkb) = gpkg::strip(v)
            {
                json!({ "geometry_wkb": to_hex(wkb) })
            } else {
                json!({ "blob": to_hex(v) })
            }
        }
    }
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::Insert => "insert",
        Operation::Update => "update",
        Operation::Delete => "delete",
    }
}

/// Render every entry of a changeset as a JSON document.
///
/// # Errors
///
/// Propagates reader errors.
pub fn changeset_to_json(reader: &mut ChangesetReader) -> Result<Json> {
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        let n = entry.table.column_count();
        let mut changes = Vec::new();
        for i in 0..n {
            let old = entry.old_values.get(i).unwrap_or(&Value::Undefined);
            let new = entry.new_values.get(i).unwrap_or(&Value::Undefined);
            match entry.op {
                Operation::Insert => {
                    changes.push(json!({ "column": i, "new": value_to_json(new) }));
                }
                Operation::Delete => {
                    changes.push(json!({ "column": i, "old": value_to_json(old) }));
                }
                Operation::Update => {
                    if old.is_undefined() && new.is_undefined() {
                        continue;
                    }
                    changes.push(json!({
                        "column": i,
                        "old": value_to_json(old),
                        "new": value_to_json(new),
                    }));
                }
            }
        }
        entries.push(json!({
            "table": entry.table.name,
            "type": operation_name(entry.op),
            "changes": changes,
        }));
    }
    Ok(json!({ "gpkgdiff": entries }))
}

/// Render per-table insert/update/delete counts of a changeset.
///
/// # Errors
///
/// Propagates reader errors.
pub fn changeset_to_json_summary(reader: &mut ChangesetReader) -> Result<Json> {
    let mut tables: indexmap::IndexMap<String, (usize, usize, usize)> = indexmap::IndexMap::new();
    while let Some(entry) = reader.next_entry()? {
        let counts = tables.entry(entry.table.name.clone()).or_default();
        match entry.op {
            Operation::Insert => counts.0 += 1,
            Operation::Update => counts.1 += 1,
            Operation::Delete => counts.2 += 1,
        }
    }
    let entries: Vec<Json> = tables
        .iter()
        .map(|(table, (inserts, updates, deletes))| {
            json!({
                "table": table,
                "insert": inserts,
                "update": updates,
                "delete": deletes,
            })
        })
        .collect();
    Ok(json!({ "gpkgdiff_summary": entries }))
}

/// Render a rebase conflict report.
#[must_use]
pub fn conflicts_to_json(conflicts: &[ConflictFeature]) -> Json {
    let entries: Vec<Json> = conflicts
        .iter()
        .map(|feature| {
            let changes: Vec<Json> = feature
                .items
                .iter()
                .map(|item| {
                    json!({
                        "column": item.column,
                        "base": value_to_json(&item.base),
                        "theirs": value_to_json(&item.theirs),
                        "ours": value_to_json(&item.ours),
                    })
                })
                .collect();
            json!({
                "table": feature.table_name,
                "type": "conflict",
                "fid": feature.pk,
                "changes": changes,
            })
        })
        .collect();
    json!({ "gpkgdiff": entries })
}
