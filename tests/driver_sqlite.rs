//! End-to-end tests of the file-based driver: diff, apply, rollback,
//! datetime handling, trigger save/restore and copy.

use gpkgdiff::changeset::{
    ChangesetEntry, ChangesetReader, ChangesetTable, ChangesetWriter, Operation, Value,
};
use gpkgdiff::{Context, Error, ops};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn db_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn create_simple_db(path: &Path, rows: &[(i64, &str)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE simple (fid INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();
    for (fid, name) in rows {
        conn.execute("INSERT INTO simple VALUES (?1, ?2)", (fid, name))
            .unwrap();
    }
}

fn simple_rows(path: &Path) -> Vec<(i64, String)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT fid, name FROM simple ORDER BY fid")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap();
    rows.map(Result::unwrap).collect()
}

fn read_entries(path: &Path) -> Vec<ChangesetEntry> {
    let mut reader = ChangesetReader::open(path).unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        entries.push(entry);
    }
    entries
}

fn diff(ctx: &Context, base: &Path, modified: &Path, out: &Path) {
    ops::create_changeset(
        ctx,
        "sqlite",
        None,
        base.to_str().unwrap(),
        modified.to_str().unwrap(),
        out,
    )
    .unwrap();
}

fn apply(ctx: &Context, db: &Path, changeset: &Path) -> gpkgdiff::Result<()> {
    ops::apply_changeset(ctx, "sqlite", None, db.to_str().unwrap(), changeset)
}

#[test]
fn diff_detects_inserts_deletes_and_updates() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    create_simple_db(&base, &[(1, "a"), (2, "b"), (3, "c")]);
    create_simple_db(&modified, &[(1, "a"), (2, "bb"), (4, "d")]);

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);

    let entries = read_entries(&changeset);
    assert_eq!(entries.len(), 3);

    // Per-table order is INSERT, DELETE, UPDATE.
    assert_eq!(entries[0].op, Operation::Insert);
    assert_eq!(
        entries[0].new_values,
        vec![Value::Integer(4), Value::Text("d".into())]
    );
    assert_eq!(entries[1].op, Operation::Delete);
    assert_eq!(
        entries[1].old_values,
        vec![Value::Integer(3), Value::Text("c".into())]
    );
    assert_eq!(entries[2].op, Operation::Update);
    assert_eq!(
        entries[2].old_values,
        vec![Value::Integer(2), Value::Text("b".into())]
    );
    // Unchanged PK is undefined on the new side.
    assert_eq!(
        entries[2].new_values,
        vec![Value::Undefined, Value::Text("bb".into())]
    );
}

#[test]
fn applying_a_diff_reproduces_the_modified_database() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    let target = db_path(&dir, "target.db");
    create_simple_db(&base, &[(1, "a"), (2, "b"), (3, "c")]);
    create_simple_db(&modified, &[(1, "a"), (2, "bb"), (4, "d")]);
    std::fs::copy(&base, &target).unwrap();

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);
    apply(&ctx, &target, &changeset).unwrap();

    assert_eq!(simple_rows(&target), simple_rows(&modified));

    // The round-tripped database diffs as empty against modified.
    let verify = db_path(&dir, "verify.bin");
    diff(&ctx, &target, &modified, &verify);
    assert!(!ops::has_changes(&verify).unwrap());
}

#[test]
fn apply_then_inverted_apply_restores_the_original() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    let target = db_path(&dir, "target.db");
    create_simple_db(&base, &[(1, "a"), (2, "b"), (3, "c")]);
    create_simple_db(&modified, &[(2, "bb"), (3, "c"), (4, "d")]);
    std::fs::copy(&base, &target).unwrap();

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    let inverted = db_path(&dir, "inverted.bin");
    diff(&ctx, &base, &modified, &changeset);
    ops::invert_changeset_file(&changeset, &inverted).unwrap();

    apply(&ctx, &target, &changeset).unwrap();
    apply(&ctx, &target, &inverted).unwrap();
    assert_eq!(simple_rows(&target), simple_rows(&base));
}

#[test]
fn conflicting_apply_rolls_everything_back() {
    let dir = TempDir::new().unwrap();
    let target = db_path(&dir, "target.db");
    create_simple_db(&target, &[(1, "a"), (2, "b"), (3, "c")]);

    // DELETE of a row that does not exist, followed by a valid UPDATE: the
    // whole changeset must be rolled back.
    let table = Arc::new(ChangesetTable::new("simple", vec![true, false]));
    let mut writer = ChangesetWriter::new();
    writer.begin_table(&table);
    writer
        .write_entry(&ChangesetEntry::new(
            table.clone(),
            Operation::Delete,
            vec![Value::Integer(99), Value::Text("zz".into())],
            vec![],
        ))
        .unwrap();
    writer
        .write_entry(&ChangesetEntry::new(
            table,
            Operation::Update,
            vec![Value::Integer(2), Value::Text("b".into())],
            vec![Value::Undefined, Value::Text("bb".into())],
        ))
        .unwrap();
    let changeset = db_path(&dir, "bad.bin");
    writer.save(&changeset).unwrap();

    let ctx = Context::new();
    let result = apply(&ctx, &target, &changeset);
    match result {
        Err(Error::Conflict(count)) => assert_eq!(count, 1),
        other => panic!("expected conflict error, got {other:?}"),
    }
    // Row 2 is unchanged.
    assert_eq!(
        simple_rows(&target),
        vec![(1, "a".into()), (2, "b".into()), (3, "c".into())]
    );
}

#[test]
fn equivalent_datetime_spellings_do_not_diff() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    for (path, stamp) in [
        (&base, "2021-04-01T15:00:00Z"),
        (&modified, "2021-04-01 15:00:00"),
    ] {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE events (fid INTEGER PRIMARY KEY, stamp DATETIME)")
            .unwrap();
        conn.execute("INSERT INTO events VALUES (1, ?1)", [stamp])
            .unwrap();
    }

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);
    assert!(!ops::has_changes(&changeset).unwrap());
}

#[test]
fn delete_matches_either_datetime_spelling() {
    let dir = TempDir::new().unwrap();
    let target = db_path(&dir, "target.db");
    let conn = Connection::open(&target).unwrap();
    conn.execute_batch(
        "CREATE TABLE events (fid INTEGER PRIMARY KEY, stamp DATETIME);
         INSERT INTO events VALUES (1, '2021-04-01T15:00:00Z');",
    )
    .unwrap();
    drop(conn);

    let table = Arc::new(ChangesetTable::new("events", vec![true, false]));
    let mut writer = ChangesetWriter::new();
    writer.begin_table(&table);
    writer
        .write_entry(&ChangesetEntry::new(
            table,
            Operation::Delete,
            vec![
                Value::Integer(1),
                Value::Text("2021-04-01 15:00:00".into()),
            ],
            vec![],
        ))
        .unwrap();
    let changeset = db_path(&dir, "delete.bin");
    writer.save(&changeset).unwrap();

    let ctx = Context::new();
    apply(&ctx, &target, &changeset).unwrap();

    let conn = Connection::open(&target).unwrap();
    let count: i64 = conn
        .query_row("SELECT count(*) FROM events", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn user_triggers_are_suspended_during_apply_and_restored() {
    let dir = TempDir::new().unwrap();
    let target = db_path(&dir, "target.db");
    let conn = Connection::open(&target).unwrap();
    conn.execute_batch(
        "CREATE TABLE simple (fid INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE audit (id INTEGER PRIMARY KEY, msg TEXT);
         CREATE TRIGGER simple_audit AFTER INSERT ON simple
           BEGIN INSERT INTO audit (msg) VALUES ('inserted'); END;",
    )
    .unwrap();
    drop(conn);

    let table = Arc::new(ChangesetTable::new("simple", vec![true, false]));
    let mut writer = ChangesetWriter::new();
    writer.begin_table(&table);
    writer
        .write_entry(&ChangesetEntry::new(
            table,
            Operation::Insert,
            vec![],
            vec![Value::Integer(1), Value::Text("a".into())],
        ))
        .unwrap();
    let changeset = db_path(&dir, "insert.bin");
    writer.save(&changeset).unwrap();

    let ctx = Context::new();
    apply(&ctx, &target, &changeset).unwrap();

    let conn = Connection::open(&target).unwrap();
    let audit_count: i64 = conn
        .query_row("SELECT count(*) FROM audit", [], |row| row.get(0))
        .unwrap();
    assert_eq!(audit_count, 0, "trigger must not fire during apply");
    let trigger_count: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='trigger' AND name='simple_audit'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(trigger_count, 1, "trigger must be restored after apply");
}

#[test]
fn skipped_tables_are_excluded_from_diff() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    for (path, secret) in [(&base, "old"), (&modified, "new")] {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE simple (fid INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE internal_state (fid INTEGER PRIMARY KEY, v TEXT);",
        )
        .unwrap();
        conn.execute("INSERT INTO internal_state VALUES (1, ?1)", [secret])
            .unwrap();
    }

    let mut ctx = Context::new();
    ctx.set_tables_to_skip(vec!["internal_state".into()]);
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);
    assert!(!ops::has_changes(&changeset).unwrap());
}

#[test]
fn schema_evolution_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    create_simple_db(&base, &[]);
    let conn = Connection::open(&modified).unwrap();
    conn.execute_batch("CREATE TABLE simple (fid INTEGER PRIMARY KEY, name TEXT, extra INTEGER)")
        .unwrap();
    drop(conn);

    let ctx = Context::new();
    let result = ops::create_changeset(
        &ctx,
        "sqlite",
        None,
        base.to_str().unwrap(),
        modified.to_str().unwrap(),
        &db_path(&dir, "diff.bin"),
    );
    assert!(matches!(result, Err(Error::SchemaMismatch(_))));
}

#[test]
fn tables_without_primary_key_are_ignored() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.db");
    let modified = db_path(&dir, "modified.db");
    for (path, value) in [(&base, "old"), (&modified, "new")] {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE keyless (v TEXT)").unwrap();
        conn.execute("INSERT INTO keyless VALUES (?1)", [value])
            .unwrap();
    }

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);
    assert!(!ops::has_changes(&changeset).unwrap());
}

#[test]
fn copy_replicates_schema_and_rows() {
    let dir = TempDir::new().unwrap();
    let src = db_path(&dir, "src.db");
    let dst = db_path(&dir, "dst.db");
    create_simple_db(&src, &[(1, "a"), (2, "b")]);

    let ctx = Context::new();
    ops::make_copy(
        &ctx,
        "sqlite",
        None,
        src.to_str().unwrap(),
        "sqlite",
        None,
        dst.to_str().unwrap(),
    )
    .unwrap();

    assert_eq!(simple_rows(&dst), simple_rows(&src));

    // Copying again onto the same destination overwrites it.
    ops::make_copy(
        &ctx,
        "sqlite",
        None,
        src.to_str().unwrap(),
        "sqlite",
        None,
        dst.to_str().unwrap(),
    )
    .unwrap();
    assert_eq!(simple_rows(&dst), simple_rows(&src));
}

fn create_gpkg_db(path: &Path, points: &[(i64, f64, f64)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE gpkg_spatial_ref_sys (
           srs_name TEXT NOT NULL, srs_id INTEGER NOT NULL PRIMARY KEY,
           organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL,
           definition TEXT NOT NULL, description TEXT);
         INSERT INTO gpkg_spatial_ref_sys
           VALUES ('WGS 84', 4326, 'EPSG', 4326, 'GEOGCS[\"WGS 84\"]', '');
         CREATE TABLE gpkg_geometry_columns (
           table_name TEXT NOT NULL, column_name TEXT NOT NULL,
           geometry_type_name TEXT NOT NULL, srs_id INTEGER NOT NULL,
           z TINYINT NOT NULL, m TINYINT NOT NULL);
         INSERT INTO gpkg_geometry_columns VALUES ('points', 'geom', 'POINT', 4326, 0, 0);
         CREATE TABLE points (fid INTEGER PRIMARY KEY, geom POINT);",
    )
    .unwrap();
    for (fid, x, y) in points {
        let mut wkb = vec![1u8];
        wkb.extend(1u32.to_le_bytes());
        wkb.extend(x.to_le_bytes());
        wkb.extend(y.to_le_bytes());
        let blob = gpkgdiff::gpkg::wrap(&wkb, 4326, "POINT", false, false).unwrap();
        conn.execute("INSERT INTO points VALUES (?1, ?2)", (fid, blob))
            .unwrap();
    }
}

#[test]
fn geometry_metadata_is_read_from_gpkg_tables() {
    let dir = TempDir::new().unwrap();
    let db = db_path(&dir, "points.gpkg");
    create_gpkg_db(&db, &[(1, 1.0, 2.0)]);

    let ctx = Context::new();
    let params = gpkgdiff::driver::params_single_source(db.to_str().unwrap());
    let driver = gpkgdiff::driver::open_driver(&ctx, "sqlite", &params).unwrap();

    // Metadata tables are not user tables.
    assert_eq!(driver.list_tables(false).unwrap(), vec!["points"]);

    let schema = driver.table_schema("points", false).unwrap();
    let geom = &schema.columns[1];
    assert!(geom.is_geometry);
    assert_eq!(geom.column_type.base, gpkgdiff::BaseType::Geometry);
    assert_eq!(geom.geom_type.as_deref(), Some("POINT"));
    assert_eq!(geom.geom_srs_id, Some(4326));
    let crs = schema.crs.as_ref().unwrap();
    assert_eq!(crs.auth_name, "EPSG");
    assert_eq!(crs.auth_code, 4326);
}

#[test]
fn moved_geometries_diff_and_apply() {
    let dir = TempDir::new().unwrap();
    let base = db_path(&dir, "base.gpkg");
    let modified = db_path(&dir, "modified.gpkg");
    let target = db_path(&dir, "target.gpkg");
    create_gpkg_db(&base, &[(1, 1.0, 2.0), (2, 3.0, 4.0)]);
    create_gpkg_db(&modified, &[(1, 1.0, 2.0), (2, 5.0, 6.0)]);
    std::fs::copy(&base, &target).unwrap();

    let ctx = Context::new();
    let changeset = db_path(&dir, "diff.bin");
    diff(&ctx, &base, &modified, &changeset);

    let entries = read_entries(&changeset);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, Operation::Update);
    assert_eq!(entries[0].table.name, "points");

    apply(&ctx, &target, &changeset).unwrap();
    let conn = Connection::open(&target).unwrap();
    let blob: Vec<u8> = conn
        .query_row("SELECT geom FROM points WHERE fid = 2", [], |row| {
            row.get(0)
        })
        .unwrap();
    let wkb = gpkgdiff::gpkg::strip(&blob).unwrap();
    let x = f64::from_le_bytes(wkb[5..13].try_into().unwrap());
    assert_eq!(x, 5.0);
}

#[test]
fn rebase_is_refused_for_databases_with_foreign_keys() {
    let dir = TempDir::new().unwrap();
    let db = db_path(&dir, "fk.db");
    let conn = Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TABLE parent (fid INTEGER PRIMARY KEY);
         CREATE TABLE child (fid INTEGER PRIMARY KEY,
                             parent_id INTEGER REFERENCES parent(fid));",
    )
    .unwrap();
    drop(conn);

    let ctx = Context::new();
    let params = gpkgdiff::driver::params_single_source(db.to_str().unwrap());
    let mut driver = gpkgdiff::driver::open_driver(&ctx, "sqlite", &params).unwrap();
    let result = driver.check_compatible_for_rebase(false);
    assert!(matches!(result, Err(Error::Unsupported(_))));
}
