//! Embedded file-based driver.
//!
//! Opens one database (apply) or two attached databases (diff). When both
//! sources are given, the modified database is opened as `main` and the
//! base is attached as `aux`, so diff SQL can join the two sides on the
//! primary key. GeoPackage metadata tables (`gpkg_*`), R-tree shadow
//! tables (`rtree_*`) and the AUTOINCREMENT bookkeeping table are never
//! diffed or applied.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::changeset::{
    ChangesetEntry, ChangesetReader, ChangesetTable, ChangesetWriter, Operation, Value,
};
use crate::context::Context;
use crate::driver::{Driver, DriverParams};
use crate::errors::{Error, Result};
use crate::schema::{
    BaseType, CrsDefinition, TableColumnInfo, TableSchema, column_type_from_sqlite, datetime_equal,
};

/// Trigger name prefixes that belong to GeoPackage machinery and must be
/// left alone by apply.
const KNOWN_TRIGGER_PREFIXES: [&str; 4] = [
    "gpkg_",
    "rtree_",
    "trigger_insert_feature_count_",
    "trigger_delete_feature_count_",
];

/// The embedded file-based driver.
pub struct SqliteDriver {
    conn: Connection,
    has_modified: bool,
    ctx: Context,
}

impl SqliteDriver {
    /// Open the driver from a parameter map with keys `base` and optional
    /// `modified`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when `base` is missing from the map,
    /// [`Error::Io`] when a named file does not exist, and backend errors
    /// from opening or attaching.
    pub fn open(ctx: &Context, conn_params: &DriverParams) -> Result<Self> {
        let base = conn_params
            .get("base")
            .ok_or_else(|| Error::Unsupported("missing 'base' file".into()))?;
        check_file_exists(base)?;

        let (conn, has_modified) = match conn_params.get("modified") {
            Some(modified) => {
                check_file_exists(modified)?;
                let conn =
                    Connection::open_with_flags(modified, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
                conn.execute_batch(&format!("ATTACH {} AS aux", quote_string(base)))?;
                (conn, true)
            }
            None => {
                let conn = Connection::open_with_flags(base, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
                (conn, false)
            }
        };

        Ok(Self {
            conn,
            has_modified,
            ctx: ctx.clone(),
        })
    }

    /// Create a new database file and open the driver over it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when the file already exists and
    /// `overwrite` is false.
    pub fn create(ctx: &Context, conn_params: &DriverParams, overwrite: bool) -> Result<Self> {
        let base = conn_params
            .get("base")
            .ok_or_else(|| Error::Unsupported("missing 'base' file".into()))?;
        if Path::new(base).exists() {
            if overwrite {
                std::fs::remove_file(base)?;
            } else {
                return Err(Error::Unsupported(format!(
                    "database already exists: {base}"
                )));
            }
        }
        let conn = Connection::open(base)?;
        Ok(Self {
            conn,
            has_modified: false,
            ctx: ctx.clone(),
        })
    }

    fn database_name(&self, use_modified: bool) -> Result<&'static str> {
        if self.has_modified {
            Ok(if use_modified { "main" } else { "aux" })
        } else if use_modified {
            Err(Error::Unsupported("'modified' database not open".into()))
        } else {
            Ok("main")
        }
    }

    fn table_exists(&self, db_name: &str, table_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type='table' AND name=?1",
            quote_ident(db_name)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        Ok(stmt.exists([table_name])?)
    }

    fn read_schema(&self, table_name: &str, db_name: &str) -> Result<TableSchema> {
        if !self.table_exists(db_name, table_name)? {
            return Err(Error::SchemaMismatch(format!(
                "table does not exist: {table_name}"
            )));
        }

        struct RawColumn {
            name: String,
            db_type: String,
            not_null: bool,
            primary_key: bool,
        }

        let mut raw = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
            )?;
            let mut rows = stmt.query((table_name, db_name))?;
            while let Some(row) = rows.next()? {
                raw.push(RawColumn {
                    name: row.get(0)?,
                    db_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    primary_key: row.get::<_, i64>(3)? != 0,
                });
            }
        }

        // Geometry metadata lives in the GeoPackage tables; a plain SQLite
        // file simply has none.
        let mut geometry: Option<(String, String, i32, bool, bool)> = None;
        let mut crs = None;
        if self.table_exists(db_name, "gpkg_geometry_columns")? {
            let sql = format!(
                "SELECT column_name, geometry_type_name, srs_id, z, m \
                 FROM {}.gpkg_geometry_columns WHERE table_name = ?1",
                quote_ident(db_name)
            );
            {
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query([table_name])?;
                if let Some(row) = rows.next()? {
                    geometry = Some((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get::<_, i64>(3)? != 0,
                        row.get::<_, i64>(4)? != 0,
                    ));
                }
            }

            if let Some((_, _, srs_id, _, _)) = &geometry {
                let sql = format!(
                    "SELECT organization, organization_coordsys_id, definition \
                     FROM {}.gpkg_spatial_ref_sys WHERE srs_id = ?1",
                    quote_ident(db_name)
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let mut rows = stmt.query([srs_id])?;
                let row = rows.next()?.ok_or_else(|| {
                    Error::SchemaMismatch(format!(
                        "no entry in gpkg_spatial_ref_sys for srs_id = {srs_id}"
                    ))
                })?;
                crs = Some(CrsDefinition {
                    srs_id: *srs_id,
                    auth_name: row.get(0)?,
                    auth_code: row.get(1)?,
                    wkt: row.get(2)?,
                });
            }
        }

        let mut columns = Vec::with_capacity(raw.len());
        for raw_col in &raw {
            let is_geometry = geometry
                .as_ref()
                .is_some_and(|(column_name, ..)| *column_name == raw_col.name);
            let mut col = TableColumnInfo::new(
                &raw_col.name,
                column_type_from_sqlite(&raw_col.db_type, is_geometry),
            );
            col.not_null = raw_col.not_null;
            col.primary_key = raw_col.primary_key;
            if is_geometry && let Some((_, geom_type, srs_id, has_z, has_m)) = &geometry {
                col.set_geometry(geom_type.clone(), *srs_id, *has_z, *has_m);
            }
            // SQLite auto-increments INTEGER PRIMARY KEY columns by itself.
            if col.primary_key && raw_col.db_type.eq_ignore_ascii_case("integer") {
                col.auto_increment = true;
            }
            columns.push(col);
        }

        if let Some((column_name, ..)) = &geometry
            && !raw.iter().any(|c| c.name == *column_name)
        {
            return Err(Error::SchemaMismatch(format!(
                "gpkg_geometry_columns points at unknown column {column_name:?} of {table_name}"
            )));
        }

        Ok(TableSchema {
            name: table_name.to_string(),
            columns,
            crs,
        })
    }

    fn list_triggers(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, sql FROM sqlite_master WHERE type = 'trigger'")?;
        let mut rows = stmt.query([])?;
        let mut triggers = Vec::new();
        while let Some(row) = rows.next()? {
            let name: Option<String> = row.get(0)?;
            let sql: Option<String> = row.get(1)?;
            let (Some(name), Some(sql)) = (name, sql) else {
                continue;
            };
            if KNOWN_TRIGGER_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
            {
                continue;
            }
            triggers.push((name, sql));
        }
        Ok(triggers)
    }

    fn foreign_key_count(&self, db_name: &str) -> Result<usize> {
        let mut count = 0;
        for table_name in self.list_tables_in(db_name)? {
            let mut stmt = self
                .conn
                .prepare("SELECT count(*) FROM pragma_foreign_key_list(?1, ?2)")?;
            let n: i64 = stmt.query_row((&table_name, db_name), |row| row.get(0))?;
            count += n as usize;
        }
        Ok(count)
    }

    fn list_tables_in(&self, db_name: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master \
             WHERE type='table' AND sql NOT LIKE 'CREATE VIRTUAL%' ORDER BY name",
            quote_ident(db_name)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut names = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            if is_internal_table(&name) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn write_inserted(
        &self,
        table_name: &str,
        tbl: &TableSchema,
        reverse: bool,
        writer: &mut ChangesetWriter,
        first: &mut bool,
    ) -> Result<()> {
        let sql = sql_find_inserted(table_name, tbl, reverse);
        let chtable = std::sync::Arc::new(schema_to_changeset_table(tbl));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            if *first {
                writer.begin_table(&chtable);
                *first = false;
            }

            let mut values = Vec::with_capacity(tbl.columns.len());
            for i in 0..tbl.columns.len() {
                values.push(value_from_sql(row.get_ref(i)?));
            }
            let entry = if reverse {
                ChangesetEntry::new(chtable.clone(), Operation::Delete, values, vec![])
            } else {
                ChangesetEntry::new(chtable.clone(), Operation::Insert, vec![], values)
            };
            writer.write_entry(&entry)?;
        }
        Ok(())
    }

    fn write_updated(
        &self,
        table_name: &str,
        tbl: &TableSchema,
        writer: &mut ChangesetWriter,
        first: &mut bool,
    ) -> Result<()> {
        let sql = sql_find_modified(table_name, tbl);
        let chtable = std::sync::Arc::new(schema_to_changeset_table(tbl));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let n = tbl.columns.len();
        while let Some(row) = rows.next()? {
            // The join SELECTs modified's columns first (0..n), then base's
            // (n..2n). Old values come from base, new values from modified.
            let mut old_values = Vec::with_capacity(n);
            let mut new_values = Vec::with_capacity(n);
            let mut has_updates = false;
            for i in 0..n {
                let old = value_from_sql(row.get_ref(i + n)?);
                let new = value_from_sql(row.get_ref(i)?);
                let pkey = tbl.columns[i].primary_key;
                let mut updated = old != new;
                if updated && tbl.columns[i].column_type.base == BaseType::Datetime {
                    // Equivalent string spellings of one instant are not a
                    // change.
                    if let (Value::Text(a), Value::Text(b)) = (&old, &new)
                        && datetime_equal(a, b)
                    {
                        updated = false;
                    }
                }
                if updated {
                    has_updates = true;
                }
                old_values.push(if pkey || updated { old } else { Value::Undefined });
                new_values.push(if updated { new } else { Value::Undefined });
            }

            if has_updates {
                if *first {
                    writer.begin_table(&chtable);
                    *first = false;
                }
                let entry = ChangesetEntry::new(
                    chtable.clone(),
                    Operation::Update,
                    old_values,
                    new_values,
                );
                writer.write_entry(&entry)?;
            }
        }
        Ok(())
    }
}

impl Driver for SqliteDriver {
    fn list_tables(&self, use_modified: bool) -> Result<Vec<String>> {
        let db_name = self.database_name(use_modified)?;
        self.list_tables_in(db_name)
    }

    fn table_schema(&self, table_name: &str, use_modified: bool) -> Result<TableSchema> {
        let db_name = self.database_name(use_modified)?;
        self.read_schema(table_name, db_name)
    }

    fn create_changeset(&mut self, writer: &mut ChangesetWriter) -> Result<()> {
        let tables_base = self.list_tables(false)?;
        let tables_modified = self.list_tables(true)?;

        if tables_base != tables_modified {
            return Err(Error::SchemaMismatch(format!(
                "table names are not matching between the input databases.\n\
                 Base:     {}\nModified: {}",
                tables_base.join(", "),
                tables_modified.join(", ")
            )));
        }

        for table_name in &tables_base {
            if self.ctx.is_table_skipped(table_name) {
                debug!(table = %table_name, "skipping table listed in tables-to-skip");
                continue;
            }

            let tbl = self.table_schema(table_name, false)?;
            let tbl_new = self.table_schema(table_name, true)?;
            if tbl != tbl_new && !tbl.compare_with_base_types(&tbl_new) {
                return Err(Error::SchemaMismatch(format!(
                    "table schemas are not the same for table: {table_name}"
                )));
            }

            if !tbl.has_primary_key() {
                // Tables without a primary key cannot be compared row by row.
                debug!(table = %table_name, "skipping table without primary key");
                continue;
            }

            let mut first = true;
            self.write_inserted(table_name, &tbl, false, writer, &mut first)?;
            self.write_inserted(table_name, &tbl, true, writer, &mut first)?;
            self.write_updated(table_name, &tbl, writer, &mut first)?;
        }
        Ok(())
    }

    fn apply_changeset(&mut self, reader: &mut ChangesetReader) -> Result<()> {
        // The &mut receiver makes this connection exclusively ours for the
        // duration; concurrent writers on other connections are fenced off
        // by SQLite's own file locking once the savepoint takes effect.
        let triggers = self.list_triggers()?;

        let savepoint = SavepointGuard::begin(&self.conn)?;

        for (name, _) in &triggers {
            self.conn
                .execute_batch(&format!("DROP TRIGGER {}", quote_ident(name)))?;
        }

        let mut statements: HashMap<String, TableStatements> = HashMap::new();
        let mut conflicts = 0usize;

        while let Some(entry) = reader.next_entry()? {
            let table_name = &entry.table.name;

            // Changes to GeoPackage metadata tables may appear in changesets
            // produced by older tooling; they are maintained by the backend
            // itself, so skip them.
            if table_name.starts_with("gpkg_") {
                continue;
            }
            if self.ctx.is_table_skipped(table_name) {
                continue;
            }

            if !statements.contains_key(table_name) {
                let tbl = self.read_schema(table_name, "main")?;
                if tbl.columns.len() != entry.table.column_count() {
                    return Err(Error::SchemaMismatch(format!(
                        "wrong number of columns for table: {table_name}"
                    )));
                }
                if tbl.primary_key_flags() != entry.table.primary_keys {
                    return Err(Error::SchemaMismatch(format!(
                        "mismatch of primary keys in table: {table_name}"
                    )));
                }
                statements.insert(table_name.clone(), TableStatements::for_table(&tbl));
            }
            let table_stmts = &statements[table_name];

            match entry.op {
                Operation::Insert => {
                    let mut stmt = self.conn.prepare_cached(&table_stmts.insert_sql)?;
                    for (i, value) in entry.new_values.iter().enumerate() {
                        bind_value(&mut stmt, i + 1, value)?;
                    }
                    match stmt.raw_execute() {
                        Ok(0) => {
                            log_apply_conflict("insert_nothing", &entry);
                            conflicts += 1;
                        }
                        Ok(_) => {}
                        Err(err) if is_constraint_violation(&err) => {
                            log_apply_conflict("insert_failed", &entry);
                            conflicts += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Operation::Update => {
                    let mut stmt = self.conn.prepare_cached(&table_stmts.update_sql)?;
                    let n = entry.table.column_count();
                    for i in 0..n {
                        let old = &entry.old_values[i];
                        let new = &entry.new_values[i];
                        stmt.raw_bind_parameter(i * 3 + 2, i64::from(!new.is_undefined()))?;
                        if !old.is_undefined() {
                            bind_value(&mut stmt, i * 3 + 1, old)?;
                        }
                        if !new.is_undefined() {
                            bind_value(&mut stmt, i * 3 + 3, new)?;
                        }
                    }
                    // The override flag disables the unchanged-column
                    // predicate; regular apply never uses it. All-PK tables
                    // have no such predicate and no flag to bind.
                    if entry.table.primary_keys.iter().any(|&pk| !pk) {
                        stmt.raw_bind_parameter(n * 3 + 1, 0i64)?;
                    }
                    match stmt.raw_execute() {
                        Ok(0) => {
                            log_apply_conflict("update_nothing", &entry);
                            conflicts += 1;
                        }
                        Ok(_) => {}
                        Err(err) if is_constraint_violation(&err) => {
                            log_apply_conflict("update_failed", &entry);
                            conflicts += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Operation::Delete => {
                    let mut stmt = self.conn.prepare_cached(&table_stmts.delete_sql)?;
                    for (i, value) in entry.old_values.iter().enumerate() {
                        bind_value(&mut stmt, i + 1, value)?;
                    }
                    match stmt.raw_execute() {
                        Ok(0) => {
                            log_apply_conflict("delete_nothing", &entry);
                            conflicts += 1;
                        }
                        Ok(_) => {}
                        Err(err) if is_constraint_violation(&err) => {
                            log_apply_conflict("delete_failed", &entry);
                            conflicts += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        for (_, sql) in &triggers {
            self.conn.execute_batch(sql)?;
        }

        if conflicts > 0 {
            // Dropping the guard rolls everything back, triggers included.
            drop(savepoint);
            return Err(Error::Conflict(conflicts));
        }
        savepoint.commit()
    }

    fn create_tables(&mut self, tables: &[TableSchema]) -> Result<()> {
        if tables.iter().any(|t| t.geometry_column().is_some()) {
            create_gpkg_meta_tables(&self.conn)?;
        }

        for tbl in tables {
            if tbl.name.starts_with("gpkg_") {
                continue;
            }

            if tbl.geometry_column().is_some() {
                if let Some(crs) = &tbl.crs {
                    add_gpkg_crs_definition(&self.conn, crs)?;
                }
                add_gpkg_spatial_table(&self.conn, tbl)?;
            }

            let mut columns = String::new();
            let mut pkey_cols = String::new();
            for col in &tbl.columns {
                if !columns.is_empty() {
                    columns.push_str(", ");
                }
                columns.push_str(&quote_ident(&col.name));
                columns.push(' ');
                columns.push_str(&sqlite_type_name(col));
                if col.not_null {
                    columns.push_str(" NOT NULL");
                }
                // AUTOINCREMENT is implied for INTEGER PRIMARY KEY columns;
                // the keyword itself would only prevent rowid reuse.
                if col.primary_key {
                    if !pkey_cols.is_empty() {
                        pkey_cols.push_str(", ");
                    }
                    pkey_cols.push_str(&quote_ident(&col.name));
                }
            }

            let sql = format!(
                "CREATE TABLE main.{} ({columns}, PRIMARY KEY ({pkey_cols}))",
                quote_ident(&tbl.name)
            );
            self.conn.execute_batch(&sql)?;
        }
        Ok(())
    }

    fn dump_data(&mut self, writer: &mut ChangesetWriter, use_modified: bool) -> Result<()> {
        let db_name = self.database_name(use_modified)?;
        for table_name in self.list_tables_in(db_name)? {
            if self.ctx.is_table_skipped(&table_name) {
                continue;
            }
            let tbl = self.read_schema(&table_name, db_name)?;
            if !tbl.has_primary_key() {
                continue;
            }

            let sql = format!(
                "SELECT * FROM {}.{}",
                quote_ident(db_name),
                quote_ident(&table_name)
            );
            let chtable = std::sync::Arc::new(schema_to_changeset_table(&tbl));
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut first = true;
            while let Some(row) = rows.next()? {
                if first {
                    writer.begin_table(&chtable);
                    first = false;
                }
                let mut values = Vec::with_capacity(tbl.columns.len());
                for i in 0..tbl.columns.len() {
                    values.push(value_from_sql(row.get_ref(i)?));
                }
                writer.write_entry(&ChangesetEntry::new(
                    chtable.clone(),
                    Operation::Insert,
                    vec![],
                    values,
                ))?;
            }
        }
        Ok(())
    }

    fn check_compatible_for_rebase(&mut self, use_modified: bool) -> Result<()> {
        let db_name = self.database_name(use_modified)?;

        let triggers = self.list_triggers()?;
        if !triggers.is_empty() {
            let names: Vec<&str> = triggers.iter().map(|(name, _)| name.as_str()).collect();
            return Err(Error::Unsupported(format!(
                "unable to perform rebase for database with unknown triggers: {}",
                names.join(", ")
            )));
        }

        if self.foreign_key_count(db_name)? > 0 {
            return Err(Error::Unsupported(
                "unable to perform rebase for database with foreign keys".into(),
            ));
        }
        Ok(())
    }
}

/// Per-table SQL used by apply; prepared lazily through the connection's
/// statement cache.
struct TableStatements {
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
}

impl TableStatements {
    fn for_table(tbl: &TableSchema) -> Self {
        Self {
            insert_sql: sql_for_insert(&tbl.name, tbl),
            update_sql: sql_for_update(&tbl.name, tbl),
            delete_sql: sql_for_delete(&tbl.name, tbl),
        }
    }
}

/// Savepoint with rollback-on-drop.
///
/// Commit must be requested explicitly; any early exit (error return,
/// panic) unwinds through the drop and rolls the savepoint back.
struct SavepointGuard<'conn> {
    conn: &'conn Connection,
    active: bool,
}

impl<'conn> SavepointGuard<'conn> {
    fn begin(conn: &'conn Connection) -> Result<Self> {
        conn.execute_batch("SAVEPOINT changeset_apply")?;
        Ok(Self { conn, active: true })
    }

    fn commit(mut self) -> Result<()> {
        self.active = false;
        self.conn.execute_batch("RELEASE changeset_apply")?;
        Ok(())
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self
                .conn
                .execute_batch("ROLLBACK TO changeset_apply; RELEASE changeset_apply");
        }
    }
}

fn check_file_exists(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("database file does not exist: {path}"),
        )))
    }
}

fn is_internal_table(name: &str) -> bool {
    name.starts_with("gpkg_") || name.starts_with("rtree_") || name == "sqlite_sequence"
}

/// Quote an identifier for use in SQL (double quotes, doubled inside).
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in SQL (single quotes, doubled inside).
fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn schema_to_changeset_table(tbl: &TableSchema) -> ChangesetTable {
    ChangesetTable::new(&tbl.name, tbl.primary_key_flags())
}

/// SQL selecting all rows of one side that have no PK match on the other
/// (used for both INSERT and, reversed, DELETE detection).
fn sql_find_inserted(table_name: &str, tbl: &TableSchema, reverse: bool) -> String {
    let mut expr_pk = String::new();
    for col in tbl.columns.iter().filter(|c| c.primary_key) {
        if !expr_pk.is_empty() {
            expr_pk.push_str(" AND ");
        }
        expr_pk.push_str(&format!(
            "main.{table}.{col} = aux.{table}.{col}",
            table = quote_ident(table_name),
            col = quote_ident(&col.name)
        ));
    }
    let (from, other) = if reverse { ("aux", "main") } else { ("main", "aux") };
    format!(
        "SELECT * FROM {from}.{table} WHERE NOT EXISTS ( SELECT 1 FROM {other}.{table} WHERE {expr_pk} )",
        table = quote_ident(table_name)
    )
}

/// SQL joining both sides on the PK, filtered to rows where some non-PK
/// column differs.
fn sql_find_modified(table_name: &str, tbl: &TableSchema) -> String {
    let table = quote_ident(table_name);
    let mut expr_pk = String::new();
    let mut expr_other = String::new();
    for col in &tbl.columns {
        let name = quote_ident(&col.name);
        if col.primary_key {
            if !expr_pk.is_empty() {
                expr_pk.push_str(" AND ");
            }
            expr_pk.push_str(&format!("main.{table}.{name} = aux.{table}.{name}"));
        } else {
            if !expr_other.is_empty() {
                expr_other.push_str(" OR ");
            }
            expr_other.push_str(&format!("main.{table}.{name} IS NOT aux.{table}.{name}"));
        }
    }
    if expr_other.is_empty() {
        format!("SELECT * FROM main.{table}, aux.{table} WHERE {expr_pk}")
    } else {
        format!("SELECT * FROM main.{table}, aux.{table} WHERE {expr_pk} AND ({expr_other})")
    }
}

/// INSERT with one positional parameter per column.
fn sql_for_insert(table_name: &str, tbl: &TableSchema) -> String {
    let columns: Vec<String> = tbl.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<&str> = tbl.columns.iter().map(|_| "?").collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table_name),
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Self-selecting UPDATE. For each column i there are three parameters:
///
/// - `?(i*3+1)` the old value, when defined
/// - `?(i*3+2)` a flag: 1 when the column is being modified
/// - `?(i*3+3)` the new value, when defined
///
/// plus one trailing `?(n*3+1)` override flag that disables the
/// unchanged-column predicate. Datetime columns compare through
/// `datetime()` because one instant has several text spellings.
fn sql_for_update(table_name: &str, tbl: &TableSchema) -> String {
    let mut sql = format!("UPDATE {} SET ", quote_ident(table_name));
    for (i, col) in tbl.columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        let name = quote_ident(&col.name);
        sql.push_str(&format!(
            "{name} = CASE WHEN ?{flag} THEN ?{new} ELSE {name} END",
            flag = i * 3 + 2,
            new = i * 3 + 3
        ));
    }
    sql.push_str(" WHERE ");
    let mut predicate = String::new();
    for (i, col) in tbl.columns.iter().enumerate() {
        let name = quote_ident(&col.name);
        if col.primary_key {
            if !predicate.is_empty() {
                predicate.push_str(" AND ");
            }
            predicate.push_str(&format!("{name} = ?{old}", old = i * 3 + 1));
        }
    }
    let mut unchanged = String::new();
    for (i, col) in tbl.columns.iter().enumerate() {
        if col.primary_key {
            continue;
        }
        let name = quote_ident(&col.name);
        if !unchanged.is_empty() {
            unchanged.push_str(" AND ");
        }
        if col.column_type.base == BaseType::Datetime {
            unchanged.push_str(&format!(
                "(?{flag} = 0 OR datetime({name}) IS datetime(?{old}))",
                flag = i * 3 + 2,
                old = i * 3 + 1
            ));
        } else {
            unchanged.push_str(&format!(
                "(?{flag} = 0 OR {name} IS ?{old})",
                flag = i * 3 + 2,
                old = i * 3 + 1
            ));
        }
    }
    sql.push_str(&predicate);
    if !unchanged.is_empty() {
        sql.push_str(&format!(
            " AND (?{override_flag} OR ({unchanged}))",
            override_flag = tbl.columns.len() * 3 + 1
        ));
    }
    sql
}

/// DELETE matching every column of the old record. `IS` instead of `=` so
/// NULLs match; datetime columns go through `datetime()`.
fn sql_for_delete(table_name: &str, tbl: &TableSchema) -> String {
    let mut sql = format!("DELETE FROM {} WHERE ", quote_ident(table_name));
    for (i, col) in tbl.columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        let name = quote_ident(&col.name);
        if col.primary_key {
            sql.push_str(&format!("{name} = ?"));
        } else if col.column_type.base == BaseType::Datetime {
            sql.push_str(&format!("datetime({name}) IS datetime(?)"));
        } else {
            sql.push_str(&format!("{name} IS ?"));
        }
    }
    sql
}

fn value_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Double(v),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

fn bind_value(stmt: &mut rusqlite::CachedStatement<'_>, index: usize, value: &Value) -> Result<()> {
    match value {
        Value::Integer(v) => stmt.raw_bind_parameter(index, v)?,
        Value::Double(v) => stmt.raw_bind_parameter(index, v)?,
        Value::Null => stmt.raw_bind_parameter(index, rusqlite::types::Null)?,
        Value::Text(v) => stmt.raw_bind_parameter(index, v)?,
        Value::Blob(v) => stmt.raw_bind_parameter(index, v)?,
        Value::Undefined => {
            return Err(Error::Unsupported(
                "attempt to bind an undefined value".into(),
            ));
        }
    }
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(fail, _)
            if fail.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn log_apply_conflict(kind: &str, entry: &ChangesetEntry) {
    let pk: Vec<String> = entry.primary_key().iter().map(ToString::to_string).collect();
    warn!(
        conflict = kind,
        table = %entry.table.name,
        pk = %pk.join(","),
        "CONFLICT while applying changeset entry"
    );
}

fn create_gpkg_meta_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
           srs_name TEXT NOT NULL,
           srs_id INTEGER NOT NULL PRIMARY KEY,
           organization TEXT NOT NULL,
           organization_coordsys_id INTEGER NOT NULL,
           definition TEXT NOT NULL,
           description TEXT
         );
         CREATE TABLE IF NOT EXISTS gpkg_contents (
           table_name TEXT NOT NULL PRIMARY KEY,
           data_type TEXT NOT NULL,
           identifier TEXT UNIQUE,
           description TEXT DEFAULT '',
           last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
           min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
           srs_id INTEGER
         );
         CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
           table_name TEXT NOT NULL,
           column_name TEXT NOT NULL,
           geometry_type_name TEXT NOT NULL,
           srs_id INTEGER NOT NULL,
           z TINYINT NOT NULL,
           m TINYINT NOT NULL,
           CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name)
         );",
    )?;
    Ok(())
}

fn add_gpkg_crs_definition(conn: &Connection, crs: &CrsDefinition) -> Result<()> {
    let present: bool = conn.query_row(
        "SELECT count(*) FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
        [crs.srs_id],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if present {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO gpkg_spatial_ref_sys \
         (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
         VALUES (?1, ?2, ?3, ?4, ?5, '')",
        (
            format!("{}:{}", crs.auth_name, crs.auth_code),
            crs.srs_id,
            &crs.auth_name,
            crs.auth_code,
            &crs.wkt,
        ),
    )?;
    Ok(())
}

fn add_gpkg_spatial_table(conn: &Connection, tbl: &TableSchema) -> Result<()> {
    let i = tbl
        .geometry_column()
        .ok_or_else(|| Error::Unsupported(format!("table has no geometry column: {}", tbl.name)))?;
    let col = &tbl.columns[i];
    let srs_id = col.geom_srs_id.unwrap_or(-1);

    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id) \
         VALUES (?1, 'features', ?1, 0, 0, 0, 0, ?2)",
        (&tbl.name, srs_id),
    )?;
    conn.execute(
        "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            &tbl.name,
            &col.name,
            col.geom_type.as_deref().unwrap_or("GEOMETRY"),
            srs_id,
            i64::from(col.geom_has_z),
            i64::from(col.geom_has_m),
        ),
    )?;
    Ok(())
}

fn sqlite_type_name(col: &TableColumnInfo) -> String {
    match col.column_type.base {
        BaseType::Integer => "INTEGER".into(),
        BaseType::Double => "DOUBLE".into(),
        BaseType::Boolean => "BOOLEAN".into(),
        BaseType::Text => "TEXT".into(),
        BaseType::Blob => "BLOB".into(),
        BaseType::Datetime => "DATETIME".into(),
        BaseType::Date => "DATE".into(),
        BaseType::Geometry => col.geom_type.clone().unwrap_or_else(|| "GEOMETRY".into()),
    }
}
