//! Abstraction over a relational backend.
//!
//! A driver is normally opened with two data sources, "base" ("old") and
//! "modified" ("new"); comparing them produces a changeset. Applying an
//! existing changeset needs only the base source. The core engines reason
//! about any backend exclusively through this trait.

use std::collections::BTreeMap;

use crate::changeset::{ChangesetReader, ChangesetWriter};
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::schema::TableSchema;

pub mod sqlite;

/// Key/value configuration used to open a driver.
///
/// Recognized keys: `base` (filesystem path), `modified` (optional peer
/// path) and `conninfo` (optional backend-specific connection string).
pub type DriverParams = BTreeMap<String, String>;

/// Build driver parameters for a base/modified database pair.
#[must_use]
pub fn params_two_sources(base: &str, modified: &str) -> DriverParams {
    let mut conn = DriverParams::new();
    conn.insert("base".into(), base.into());
    conn.insert("modified".into(), modified.into());
    conn
}

/// Build driver parameters for a single database.
#[must_use]
pub fn params_single_source(base: &str) -> DriverParams {
    let mut conn = DriverParams::new();
    conn.insert("base".into(), base.into());
    conn
}

/// Backend abstraction. One driver instance serves one operation at a time;
/// the instance exclusively owns its backend handles.
pub trait Driver {
    /// List the user tables of the base (or modified) source, excluding
    /// backend-internal and metadata tables.
    fn list_tables(&self, use_modified: bool) -> Result<Vec<String>>;

    /// Read the schema of one table from the base (or modified) source.
    fn table_schema(&self, table_name: &str, use_modified: bool) -> Result<TableSchema>;

    /// Write the differences between base and modified into `writer`.
    /// Requires the driver to have been opened with both sources.
    fn create_changeset(&mut self, writer: &mut ChangesetWriter) -> Result<()>;

    /// Read changes from `reader` and apply them to the base source,
    /// atomically.
    fn apply_changeset(&mut self, reader: &mut ChangesetReader) -> Result<()>;

    /// Create empty tables in the base source from the given schemas.
    fn create_tables(&mut self, tables: &[TableSchema]) -> Result<()>;

    /// Emit every row of the base (or modified) source as INSERT entries.
    fn dump_data(&mut self, writer: &mut ChangesetWriter, use_modified: bool) -> Result<()>;

    /// Verify that the source uses no database feature the rebase algorithm
    /// cannot reason about (user-defined triggers, foreign keys).
    fn check_compatible_for_rebase(&mut self, use_modified: bool) -> Result<()>;
}

/// Name of the embedded file-based driver.
pub const SQLITE_DRIVER_NAME: &str = "sqlite";

/// Names of all registered drivers.
#[must_use]
pub fn driver_names() -> Vec<&'static str> {
    vec![SQLITE_DRIVER_NAME]
}

/// Open a driver by name.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for unknown driver names; driver-specific
/// open errors propagate.
pub fn open_driver(ctx: &Context, name: &str, conn: &DriverParams) -> Result<Box<dyn Driver>> {
    match name {
        SQLITE_DRIVER_NAME => Ok(Box::new(sqlite::SqliteDriver::open(ctx, conn)?)),
        other => Err(Error::Unsupported(format!("unknown driver: {other}"))),
    }
}
