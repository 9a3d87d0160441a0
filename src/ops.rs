//! Path-level operations tying drivers, readers and writers together.
//!
//! These are thin orchestration helpers consumed by the CLI and by tests;
//! the actual work happens in the engine modules.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::changeset::{ChangesetReader, ChangesetWriter};
use crate::concat::concat_changesets;
use crate::context::Context;
use crate::driver::{self, Driver, DriverParams};
use crate::errors::{Error, Result};
use crate::export;
use crate::invert::invert_changeset;
use crate::rebase::rebase_changeset;

/// Temporary file that is removed again on drop.
struct TmpFile {
    path: PathBuf,
}

impl TmpFile {
    fn new(tag: &str) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut path = std::env::temp_dir();
        path.push(format!("gpkgdiff_{}_{}_{nanos}.bin", std::process::id(), tag));
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn with_conninfo(mut params: DriverParams, conninfo: Option<&str>) -> DriverParams {
    if let Some(conninfo) = conninfo {
        params.insert("conninfo".into(), conninfo.into());
    }
    params
}

fn open_two(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    base: &str,
    modified: &str,
) -> Result<Box<dyn Driver>> {
    let params = with_conninfo(driver::params_two_sources(base, modified), conninfo);
    driver::open_driver(ctx, driver_name, &params)
}

fn open_one(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    base: &str,
) -> Result<Box<dyn Driver>> {
    let params = with_conninfo(driver::params_single_source(base), conninfo);
    driver::open_driver(ctx, driver_name, &params)
}

/// Diff `base` against `modified` and save the changeset to `output`.
///
/// # Errors
///
/// Driver, schema and I/O errors propagate.
pub fn create_changeset(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    base: &str,
    modified: &str,
    output: &Path,
) -> Result<()> {
    let mut driver = open_two(ctx, driver_name, conninfo, base, modified)?;
    let mut writer = ChangesetWriter::new();
    driver.create_changeset(&mut writer)?;
    writer.save(output)
}

/// Apply the changeset at `changeset` to the database at `base`.
///
/// # Errors
///
/// Returns [`Error::Conflict`] when row conflicts roll the apply back.
pub fn apply_changeset(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    base: &str,
    changeset: &Path,
) -> Result<()> {
    let mut reader = ChangesetReader::open(changeset)?;
    if reader.is_empty() {
        debug!("no changes to apply");
        return Ok(());
    }
    let mut driver = open_one(ctx, driver_name, conninfo, base)?;
    driver.apply_changeset(&mut reader)
}

/// Invert the changeset at `input` into `output`.
///
/// # Errors
///
/// Format and I/O errors propagate.
pub fn invert_changeset_file(input: &Path, output: &Path) -> Result<()> {
    let mut reader = ChangesetReader::open(input)?;
    let mut writer = ChangesetWriter::new();
    invert_changeset(&mut reader, &mut writer)?;
    writer.save(output)
}

/// Concatenate the changesets at `inputs`, in order, into `output`.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for fewer than two inputs; format and
/// I/O errors propagate.
pub fn concat_changes(inputs: &[PathBuf], output: &Path) -> Result<()> {
    if inputs.len() < 2 {
        return Err(Error::Unsupported(
            "need at least two input changesets to concatenate".into(),
        ));
    }
    let mut readers = Vec::with_capacity(inputs.len());
    for input in inputs {
        readers.push(ChangesetReader::open(input)?);
    }
    let mut writer = ChangesetWriter::new();
    concat_changesets(&mut readers, &mut writer)?;
    writer.save(output)
}

/// Whether the changeset at `path` contains any entry.
///
/// # Errors
///
/// I/O errors propagate.
pub fn has_changes(path: &Path) -> Result<bool> {
    let reader = ChangesetReader::open(path)?;
    Ok(!reader.is_empty())
}

/// Number of entries in the changeset at `path`.
///
/// # Errors
///
/// Format and I/O errors propagate.
pub fn changes_count(path: &Path) -> Result<usize> {
    let mut reader = ChangesetReader::open(path)?;
    let mut count = 0;
    while reader.next_entry()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Rebase the diff at `base2ours` on top of `base2theirs`, writing the
/// rewritten diff to `rebased` and, when any conflict was detected, a JSON
/// report to `conflict_file`.
///
/// # Errors
///
/// Format, I/O and unsupported-feature errors propagate.
pub fn create_rebased_changeset(
    base2ours: &Path,
    base2theirs: &Path,
    rebased: &Path,
    conflict_file: &Path,
) -> Result<()> {
    let _ = std::fs::remove_file(conflict_file);

    let theirs = ChangesetReader::open(base2theirs)?;
    if theirs.is_empty() {
        info!("upstream diff is empty, no rebase needed");
        std::fs::copy(base2ours, rebased)?;
        return Ok(());
    }
    let ours = ChangesetReader::open(base2ours)?;
    if ours.is_empty() {
        info!("local diff is empty, rebased diff is empty too");
        std::fs::write(rebased, [])?;
        return Ok(());
    }

    let mut theirs = theirs;
    let mut ours = ours;
    let mut writer = ChangesetWriter::new();
    let conflicts = rebase_changeset(&mut theirs, &mut ours, &mut writer)?;
    writer.save(rebased)?;

    if conflicts.is_empty() {
        debug!("no conflicts present");
    } else {
        let doc = export::conflicts_to_json(&conflicts);
        let rendered = serde_json::to_string_pretty(&doc).map_err(std::io::Error::other)?;
        std::fs::write(conflict_file, rendered.as_bytes())?;
    }
    Ok(())
}

/// Rebase a local working copy in place (create + rebase + apply).
///
/// `base` is the common ancestor, `modified` the local working copy and
/// `base2theirs` the committed upstream diff. The sequence
/// `inv(ours), theirs, rebased` is condensed into a single changeset via
/// concat and applied atomically to `modified`.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] when the local database carries triggers
/// or foreign keys; conflict, format and I/O errors propagate.
pub fn rebase_db(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    base: &str,
    modified: &str,
    base2theirs: &Path,
    conflict_file: &Path,
) -> Result<()> {
    {
        let mut driver = open_one(ctx, driver_name, conninfo, modified)?;
        driver.check_compatible_for_rebase(false)?;
    }

    // No upstream changes: the working copy is already current.
    if !has_changes(base2theirs)? {
        return Ok(());
    }

    let base2ours = TmpFile::new("base2ours");
    create_changeset(ctx, driver_name, conninfo, base, modified, base2ours.path())?;

    // No local changes: plain apply of the upstream diff.
    if !has_changes(base2ours.path())? {
        return apply_changeset(ctx, driver_name, conninfo, modified, base2theirs);
    }

    let rebased = TmpFile::new("rebased");
    create_rebased_changeset(base2ours.path(), base2theirs, rebased.path(), conflict_file)?;

    let ours2base = TmpFile::new("ours2base");
    invert_changeset_file(base2ours.path(), ours2base.path())?;

    let combined = TmpFile::new("combined");
    concat_changes(
        &[
            ours2base.path().to_path_buf(),
            base2theirs.to_path_buf(),
            rebased.path().to_path_buf(),
        ],
        combined.path(),
    )?;

    apply_changeset(ctx, driver_name, conninfo, modified, combined.path())
}

/// Copy all tables with their content from `src` to a freshly created
/// `dst` (createTables + dump + apply).
///
/// # Errors
///
/// Driver, schema and I/O errors propagate.
pub fn make_copy(
    ctx: &Context,
    driver_src: &str,
    conninfo_src: Option<&str>,
    src: &str,
    driver_dst: &str,
    conninfo_dst: Option<&str>,
    dst: &str,
) -> Result<()> {
    let mut dump = ChangesetWriter::new();
    let mut schemas = Vec::new();
    {
        let mut source = open_one(ctx, driver_src, conninfo_src, src)?;
        for table_name in source.list_tables(false)? {
            if ctx.is_table_skipped(&table_name) {
                continue;
            }
            schemas.push(source.table_schema(&table_name, false)?);
        }
        source.dump_data(&mut dump, false)?;
    }

    if driver_dst != driver::SQLITE_DRIVER_NAME {
        return Err(Error::Unsupported(format!(
            "unknown destination driver: {driver_dst}"
        )));
    }
    let params = with_conninfo(driver::params_single_source(dst), conninfo_dst);
    let mut destination = crate::driver::sqlite::SqliteDriver::create(ctx, &params, true)?;
    destination.create_tables(&schemas)?;

    let mut reader = ChangesetReader::from_bytes(dump.into_bytes());
    if reader.is_empty() {
        return Ok(());
    }
    destination.apply_changeset(&mut reader)
}

/// Dump every row of `src` as INSERT entries into a changeset at `output`.
///
/// # Errors
///
/// Driver and I/O errors propagate.
pub fn dump_data(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    src: &str,
    output: &Path,
) -> Result<()> {
    let mut driver = open_one(ctx, driver_name, conninfo, src)?;
    let mut writer = ChangesetWriter::new();
    driver.dump_data(&mut writer, false)?;
    writer.save(output)
}

/// Render the schema of every table of `src` as a JSON document.
///
/// # Errors
///
/// Driver errors propagate.
pub fn schema_json(
    ctx: &Context,
    driver_name: &str,
    conninfo: Option<&str>,
    src: &str,
) -> Result<serde_json::Value> {
    let driver = open_one(ctx, driver_name, conninfo, src)?;
    let mut tables = Vec::new();
    for table_name in driver.list_tables(false)? {
        tables.push(driver.table_schema(&table_name, false)?);
    }
    Ok(serde_json::json!({ "gpkgdiff_schema": tables }))
}

/// Render the changeset at `path` as a JSON document.
///
/// # Errors
///
/// Format and I/O errors propagate.
pub fn changeset_json(path: &Path) -> Result<serde_json::Value> {
    let mut reader = ChangesetReader::open(path)?;
    export::changeset_to_json(&mut reader)
}

/// Render per-table operation counts of the changeset at `path`.
///
/// # Errors
///
/// Format and I/O errors propagate.
pub fn changeset_summary_json(path: &Path) -> Result<serde_json::Value> {
    let mut reader = ChangesetReader::open(path)?;
    export::changeset_to_json_summary(&mut reader)
}
