//! Command-line interface for gpkgdiff.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gpkgdiff::context::{Context, logger_level_from_env};
use gpkgdiff::{driver, ops};

#[derive(Parser)]
#[command(name = "gpkgdiff", about = "Changeset tool for GeoPackage/SQLite databases", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// `--driver NAME OPTS` pair used by most database-touching commands.
#[derive(clap::Args)]
struct DriverOption {
    /// Driver name and its options (connection string)
    #[arg(long, num_args = 2, value_names = ["NAME", "OPTS"])]
    driver: Option<Vec<String>>,
}

impl DriverOption {
    fn resolve(&self) -> (String, Option<String>) {
        match &self.driver {
            Some(pair) => (pair[0].clone(), Some(pair[1].clone()).filter(|s| !s.is_empty())),
            None => (driver::SQLITE_DRIVER_NAME.to_string(), None),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Compare two databases and write the changeset
    Diff {
        /// Print the diff as JSON instead of writing a changeset
        #[arg(long, conflicts_with = "summary")]
        json: bool,
        /// Print a per-table summary instead of writing a changeset
        #[arg(long)]
        summary: bool,
        #[command(flatten)]
        driver: DriverOption,
        /// Base database
        db1: String,
        /// Modified database
        db2: String,
        /// Output changeset file (required unless --json/--summary)
        changeset: Option<PathBuf>,
    },
    /// Apply a changeset to a database
    Apply {
        #[command(flatten)]
        driver: DriverOption,
        /// Database to modify
        db: String,
        /// Changeset file to apply
        changeset: PathBuf,
    },
    /// Invert a changeset
    Invert {
        /// Input changeset file
        input: PathBuf,
        /// Output changeset file
        output: PathBuf,
    },
    /// Concatenate two or more changesets into one
    Concat {
        /// Input changesets followed by the output file
        #[arg(num_args = 3..)]
        files: Vec<PathBuf>,
    },
    /// Print a changeset as JSON
    AsJson {
        /// Input changeset file
        input: PathBuf,
        /// Output file (stdout when omitted)
        output: Option<PathBuf>,
    },
    /// Print a per-table summary of a changeset
    AsSummary {
        /// Input changeset file
        input: PathBuf,
        /// Output file (stdout when omitted)
        output: Option<PathBuf>,
    },
    /// Rebase a local diff on top of an upstream diff
    RebaseDiff {
        #[command(flatten)]
        driver: DriverOption,
        /// Common base database
        db_base: String,
        /// Local diff (base -> ours)
        ch_base_our: PathBuf,
        /// Upstream diff (base -> theirs)
        ch_base_their: PathBuf,
        /// Output rebased diff (theirs -> ours)
        ch_rebased: PathBuf,
        /// Conflict report file (JSON, written only when non-empty)
        conflict: PathBuf,
    },
    /// Rebase a local working copy in place
    RebaseDb {
        #[command(flatten)]
        driver: DriverOption,
        /// Common base database
        db_base: String,
        /// Local working copy to rebase
        db_our: String,
        /// Upstream diff (base -> theirs)
        ch_base_their: PathBuf,
        /// Conflict report file (JSON, written only when non-empty)
        conflict: PathBuf,
    },
    /// Copy a database, including schema and data
    Copy {
        /// Source driver name and options
        #[arg(long = "driver-1", num_args = 2, value_names = ["NAME", "OPTS"])]
        driver_1: Option<Vec<String>>,
        /// Destination driver name and options
        #[arg(long = "driver-2", num_args = 2, value_names = ["NAME", "OPTS"])]
        driver_2: Option<Vec<String>>,
        /// Source database
        db_src: String,
        /// Destination database
        db_dst: String,
    },
    /// Print the schema of a database as JSON
    Schema {
        #[command(flatten)]
        driver: DriverOption,
        /// Database to inspect
        db: String,
        /// Output file (stdout when omitted)
        output: Option<PathBuf>,
    },
    /// Write all rows of a database as a changeset of INSERTs
    Dump {
        #[command(flatten)]
        driver: DriverOption,
        /// Database to dump
        db: String,
        /// Output changeset file
        changeset: PathBuf,
    },
    /// List the registered drivers
    Drivers,
    /// Print the version
    Version,
}

fn emit_json(doc: &serde_json::Value, output: Option<&PathBuf>) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(doc)?;
    match output {
        Some(path) => std::fs::write(path, rendered.as_bytes())
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn resolve_pair(pair: Option<&Vec<String>>) -> (String, Option<String>) {
    match pair {
        Some(pair) => (pair[0].clone(), Some(pair[1].clone()).filter(|s| !s.is_empty())),
        None => (driver::SQLITE_DRIVER_NAME.to_string(), None),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::new();

    match cli.command {
        Command::Diff {
            json,
            summary,
            driver,
            db1,
            db2,
            changeset,
        } => {
            let (name, conninfo) = driver.resolve();
            if json || summary {
                let tmp = tempfile_path();
                ops::create_changeset(&ctx, &name, conninfo.as_deref(), &db1, &db2, &tmp)?;
                let doc = if json {
                    ops::changeset_json(&tmp)?
                } else {
                    ops::changeset_summary_json(&tmp)?
                };
                let _ = std::fs::remove_file(&tmp);
                emit_json(&doc, changeset.as_ref())?;
            } else {
                let output = changeset
                    .ok_or_else(|| anyhow::anyhow!("missing output changeset argument"))?;
                ops::create_changeset(&ctx, &name, conninfo.as_deref(), &db1, &db2, &output)?;
            }
        }
        Command::Apply {
            driver,
            db,
            changeset,
        } => {
            let (name, conninfo) = driver.resolve();
            ops::apply_changeset(&ctx, &name, conninfo.as_deref(), &db, &changeset)?;
        }
        Command::Invert { input, output } => {
            ops::invert_changeset_file(&input, &output)?;
        }
        Command::Concat { files } => {
            let (output, inputs) = files
                .split_last()
                .ok_or_else(|| anyhow::anyhow!("missing arguments"))?;
            ops::concat_changes(inputs, output)?;
        }
        Command::AsJson { input, output } => {
            let doc = ops::changeset_json(&input)?;
            emit_json(&doc, output.as_ref())?;
        }
        Command::AsSummary { input, output } => {
            let doc = ops::changeset_summary_json(&input)?;
            emit_json(&doc, output.as_ref())?;
        }
        Command::RebaseDiff {
            driver,
            db_base,
            ch_base_our,
            ch_base_their,
            ch_rebased,
            conflict,
        } => {
            let (name, conninfo) = driver.resolve();
            // Make sure rebase can reason about this database at all.
            let params = gpkgdiff::driver::params_single_source(&db_base);
            let params = match conninfo.as_deref() {
                Some(ci) => {
                    let mut p = params;
                    p.insert("conninfo".into(), ci.into());
                    p
                }
                None => params,
            };
            let mut drv = gpkgdiff::driver::open_driver(&ctx, &name, &params)?;
            drv.check_compatible_for_rebase(false)?;
            drop(drv);
            ops::create_rebased_changeset(&ch_base_our, &ch_base_their, &ch_rebased, &conflict)?;
        }
        Command::RebaseDb {
            driver,
            db_base,
            db_our,
            ch_base_their,
            conflict,
        } => {
            let (name, conninfo) = driver.resolve();
            ops::rebase_db(
                &ctx,
                &name,
                conninfo.as_deref(),
                &db_base,
                &db_our,
                &ch_base_their,
                &conflict,
            )?;
        }
        Command::Copy {
            driver_1,
            driver_2,
            db_src,
            db_dst,
        } => {
            let (src_name, src_conninfo) = resolve_pair(driver_1.as_ref());
            let (dst_name, dst_conninfo) = resolve_pair(driver_2.as_ref());
            ops::make_copy(
                &ctx,
                &src_name,
                src_conninfo.as_deref(),
                &db_src,
                &dst_name,
                dst_conninfo.as_deref(),
                &db_dst,
            )?;
        }
        Command::Schema { driver, db, output } => {
            let (name, conninfo) = driver.resolve();
            let doc = ops::schema_json(&ctx, &name, conninfo.as_deref(), &db)?;
            emit_json(&doc, output.as_ref())?;
        }
        Command::Dump {
            driver,
            db,
            changeset,
        } => {
            let (name, conninfo) = driver.resolve();
            ops::dump_data(&ctx, &name, conninfo.as_deref(), &db, &changeset)?;
        }
        Command::Drivers => {
            for name in driver::driver_names() {
                println!("{name}");
            }
        }
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn tempfile_path() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut path = std::env::temp_dir();
    path.push(format!("gpkgdiff_cli_{}_{nanos}.bin", std::process::id()));
    path
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(logger_level_from_env())
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}
