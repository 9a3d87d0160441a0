#![doc = include_str!("../README.md")]
#![deny(clippy::mod_module_files)]

pub mod changeset;
pub mod concat;
pub mod context;
pub mod driver;
pub mod errors;
pub mod export;
pub mod gpkg;
pub mod invert;
pub mod ops;
pub mod rebase;
pub mod schema;

// Re-export main types
pub use changeset::{
    ChangesetEntry, ChangesetReader, ChangesetTable, ChangesetWriter, Operation, Value,
};
pub use context::Context;
pub use driver::{Driver, DriverParams};
pub use errors::{Error, Result};
pub use rebase::{ConflictFeature, ConflictItem};
pub use schema::{BaseType, TableColumnInfo, TableSchema};
