//! Submodule defining the errors used across the crate.

/// Errors that can occur while producing, transforming or applying changesets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying read/write failed, file missing, permissions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The changeset byte stream is malformed. Carries the byte offset at
    /// which the reader gave up.
    #[error("malformed changeset at offset {offset}: {message}")]
    FormatMalformed {
        /// Byte offset into the stream where the failure occurred.
        offset: usize,
        /// What went wrong.
        message: String,
    },

    /// Table sets differ between the two databases, or a table's structure
    /// (column count, names, PK flags, geometry metadata, CRS) differs.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The operation cannot be carried out on this input: schema evolution,
    /// missing primary key where one is required, or a rebase attempted on a
    /// database with triggers or foreign keys.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Applying a changeset detected at least one per-row conflict. The
    /// whole apply has been rolled back; the payload is the conflict count.
    #[error("{0} conflict(s) encountered while applying changeset, rolled back")]
    Conflict(usize),

    /// The backend reported a constraint violation, integrity error or
    /// connection loss outside of apply-conflict accounting.
    #[error("database error: {0}")]
    Backend(rusqlite::Error),

    /// The backend ran out of memory.
    #[error("out of memory")]
    OutOfMemory,
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(fail, _) = &err
            && fail.code == rusqlite::ErrorCode::OutOfMemory
        {
            return Error::OutOfMemory;
        }
        Error::Backend(err)
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_reports_offset() {
        let err = Error::FormatMalformed {
            offset: 42,
            message: "unknown entry type 7".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed changeset at offset 42: unknown entry type 7"
        );
    }

    #[test]
    fn conflict_error_carries_count() {
        let err = Error::Conflict(3);
        assert!(err.to_string().contains('3'));
    }
}
