//! Operation context: configuration carried through every top-level call.
//!
//! There is no global mutable state in this crate; anything configurable
//! lives in a [`Context`] owned by the caller.

use tracing::level_filters::LevelFilter;

/// Environment variable selecting the maximum log level: 0 silent,
/// 1 errors, 2 warnings, 3 info, 4 debug.
pub const LOGGER_LEVEL_ENV: &str = "GPKGDIFF_LOGGER_LEVEL";

/// Configuration shared by the operations of one caller.
#[derive(Debug, Clone, Default)]
pub struct Context {
    tables_to_skip: Vec<String>,
}

impl Context {
    /// Context with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list of table names excluded from every operation.
    /// The list persists until replaced or cleared.
    pub fn set_tables_to_skip(&mut self, tables: Vec<String>) {
        self.tables_to_skip = tables;
    }

    /// Whether the named table is excluded from processing.
    #[must_use]
    pub fn is_table_skipped(&self, table_name: &str) -> bool {
        self.tables_to_skip.iter().any(|t| t == table_name)
    }

    /// Names of the excluded tables.
    #[must_use]
    pub fn tables_to_skip(&self) -> &[String] {
        &self.tables_to_skip
    }
}

/// Resolve the maximum log level from [`LOGGER_LEVEL_ENV`].
///
/// Unset or unparsable values fall back to the default of 2 (warnings).
#[must_use]
pub fn logger_level_from_env() -> LevelFilter {
    let level = std::env::var(LOGGER_LEVEL_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(2);
    match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_list_matches_exact_names() {
        let mut ctx = Context::new();
        ctx.set_tables_to_skip(vec!["audit_log".into()]);
        assert!(ctx.is_table_skipped("audit_log"));
        assert!(!ctx.is_table_skipped("audit"));
        ctx.set_tables_to_skip(Vec::new());
        assert!(!ctx.is_table_skipped("audit_log"));
    }
}
