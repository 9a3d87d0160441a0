//! Database table schema model used by drivers.
//!
//! This is a richer per-table view than the [`crate::changeset::ChangesetTable`]
//! descriptor carried inside changesets: column names, base types, PK and
//! NOT NULL flags, geometry metadata and the coordinate reference system.
//! Schemas are read from the backend on demand; they are never serialized
//! into a changeset.

use serde::Serialize;

/// Backend-independent base type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseType {
    /// UTF-8 text.
    Text,
    /// Integer of any width.
    Integer,
    /// Floating point number.
    Double,
    /// Boolean flag.
    Boolean,
    /// Opaque binary data.
    Blob,
    /// Geometry blob.
    Geometry,
    /// Calendar date.
    Date,
    /// Date and time.
    Datetime,
}

/// Column type: the backend's original type name plus its base type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnType {
    /// Backend-independent base type.
    pub base: BaseType,
    /// Type name exactly as reported by the backend.
    pub db_type: String,
}

/// Map a SQLite/GeoPackage column type name to its base type.
///
/// SQLite is easy-going about type names, so the match is by name family;
/// unknown names fall back to text, which matches the backend's affinity
/// rules closely enough for diffing.
#[must_use]
pub fn column_type_from_sqlite(db_type: &str, is_geometry: bool) -> ColumnType {
    let lower = db_type.to_lowercase();
    let base = match lower.as_str() {
        "int" | "integer" | "smallint" | "mediumint" | "bigint" | "tinyint" => BaseType::Integer,
        "double" | "real" | "double precision" | "float" => BaseType::Double,
        "bool" | "boolean" => BaseType::Boolean,
        "blob" => BaseType::Blob,
        "datetime" => BaseType::Datetime,
        "date" => BaseType::Date,
        _ if lower == "text" || lower.starts_with("text(") || lower.starts_with("varchar(") => {
            BaseType::Text
        }
        _ if is_geometry => BaseType::Geometry,
        _ => {
            tracing::warn!(db_type, "unknown column type, treating as text");
            BaseType::Text
        }
    };
    ColumnType {
        base,
        db_type: db_type.to_string(),
    }
}

/// Information about a single column of a database table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableColumnInfo {
    /// Unique column name.
    pub name: String,
    /// Column type as reported by the database, with its base type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether the column is part of the table's primary key.
    pub primary_key: bool,
    /// Whether null values are rejected.
    pub not_null: bool,
    /// Whether the column auto-increments.
    pub auto_increment: bool,
    /// Whether the column stores geometry data.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_geometry: bool,
    /// Flat geometry type name (POINT, LINESTRING, ...), without Z/M.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geom_type: Option<String>,
    /// Spatial reference system identifier of the geometry column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geom_srs_id: Option<i32>,
    /// Whether geometries carry Z coordinates.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub geom_has_z: bool,
    /// Whether geometries carry M coordinates.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub geom_has_m: bool,
}

impl TableColumnInfo {
    /// Plain non-geometry column.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            not_null: false,
            auto_increment: false,
            is_geometry: false,
            geom_type: None,
            geom_srs_id: None,
            geom_has_z: false,
            geom_has_m: false,
        }
    }

    /// Mark this column as a geometry column.
    pub fn set_geometry(&mut self, geom_type: impl Into<String>, srs_id: i32, has_z: bool, has_m: bool) {
        self.column_type.base = BaseType::Geometry;
        self.is_geometry = true;
        self.geom_type = Some(geom_type.into());
        self.geom_srs_id = Some(srs_id);
        self.geom_has_z = has_z;
        self.geom_has_m = has_m;
    }

    /// Structural comparison that tolerates different backend type names
    /// mapping to the same base type.
    #[must_use]
    pub fn compare_with_base_types(&self, other: &Self) -> bool {
        self.name == other.name
            && self.column_type.base == other.column_type.base
            && self.primary_key == other.primary_key
            && self.not_null == other.not_null
            && self.auto_increment == other.auto_increment
            && self.is_geometry == other.is_geometry
            && self.geom_type == other.geom_type
            && self.geom_srs_id == other.geom_srs_id
            && self.geom_has_z == other.geom_has_z
            && self.geom_has_m == other.geom_has_m
    }
}

/// Definition of a coordinate reference system.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrsDefinition {
    /// Identifier of the CRS within the database.
    pub srs_id: i32,
    /// Name of the authority (usually "EPSG").
    pub auth_name: String,
    /// Code of the CRS within the authority.
    pub auth_code: i32,
    /// Well-known-text definition.
    pub wkt: String,
}

impl PartialEq for CrsDefinition {
    fn eq(&self, other: &Self) -> bool {
        // The WKT of one CRS can be spelled in several ways, so it does not
        // take part in equality.
        self.srs_id == other.srs_id
            && self.auth_name == other.auth_name
            && self.auth_code == other.auth_code
    }
}

/// Schema of a single database table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Ordered column definitions.
    pub columns: Vec<TableColumnInfo>,
    /// CRS definition, meaningful when at least one column is geometric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crs: Option<CrsDefinition>,
}

impl TableSchema {
    /// True when at least one column is part of the primary key.
    #[must_use]
    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// Index of the named column.
    #[must_use]
    pub fn column_from_name(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index of the first geometry column.
    #[must_use]
    pub fn geometry_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_geometry)
    }

    /// Structural comparison tolerant to backend type-name spelling, per
    /// column. Everything else (names, flags, geometry metadata, CRS) must
    /// match exactly.
    #[must_use]
    pub fn compare_with_base_types(&self, other: &Self) -> bool {
        self.name == other.name
            && self.crs == other.crs
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.compare_with_base_types(b))
    }

    /// The PK flag vector of this schema, as carried in changeset table
    /// headers.
    #[must_use]
    pub fn primary_key_flags(&self) -> Vec<bool> {
        self.columns.iter().map(|c| c.primary_key).collect()
    }
}

/// Canonicalize a datetime string for comparison.
///
/// Date/time values stored as text can have several equivalent spellings
/// (trailing "Z", "T" separator, fractional seconds). Both sides of a
/// comparison are parsed and re-rendered as `YYYY-MM-DD HH:MM:SS` in UTC;
/// a string that does not parse is returned unchanged so a genuine text
/// difference still counts as a change.
#[must_use]
pub fn canonical_datetime(text: &str) -> String {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string();
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return dt.format("%Y-%m-%d %H:%M:%S").to_string();
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return d
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }
    text.to_string()
}

/// Whether two datetime strings denote the same instant.
#[must_use]
pub fn datetime_equal(a: &str, b: &str) -> bool {
    canonical_datetime(a) == canonical_datetime(b)
}
