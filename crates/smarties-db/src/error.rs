use thiserror::Error;

/// Errors raised by the schema manager and the object mapper.
#[derive(Debug, Error)]
pub enum DbError {
    /// The table was never declared through `init_schema` / `migrate`.
    #[error("Unknown DB table: {table}")]
    UnknownTable { table: String },

    /// A field declares a semantic type the store has no column type for.
    #[error("Unknown DB field type '{field_type}' for field {field}")]
    UnknownFieldType { field: String, field_type: String },

    /// Field metadata without a usable field name.
    #[error("No DB field detected in table {table}")]
    NoFieldDetected { table: String },

    /// A version string that is not of the `x.y.z` form.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Reserved or duplicated field names.
    #[error("Invalid schema for table {table}: {reason}")]
    InvalidSchema { table: String, reason: String },

    /// A request that cannot be executed as asked (wrong table, unfiltered delete).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A stored value could not be converted into the declared field type.
    #[error("Cannot convert field {field}: {reason}")]
    Conversion { field: String, reason: String },

    /// Underlying SQLite / rusqlite error, surfaced unmodified.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
