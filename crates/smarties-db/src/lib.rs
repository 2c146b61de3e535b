//! `smarties-db` — embedded data layer over SQLite.
//!
//! # Layers
//!
//! | Module      | Role                                                         |
//! |-------------|--------------------------------------------------------------|
//! | `request`   | SQL compiler: builder → parameterized statement              |
//! | `manager`   | Schema manager: create/migrate tables, execute statements    |
//! | `object`    | Object mapper: typed value objects ↔ rows                    |
//! | `types`     | Field metadata, versions, table schemas, rows                |
//!
//! Tables always carry an `id` surrogate key and a `timestamp` write-time
//! column. Migrations are additive only: columns are added when their
//! declared version is newer than the version the store was last at, and
//! never dropped.

pub mod error;
pub mod manager;
pub mod object;
pub mod request;
pub mod types;

pub use error::{DbError, Result};
pub use manager::DbManager;
pub use object::{DbHelper, DbObject, Stored};
pub use request::{Aggregate, Operator, Order, RequestBuilder, Statement};
pub use rusqlite::types::Value;
pub use types::{
    FieldMeta, FieldType, Row, TableSchema, ValueCursor, Version, FIELD_ID, FIELD_TIMESTAMP,
};
