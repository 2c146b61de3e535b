use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{DbError, Result};
use crate::request::{add_column_sql, create_table_sql, Order, RequestBuilder, Statement};
use crate::types::{is_blank, Row, TableSchema, Version, FIELD_ID, FIELD_TIMESTAMP};

/// Records the last version each table was migrated to.
const LEDGER_TABLE: &str = "smarties_schema_ledger";

/// Owns the SQLite store: creates and migrates declared tables, then runs
/// compiled statements against them.
///
/// Every statement goes through the single `Connection` behind the mutex,
/// so writes are serialized without further locking.
pub struct DbManager {
    conn: Mutex<Connection>,
    schemas: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl DbManager {
    /// Wrap an already-open connection and create the schema ledger.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                tbl         TEXT    NOT NULL PRIMARY KEY,
                version     TEXT    NOT NULL,
                updated_at  INTEGER NOT NULL
            );"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Open (or create) a file-backed store in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening SQLite database");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure every table exists and carries the fields declared after
    /// `old_version`.
    ///
    /// Absent tables are created with all declared fields. For existing
    /// tables, a field is added only when its version is strictly newer than
    /// `old_version` and the column is not there yet, so re-running with the
    /// same arguments is a no-op. Columns are never dropped or retyped.
    #[instrument(skip(self, schemas), fields(tables = schemas.len()))]
    pub fn init_schema(&self, schemas: &[TableSchema], old_version: &str) -> Result<()> {
        let old = Version::parse(old_version)?;
        for schema in schemas {
            schema.validate()?;
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for schema in schemas {
            let table = schema.name.as_str();
            if !table_exists(&tx, table)? {
                let sql = create_table_sql(schema);
                trace!(%sql);
                tx.execute_batch(&sql)?;
                info!(%table, fields = schema.fields.len(), "table created");
                continue;
            }

            let existing = table_columns(&tx, table)?;
            for field in &schema.fields {
                if field.version.number() <= old.number() {
                    continue;
                }
                if existing.iter().any(|c| c == field.name()) {
                    continue;
                }
                let sql = add_column_sql(table, field);
                trace!(%sql);
                match tx.execute_batch(&sql) {
                    Ok(()) => {
                        info!(%table, field = field.name(), version = %field.version, "column added")
                    }
                    Err(e) if e.to_string().contains("duplicate column") => {
                        warn!(%table, field = field.name(), "column already exists, skipping");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tx.commit()?;
        drop(conn);

        let mut registry = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        for schema in schemas {
            registry.insert(schema.name.clone(), Arc::new(schema.clone()));
        }
        Ok(())
    }

    /// Migrate from the versions recorded in the schema ledger, then record
    /// `current_version` for every table.
    ///
    /// Tables with no ledger entry are treated as being at `0.0.0`.
    #[instrument(skip(self, schemas), fields(tables = schemas.len()))]
    pub fn migrate(&self, schemas: &[TableSchema], current_version: &str) -> Result<()> {
        let current = Version::parse(current_version)?;
        for schema in schemas {
            let applied = self.applied_version(&schema.name)?.unwrap_or_default();
            debug!(table = %schema.name, from = %applied, to = %current, "migrating table");
            self.init_schema(std::slice::from_ref(schema), &applied.to_string())?;
            self.conn().execute(
                &format!(
                    "INSERT INTO {LEDGER_TABLE} (tbl, version, updated_at)
                     VALUES (?1, ?2, CAST(strftime('%s','now') AS INTEGER))
                     ON CONFLICT(tbl) DO UPDATE SET
                        version = excluded.version,
                        updated_at = excluded.updated_at"
                ),
                rusqlite::params![schema.name, current.to_string()],
            )?;
        }
        Ok(())
    }

    /// Last version recorded by [`migrate`](Self::migrate) for `table`.
    pub fn applied_version(&self, table: &str) -> Result<Option<Version>> {
        let version: Option<String> = self
            .conn()
            .query_row(
                &format!("SELECT version FROM {LEDGER_TABLE} WHERE tbl = ?1"),
                [table],
                |row| row.get(0),
            )
            .optional()?;
        version.map(|v| Version::parse(&v)).transpose()
    }

    /// Physical column names of `table`, in table order.
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn(), table)
    }

    /// The registered schema for `table`.
    pub fn schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::UnknownTable {
                table: table.to_string(),
            })
    }

    /// A fresh request builder for a registered table.
    pub fn request(&self, table: &str) -> Result<RequestBuilder> {
        Ok(RequestBuilder::new(self.schema(table)?))
    }

    /// Upsert `row`: an update by key when it carries a non-null `id`, an
    /// insert otherwise. Returns the row id.
    #[instrument(skip(self, row))]
    pub fn save(&self, table: &str, row: &Row) -> Result<i64> {
        let request = self.request(table)?.save(row);
        let is_update = request.is_update();
        let stmt = request.request();
        let conn = self.conn();
        execute(&conn, &stmt)?;
        if !is_update {
            return Ok(conn.last_insert_rowid());
        }
        match stmt.params.last() {
            Some(Value::Integer(id)) => Ok(*id),
            other => Err(DbError::InvalidRequest(format!(
                "update of {table} has a non-integer key: {other:?}"
            ))),
        }
    }

    /// Run the update of `request` against the rows matching its filters.
    /// Returns how many rows changed, so callers can make a state change
    /// conditional on the current value of a column.
    #[instrument(skip(self, request), fields(table = request.table()))]
    pub fn update_many(&self, request: RequestBuilder) -> Result<usize> {
        self.check_request(&request)?;
        if !request.is_update() {
            return Err(DbError::InvalidRequest(format!(
                "no update assignments for {}",
                request.table()
            )));
        }
        if !request.has_filters() {
            return Err(DbError::InvalidRequest(format!(
                "refusing to update {} without a where clause",
                request.table()
            )));
        }
        execute(&self.conn(), &request.request())
    }

    /// First row equal to `row` on every non-null field.
    #[instrument(skip(self, row))]
    pub fn get(&self, table: &str, row: &Row) -> Result<Option<Row>> {
        let stmt = self.request(table)?.get(row).first(1).request();
        Ok(query(&self.conn(), &stmt)?.into_iter().next())
    }

    /// Every row matching the filters of `request`.
    #[instrument(skip(self, request), fields(table = request.table()))]
    pub fn get_all(&self, request: RequestBuilder) -> Result<Vec<Row>> {
        self.check_request(&request)?;
        let stmt = request.clean_for_select().request();
        query(&self.conn(), &stmt)
    }

    /// The most recently written row.
    #[instrument(skip(self))]
    pub fn get_last(&self, table: &str) -> Result<Option<Row>> {
        let stmt = self
            .request(table)?
            .select(&[])
            .order(Order::Desc, FIELD_TIMESTAMP)
            .order(Order::Desc, FIELD_ID)
            .first(1)
            .request();
        Ok(query(&self.conn(), &stmt)?.into_iter().next())
    }

    /// Number of rows matching the filters of `request`.
    #[instrument(skip(self, request), fields(table = request.table()))]
    pub fn count(&self, request: RequestBuilder) -> Result<i64> {
        self.check_request(&request)?;
        let stmt = request
            .select_op(crate::request::Aggregate::Count, FIELD_ID, Some("total"))
            .clean_for_select()
            .request();
        let rows = query(&self.conn(), &stmt)?;
        Ok(rows
            .first()
            .and_then(|r| r.get_i64("total"))
            .unwrap_or(0))
    }

    /// Delete rows equal to `row` on every non-null field.
    ///
    /// A row with no non-null field would match the whole table and is
    /// rejected.
    #[instrument(skip(self, row))]
    pub fn delete_one(&self, table: &str, row: &Row) -> Result<usize> {
        if row.iter().all(|(_, v)| is_blank(v)) {
            return Err(DbError::InvalidRequest(format!(
                "refusing to delete from {table} without any non-null field"
            )));
        }
        let stmt = self.request(table)?.del(row).request();
        execute(&self.conn(), &stmt)
    }

    /// Delete every row matching the filters of `request`.
    #[instrument(skip(self, request), fields(table = request.table()))]
    pub fn delete_many(&self, request: RequestBuilder) -> Result<usize> {
        self.check_request(&request)?;
        if !request.has_filters() {
            return Err(DbError::InvalidRequest(format!(
                "refusing to delete from {} without a where clause",
                request.table()
            )));
        }
        let stmt = request.clean_for_delete().request();
        execute(&self.conn(), &stmt)
    }

    /// The request must target a table registered here, with the schema
    /// this manager knows.
    fn check_request(&self, request: &RequestBuilder) -> Result<()> {
        let registered = self.schema(request.table())?;
        if registered.as_ref() != request.schema() {
            return Err(DbError::InvalidRequest(format!(
                "request was built for a different schema of table {}",
                request.table()
            )));
        }
        Ok(())
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn execute(conn: &Connection, stmt: &Statement) -> Result<usize> {
    trace!(sql = %stmt.expanded(), "execute");
    Ok(conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?)
}

fn query(conn: &Connection, stmt: &Statement) -> Result<Vec<Row>> {
    trace!(sql = %stmt.expanded(), "query");
    let mut prepared = conn.prepare(&stmt.sql)?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let rows = prepared
        .query_map(params_from_iter(stmt.params.iter()), |r| {
            let mut row = Row::new();
            for (i, name) in columns.iter().enumerate() {
                row.set(name, r.get::<_, Value>(i)?);
            }
            Ok(row)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Operator;
    use crate::types::{FieldMeta, FieldType};

    fn foobar(extra: Option<FieldMeta>) -> TableSchema {
        let mut fields = vec![
            FieldMeta::new("foo", FieldType::String, Version::new(0, 0, 0)),
            FieldMeta::new("bar", FieldType::Int, Version::new(0, 0, 0)),
        ];
        fields.extend(extra);
        TableSchema::new("foobar", fields)
    }

    fn manager() -> DbManager {
        let db = DbManager::open_in_memory().unwrap();
        db.init_schema(&[foobar(None)], "0.0.0").unwrap();
        db
    }

    #[test]
    fn creates_table_with_system_fields() {
        let db = manager();
        assert_eq!(
            db.columns("foobar").unwrap(),
            vec!["id", "timestamp", "foo", "bar"]
        );
    }

    #[test]
    fn unknown_table_is_reported() {
        let db = manager();
        let err = db.save("nope", &Row::new().with("foo", 1i64)).unwrap_err();
        assert!(matches!(err, DbError::UnknownTable { .. }));
        assert!(matches!(db.get_last("nope"), Err(DbError::UnknownTable { .. })));
    }

    #[test]
    fn save_with_null_id_inserts_a_new_row() {
        let db = manager();
        let first = db.save("foobar", &Row::new().with("foo", "a".to_string())).unwrap();
        let second = db
            .save(
                "foobar",
                &Row::new().with("id", Value::Null).with("foo", "b".to_string()),
            )
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        let all = db.request("foobar").unwrap();
        assert_eq!(db.count(all).unwrap(), 2);

        let row = db.get("foobar", &Row::new().with("id", second)).unwrap().unwrap();
        assert_eq!(row.get_str("foo"), Some("b"));
    }

    #[test]
    fn save_of_empty_row_inserts_defaults() {
        let db = manager();
        let id = db.save("foobar", &Row::new()).unwrap();
        let row = db.get("foobar", &Row::new().with("id", id)).unwrap().unwrap();
        assert_eq!(row.get("foo"), Some(&Value::Null));
        assert!(row.get_i64("timestamp").is_some());
    }

    #[test]
    fn update_many_only_touches_matching_rows() {
        let db = manager();
        let id = db
            .save("foobar", &Row::new().with("foo", "x".to_string()).with("bar", -1i64))
            .unwrap();
        let flip = |from: i64| {
            db.request("foobar")
                .unwrap()
                .update(&["bar"])
                .values([1i64])
                .and_where("id", Operator::Eq, id)
                .and_where("bar", Operator::Eq, from)
        };
        assert_eq!(db.update_many(flip(-1)).unwrap(), 1);
        // already flipped: the condition no longer holds
        assert_eq!(db.update_many(flip(-1)).unwrap(), 0);

        let no_filter = db.request("foobar").unwrap().update(&["bar"]).values([2i64]);
        assert!(matches!(
            db.update_many(no_filter),
            Err(DbError::InvalidRequest(_))
        ));
        let no_update = db.request("foobar").unwrap().and_where("bar", Operator::Eq, 1i64);
        assert!(matches!(
            db.update_many(no_update),
            Err(DbError::InvalidRequest(_))
        ));
    }

    #[test]
    fn invalid_schema_creates_nothing() {
        let db = DbManager::open_in_memory().unwrap();
        let bad = TableSchema::new(
            "bad",
            vec![FieldMeta::new("id", FieldType::Int, Version::new(0, 0, 0))],
        );
        assert!(db.init_schema(&[bad], "0.0.0").is_err());
        assert!(matches!(db.schema("bad"), Err(DbError::UnknownTable { .. })));
        assert!(db.columns("bad").unwrap().is_empty());
    }

    #[test]
    fn newer_field_is_added_on_migration() {
        let db = manager();
        let newer = foobar(Some(FieldMeta::new(
            "baz",
            FieldType::Double,
            Version::new(0, 2, 0),
        )));
        db.init_schema(&[newer.clone()], "0.1.0").unwrap();
        assert!(db.columns("foobar").unwrap().contains(&"baz".to_string()));

        // idempotent: same schema and version again
        db.init_schema(&[newer], "0.1.0").unwrap();
        assert_eq!(db.columns("foobar").unwrap().len(), 5);
    }

    #[test]
    fn field_not_newer_than_old_version_is_not_added() {
        let db = manager();
        let newer = foobar(Some(FieldMeta::new(
            "baz",
            FieldType::Double,
            Version::new(0, 2, 0),
        )));
        db.init_schema(&[newer.clone()], "0.2.0").unwrap();
        assert!(!db.columns("foobar").unwrap().contains(&"baz".to_string()));
        db.init_schema(&[newer], "0.3.1").unwrap();
        assert!(!db.columns("foobar").unwrap().contains(&"baz".to_string()));
    }

    #[test]
    fn migrate_records_ledger() {
        let db = DbManager::open_in_memory().unwrap();
        assert_eq!(db.applied_version("foobar").unwrap(), None);
        db.migrate(&[foobar(None)], "1.0.0").unwrap();
        assert_eq!(
            db.applied_version("foobar").unwrap(),
            Some(Version::new(1, 0, 0))
        );

        let newer = foobar(Some(FieldMeta::new(
            "baz",
            FieldType::String,
            Version::new(1, 1, 0),
        )));
        db.migrate(&[newer], "1.1.0").unwrap();
        assert!(db.columns("foobar").unwrap().contains(&"baz".to_string()));
        assert_eq!(
            db.applied_version("foobar").unwrap(),
            Some(Version::new(1, 1, 0))
        );
    }

    #[test]
    fn save_get_update_round_trip() {
        let db = manager();
        let id = db
            .save(
                "foobar",
                &Row::new().with("foo", "L'envie".to_string()).with("bar", 3i64),
            )
            .unwrap();
        assert_eq!(id, 1);

        let row = db
            .get("foobar", &Row::new().with("foo", "L'envie".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(row.get_i64("id"), Some(1));
        assert_eq!(row.get_i64("bar"), Some(3));
        assert!(row.get_i64("timestamp").unwrap() > 0);

        db.save(
            "foobar",
            &Row::new()
                .with("id", 1i64)
                .with("foo", "x".to_string())
                .with("bar", 4i64),
        )
        .unwrap();
        let row = db.get("foobar", &Row::new().with("id", 1i64)).unwrap().unwrap();
        assert_eq!(row.get_str("foo"), Some("x"));
        assert_eq!(row.get_i64("bar"), Some(4));
    }

    #[test]
    fn get_all_count_and_delete_many() {
        let db = manager();
        for i in 0..5i64 {
            db.save(
                "foobar",
                &Row::new().with("foo", format!("n{i}")).with("bar", i),
            )
            .unwrap();
        }
        let req = db.request("foobar").unwrap().and_where("bar", Operator::Gte, 2i64);
        assert_eq!(db.get_all(req.clone()).unwrap().len(), 3);
        assert_eq!(db.count(req.clone()).unwrap(), 3);
        assert_eq!(db.delete_many(req).unwrap(), 3);
        assert_eq!(db.count(db.request("foobar").unwrap()).unwrap(), 2);
    }

    #[test]
    fn get_last_returns_latest_row() {
        let db = manager();
        db.save("foobar", &Row::new().with("bar", 1i64)).unwrap();
        db.save("foobar", &Row::new().with("bar", 2i64)).unwrap();
        let last = db.get_last("foobar").unwrap().unwrap();
        assert_eq!(last.get_i64("bar"), Some(2));
    }

    #[test]
    fn unfiltered_deletes_are_refused() {
        let db = manager();
        db.save("foobar", &Row::new().with("bar", 1i64)).unwrap();
        assert!(matches!(
            db.delete_many(db.request("foobar").unwrap()),
            Err(DbError::InvalidRequest(_))
        ));
        assert!(matches!(
            db.delete_one("foobar", &Row::new().with("foo", Value::Null)),
            Err(DbError::InvalidRequest(_))
        ));
        assert_eq!(db.delete_one("foobar", &Row::new().with("bar", 1i64)).unwrap(), 1);
    }

    #[test]
    fn request_for_foreign_schema_is_invalid() {
        let db = manager();
        let other = Arc::new(TableSchema::new(
            "foobar",
            vec![FieldMeta::new("foo", FieldType::String, Version::new(0, 0, 0))],
        ));
        let err = db.get_all(RequestBuilder::new(other)).unwrap_err();
        assert!(matches!(err, DbError::InvalidRequest(_)));
    }

    #[test]
    fn store_errors_surface_unmodified() {
        let db = manager();
        let req = db
            .request("foobar")
            .unwrap()
            .and_where("missing", Operator::Eq, 1i64);
        assert!(matches!(db.get_all(req), Err(DbError::Database(_))));
    }
}
