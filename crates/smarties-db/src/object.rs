//! Object mapper: typed value objects on top of [`DbManager`] rows.
//!
//! A value object declares its persisted fields once, in a static
//! [`FieldMeta`] table, and converts itself to and from positional values in
//! that declared order. The mapper never caches rows; every read hits the
//! store.

use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::types::Value;

use crate::error::{DbError, Result};
use crate::manager::DbManager;
use crate::request::RequestBuilder;
use crate::types::{FieldMeta, Row, TableSchema, ValueCursor, FIELD_ID, FIELD_TIMESTAMP};

/// A plain typed record mapped 1:1 to a table row.
pub trait DbObject: Sized {
    /// Table the objects live in. Part of the persisted layout: renaming it
    /// orphans existing rows.
    const TABLE: &'static str;

    /// Declared fields, in positional order. `id` and `timestamp` are implicit.
    const FIELDS: &'static [FieldMeta];

    /// Build from declared-field values, read in `FIELDS` order.
    fn from_values(values: &mut ValueCursor<'_>) -> Result<Self>;

    /// Declared-field values, in `FIELDS` order.
    fn to_values(&self) -> Vec<Value>;

    /// Schema consumable by [`DbManager::init_schema`].
    fn schema() -> TableSchema {
        TableSchema::new(Self::TABLE, Self::FIELDS.to_vec())
    }
}

/// A value object as stored: store-assigned `id` and `timestamp`, plus any
/// row properties outside the declared fields (e.g. aggregate aliases).
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: Option<i64>,
    pub timestamp: Option<i64>,
    pub object: T,
    pub extra: Row,
}

impl<T: DbObject> Stored<T> {
    /// A not-yet-saved object; the store assigns `id` and `timestamp`.
    pub fn new(object: T) -> Self {
        Self {
            id: None,
            timestamp: None,
            object,
            extra: Row::new(),
        }
    }

    /// Build from positional values. With `FIELDS.len() + 2` values the first
    /// two are `id` and `timestamp`; with exactly `FIELDS.len()` they are
    /// treated as absent.
    pub fn from_positional(values: Vec<Value>) -> Result<Self> {
        let declared = T::FIELDS.len();
        let (id, timestamp, rest) = if values.len() == declared + 2 {
            let mut it = values.into_iter();
            let id = system_value(FIELD_ID, it.next())?;
            let timestamp = system_value(FIELD_TIMESTAMP, it.next())?;
            (id, timestamp, it.collect())
        } else if values.len() == declared {
            (None, None, values)
        } else {
            return Err(DbError::Conversion {
                field: T::TABLE.to_string(),
                reason: format!(
                    "expected {} or {} values, got {}",
                    declared,
                    declared + 2,
                    values.len()
                ),
            });
        };
        let object = T::from_values(&mut ValueCursor::new(T::FIELDS, rest))?;
        Ok(Self {
            id,
            timestamp,
            object,
            extra: Row::new(),
        })
    }

    /// Cast a stored row: declared columns positionally, the rest verbatim
    /// into `extra`.
    pub fn from_row(row: Row) -> Result<Self> {
        let schema = T::schema();
        let names = schema.field_names();
        let mut positional = vec![Value::Null; names.len()];
        let mut extra = Row::new();
        for (name, value) in row {
            match names.iter().position(|n| *n == name) {
                Some(i) => positional[i] = value,
                None => extra.set(&name, value),
            }
        }
        let mut stored = Self::from_positional(positional)?;
        stored.extra = extra;
        Ok(stored)
    }

    /// Row to write. Null `id`/`timestamp` are left out so the store
    /// assigns them.
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        if let Some(id) = self.id {
            row.set(FIELD_ID, id);
        }
        if let Some(ts) = self.timestamp {
            row.set(FIELD_TIMESTAMP, ts);
        }
        for (meta, value) in T::FIELDS.iter().zip(self.object.to_values()) {
            row.set(meta.name(), value);
        }
        row
    }
}

fn system_value(field: &str, value: Option<Value>) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Integer(i)) => Ok(Some(i)),
        Some(Value::Text(s)) if s.is_empty() => Ok(None),
        Some(Value::Text(s)) => s.trim().parse().map(Some).map_err(|_| DbError::Conversion {
            field: field.to_string(),
            reason: format!("not an integer: {s}"),
        }),
        Some(other) => Err(DbError::Conversion {
            field: field.to_string(),
            reason: format!("unexpected value {other:?}"),
        }),
    }
}

/// Binds a [`DbManager`] to one value-object type.
pub struct DbHelper<T> {
    db: Arc<DbManager>,
    table: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DbHelper<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            table: self.table,
            _marker: PhantomData,
        }
    }
}

impl<T: DbObject> DbHelper<T> {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self {
            db,
            table: T::TABLE,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        self.table
    }

    pub fn db(&self) -> &Arc<DbManager> {
        &self.db
    }

    /// Create or migrate `T`'s table from an explicit old version.
    pub fn init(&self, old_version: &str) -> Result<()> {
        self.db.init_schema(&[T::schema()], old_version)
    }

    /// Create or migrate `T`'s table from the schema ledger.
    pub fn migrate(&self, current_version: &str) -> Result<()> {
        self.db.migrate(&[T::schema()], current_version)
    }

    /// A request builder for `T`'s table.
    pub fn request(&self) -> Result<RequestBuilder> {
        self.db.request(self.table)
    }

    /// Insert a new object. Returns its id.
    pub fn save(&self, object: T) -> Result<i64> {
        self.save_stored(&Stored::new(object))
    }

    /// Upsert: an update by key when `id` is set, an insert otherwise.
    pub fn save_stored(&self, stored: &Stored<T>) -> Result<i64> {
        self.db.save(self.table, &stored.to_row())
    }

    /// First object equal to `filter` on every non-null field.
    pub fn get(&self, filter: &Row) -> Result<Option<Stored<T>>> {
        self.db
            .get(self.table, filter)?
            .map(Stored::from_row)
            .transpose()
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Stored<T>>> {
        self.get(&Row::new().with(FIELD_ID, id))
    }

    pub fn get_all(&self, request: RequestBuilder) -> Result<Vec<Stored<T>>> {
        self.db
            .get_all(request)?
            .into_iter()
            .map(Stored::from_row)
            .collect()
    }

    pub fn get_last(&self) -> Result<Option<Stored<T>>> {
        self.db
            .get_last(self.table)?
            .map(Stored::from_row)
            .transpose()
    }

    pub fn count(&self, request: RequestBuilder) -> Result<i64> {
        self.db.count(request)
    }

    /// Delete rows equal to `stored` on every non-null field.
    pub fn delete(&self, stored: &Stored<T>) -> Result<usize> {
        self.db.delete_one(self.table, &stored.to_row())
    }

    /// Conditional update; see [`DbManager::update_many`].
    pub fn update_many(&self, request: RequestBuilder) -> Result<usize> {
        self.db.update_many(request)
    }

    pub fn delete_many(&self, request: RequestBuilder) -> Result<usize> {
        self.db.delete_many(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Aggregate, Operator};
    use crate::types::{FieldType, Version};

    #[derive(Debug, Clone, PartialEq)]
    struct Sensor {
        name: String,
        value: f64,
        unit: Option<String>,
    }

    impl DbObject for Sensor {
        const TABLE: &'static str = "sensor";
        const FIELDS: &'static [FieldMeta] = &[
            FieldMeta::new("name", FieldType::String, Version::new(0, 0, 0)),
            FieldMeta::new("value", FieldType::Double, Version::new(0, 0, 0)),
            FieldMeta::new("unit", FieldType::String, Version::new(0, 1, 0)),
        ];

        fn from_values(values: &mut ValueCursor<'_>) -> Result<Self> {
            Ok(Self {
                name: values.next()?,
                value: values.next()?,
                unit: values.next()?,
            })
        }

        fn to_values(&self) -> Vec<Value> {
            vec![
                self.name.clone().into(),
                self.value.into(),
                self.unit.clone().into(),
            ]
        }
    }

    fn helper() -> DbHelper<Sensor> {
        let db = Arc::new(DbManager::open_in_memory().unwrap());
        let helper = DbHelper::<Sensor>::new(db);
        helper.init("0.0.0").unwrap();
        helper
    }

    fn kitchen() -> Sensor {
        Sensor {
            name: "kitchen".to_string(),
            value: 21.5,
            unit: Some("C".to_string()),
        }
    }

    #[test]
    fn schema_uses_declared_table() {
        let schema = Sensor::schema();
        assert_eq!(schema.name, "sensor");
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(helper().table(), "sensor");
    }

    #[test]
    fn save_then_get_round_trips() {
        let helper = helper();
        let id = helper.save(kitchen()).unwrap();
        let stored = helper
            .get(&Row::new().with("name", "kitchen".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, Some(id));
        assert!(stored.timestamp.is_some());
        assert_eq!(stored.object, kitchen());
        assert!(stored.extra.is_empty());
    }

    #[test]
    fn save_stored_updates_in_place() {
        let helper = helper();
        let id = helper.save(kitchen()).unwrap();
        let mut stored = helper.get_by_id(id).unwrap().unwrap();
        stored.object.value = 19.0;
        helper.save_stored(&stored).unwrap();

        assert_eq!(helper.count(helper.request().unwrap()).unwrap(), 1);
        let reread = helper.get_by_id(id).unwrap().unwrap();
        assert_eq!(reread.object.value, 19.0);
    }

    #[test]
    fn positional_values_with_and_without_system_fields() {
        let with = Stored::<Sensor>::from_positional(vec![
            Value::Integer(4),
            Value::Integer(1_700_000_000),
            Value::Text("a".into()),
            Value::Real(1.0),
            Value::Null,
        ])
        .unwrap();
        assert_eq!(with.id, Some(4));
        assert_eq!(with.timestamp, Some(1_700_000_000));
        assert_eq!(with.object.name, "a");

        let without = Stored::<Sensor>::from_positional(vec![
            Value::Text("b".into()),
            Value::Real(2.0),
            Value::Text("%".into()),
        ])
        .unwrap();
        assert_eq!(without.id, None);
        assert_eq!(without.timestamp, None);
        assert_eq!(without.object.unit.as_deref(), Some("%"));

        assert!(Stored::<Sensor>::from_positional(vec![Value::Null]).is_err());
    }

    #[test]
    fn extra_row_properties_are_kept() {
        let helper = helper();
        helper.save(kitchen()).unwrap();
        let req = helper
            .request()
            .unwrap()
            .select(&[])
            .select_op(Aggregate::Max, "value", Some("peak"));
        let all = helper.get_all(req).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].extra.get("peak"), Some(&Value::Real(21.5)));
    }

    #[test]
    fn to_row_strips_missing_system_fields() {
        let row = Stored::new(kitchen()).to_row();
        assert!(!row.contains("id"));
        assert!(!row.contains("timestamp"));
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn delete_and_get_last() {
        let helper = helper();
        helper.save(kitchen()).unwrap();
        let mut other = kitchen();
        other.name = "garage".to_string();
        helper.save(other.clone()).unwrap();

        let last = helper.get_last().unwrap().unwrap();
        assert_eq!(last.object, other);
        assert_eq!(helper.delete(&last).unwrap(), 1);

        let req = helper
            .request()
            .unwrap()
            .and_where("name", Operator::Like, "g%".to_string());
        assert!(helper.get_all(req).unwrap().is_empty());
    }
}
