use std::borrow::Cow;

use rusqlite::types::{FromSql, Value, ValueRef};

use crate::error::{DbError, Result};

/// Surrogate key column, assigned by the store.
pub const FIELD_ID: &str = "id";
/// Row write-time column (Unix seconds), defaulted by the store.
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Semantic type of a persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Double,
    Date,
    DateTime,
    Timestamp,
    String,
    Blob,
}

impl FieldType {
    /// SQLite column type used in `CREATE TABLE` / `ALTER TABLE ... ADD`.
    pub fn column_type(self) -> &'static str {
        match self {
            FieldType::Int => "BIGINT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Date => "DATE",
            FieldType::DateTime => "DATETIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::String => "TEXT",
            FieldType::Blob => "BLOB",
        }
    }

    /// Numbers are passed through unquoted for these types.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Int | FieldType::Float | FieldType::Double | FieldType::Timestamp
        )
    }

    /// Values of these types are quoted and escaped.
    pub fn is_textual(self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime | FieldType::String)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Timestamp => "timestamp",
            FieldType::String => "string",
            FieldType::Blob => "blob",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "double" | "number" => Ok(FieldType::Double),
            "date" => Ok(FieldType::Date),
            "datetime" => Ok(FieldType::DateTime),
            "timestamp" => Ok(FieldType::Timestamp),
            "string" => Ok(FieldType::String),
            "blob" => Ok(FieldType::Blob),
            other => Err(format!("unknown field type: {other}")),
        }
    }
}

/// Semantic version `x.y.z` attached to every declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `x`, `x.y` or `x.y.z`; missing components are zero.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(DbError::InvalidVersion(s.to_string()));
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(parts.iter()) {
            *slot = part
                .parse()
                .map_err(|_| DbError::InvalidVersion(s.to_string()))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }

    /// Collapse to `x * 1_000_000 + y * 1_000 + z`. Migration decisions
    /// compare these numbers, never the components.
    pub fn number(&self) -> u64 {
        self.major as u64 * 1_000_000 + self.minor as u64 * 1_000 + self.patch as u64
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for Version {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

/// Declared name / semantic type / version of one persisted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: Cow<'static, str>,
    pub field_type: FieldType,
    pub version: Version,
}

impl FieldMeta {
    /// Static declaration, usable in `const` field tables.
    pub const fn new(name: &'static str, field_type: FieldType, version: Version) -> Self {
        Self {
            name: Cow::Borrowed(name),
            field_type,
            version,
        }
    }

    /// Runtime declaration from textual metadata (e.g. a plugin manifest).
    pub fn parse(name: &str, field_type: &str, version: &str) -> Result<Self> {
        let parsed_type = field_type
            .parse::<FieldType>()
            .map_err(|_| DbError::UnknownFieldType {
                field: name.to_string(),
                field_type: field_type.to_string(),
            })?;
        Ok(Self {
            name: Cow::Owned(name.to_string()),
            field_type: parsed_type,
            version: Version::parse(version)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

static ID_META: FieldMeta = FieldMeta::new(FIELD_ID, FieldType::Int, Version::new(0, 0, 0));
static TIMESTAMP_META: FieldMeta =
    FieldMeta::new(FIELD_TIMESTAMP, FieldType::Timestamp, Version::new(0, 0, 0));

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A table name plus its declared fields. `id` and `timestamp` are implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldMeta>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldMeta>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Metadata for a field, including the implicit system fields.
    pub fn meta_for(&self, field: &str) -> Option<&FieldMeta> {
        match field {
            FIELD_ID => Some(&ID_META),
            FIELD_TIMESTAMP => Some(&TIMESTAMP_META),
            _ => self.fields.iter().find(|f| f.name() == field),
        }
    }

    /// All column names: `id`, `timestamp`, then declared fields in order.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names = vec![FIELD_ID, FIELD_TIMESTAMP];
        names.extend(self.fields.iter().map(|f| f.name()));
        names
    }

    /// Reject metadata the DDL generator cannot express.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(DbError::InvalidSchema {
                table: self.name.clone(),
                reason: "table name must be a plain identifier".to_string(),
            });
        }
        let mut seen: Vec<&str> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let name = field.name();
            if name.is_empty() || !is_identifier(name) {
                return Err(DbError::NoFieldDetected {
                    table: self.name.clone(),
                });
            }
            if name == FIELD_ID || name == FIELD_TIMESTAMP {
                return Err(DbError::InvalidSchema {
                    table: self.name.clone(),
                    reason: format!("field name '{name}' is reserved"),
                });
            }
            if seen.contains(&name) {
                return Err(DbError::InvalidSchema {
                    table: self.name.clone(),
                    reason: format!("field '{name}' declared twice"),
                });
            }
            seen.push(name);
        }
        Ok(())
    }
}

/// A stored row: values keyed by field name, in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `set`.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Insert or replace; a replaced field keeps its position.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.values.iter_mut().find(|(k, _)| k == field) {
            Some(slot) => slot.1 = value,
            None => self.values.push((field.to_string(), value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        let pos = self.values.iter().position(|(k, _)| k == field)?;
        Some(self.values.remove(pos).1)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.iter().any(|(k, _)| k == field)
    }

    /// Integer value of a field, if present and integral.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text value of a field, if present and textual.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.get(field)? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.set(&k, v);
        }
        row
    }
}

/// True for `NULL` and for the empty string, which the store treats alike.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Text(s) => s.is_empty(),
        _ => false,
    }
}

/// Positional reader over a row's values, in declared field order.
pub struct ValueCursor<'a> {
    fields: &'a [FieldMeta],
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl<'a> ValueCursor<'a> {
    pub fn new(fields: &'a [FieldMeta], values: Vec<Value>) -> Self {
        Self {
            fields,
            values: values.into_iter(),
            index: 0,
        }
    }

    /// Read the next value. An exhausted cursor yields `NULL`.
    pub fn next<T: FromSql>(&mut self) -> Result<T> {
        let field = self
            .fields
            .get(self.index)
            .map(|f| f.name().to_string())
            .unwrap_or_else(|| format!("#{}", self.index));
        self.index += 1;
        let value = self.values.next().unwrap_or(Value::Null);
        T::column_result(ValueRef::from(&value)).map_err(|e| DbError::Conversion {
            field,
            reason: e.to_string(),
        })
    }
}
