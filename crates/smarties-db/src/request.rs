//! SQL compiler.
//!
//! A [`RequestBuilder`] accumulates projection, mutation, filter, grouping,
//! ordering and paging calls in any order; [`RequestBuilder::request`] then
//! assembles them in a fixed clause order:
//! SELECT → INSERT → UPDATE → DELETE → WHERE → GROUP BY → ORDER BY → LIMIT.
//!
//! Values are never spliced into the SQL text. Each one is encapsulated
//! according to its field's semantic type and bound as a positional `?N`
//! parameter. [`Statement::expanded`] renders the literal form for logs.
//!
//! The builder does not check that a statement is complete: an
//! `insert`/`update` whose `values` count differs from its field count is
//! left out of the output.

use std::sync::Arc;

use rusqlite::types::Value;

use crate::types::{
    is_blank, is_identifier, FieldMeta, FieldType, Row, TableSchema, FIELD_ID, FIELD_TIMESTAMP,
};

/// SQL expression used when an update does not carry its own timestamp.
const NOW_EXPR: &str = "CAST(strftime('%s','now') AS INTEGER)";

/// Comparison operators accepted by [`RequestBuilder::and_where`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    Like,
    NotLike,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl Aggregate {
    pub fn as_sql(self) -> &'static str {
        match self {
            Aggregate::Avg => "AVG",
            Aggregate::Sum => "SUM",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Count => "COUNT",
        }
    }
}

/// A compiled statement: parameterized SQL plus its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    expanded: String,
}

impl Statement {
    /// The statement with every parameter replaced by its literal form.
    pub fn expanded(&self) -> &str {
        &self.expanded
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expanded)
    }
}

#[derive(Debug, Clone)]
struct WhereClause {
    field: String,
    op: Operator,
    value: Value,
    field_type: Option<FieldType>,
}

/// Builder for one statement against one table.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    schema: Arc<TableSchema>,
    select_list: Vec<String>,
    select_requested: bool,
    distinct: bool,
    insert_list: Vec<String>,
    update_list: Vec<String>,
    values_list: Vec<Value>,
    where_list: Vec<WhereClause>,
    group_list: Vec<String>,
    order_list: Vec<String>,
    default_insert: bool,
    delete: bool,
    limit: Option<(u64, u64)>,
}

impl RequestBuilder {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            select_list: Vec::new(),
            select_requested: false,
            distinct: false,
            insert_list: Vec::new(),
            update_list: Vec::new(),
            values_list: Vec::new(),
            where_list: Vec::new(),
            group_list: Vec::new(),
            order_list: Vec::new(),
            default_insert: false,
            delete: false,
            limit: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// True when at least one `where` clause was added.
    pub fn has_filters(&self) -> bool {
        !self.where_list.is_empty()
    }

    /// True when an update with a matching value count is pending.
    pub fn is_update(&self) -> bool {
        !self.update_list.is_empty() && self.update_list.len() == self.values_list.len()
    }

    fn is_known(&self, field: &str) -> bool {
        self.schema.meta_for(field).is_some()
    }

    fn field_type(&self, field: &str) -> Option<FieldType> {
        self.schema.meta_for(field).map(|m| m.field_type)
    }

    fn declared_fields(&self) -> Vec<String> {
        self.schema.fields.iter().map(|f| f.name().to_string()).collect()
    }

    /// Projection. An empty list selects every column; undeclared fields
    /// are dropped.
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select_requested = true;
        if fields.is_empty() {
            self.select_list.push("*".to_string());
        } else {
            for field in fields {
                if self.is_known(field) {
                    self.select_list.push(field.to_string());
                }
            }
        }
        self
    }

    /// Aggregated projection: `AGG(field) AS alias`. The alias defaults to
    /// the field name.
    pub fn select_op(mut self, aggregate: Aggregate, field: &str, alias: Option<&str>) -> Self {
        self.select_requested = true;
        let alias = alias.unwrap_or(field);
        if self.is_known(field) && is_identifier(alias) {
            self.select_list
                .push(format!("{}({}) AS {}", aggregate.as_sql(), field, alias));
        }
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Insert columns; pair with [`values`](Self::values). An empty list
    /// means every declared field.
    pub fn insert(mut self, fields: &[&str]) -> Self {
        if fields.is_empty() {
            self.insert_list = self.declared_fields();
        } else {
            for field in fields {
                if self.is_known(field) {
                    self.insert_list.push(field.to_string());
                }
            }
        }
        self
    }

    /// Update columns; pair with [`values`](Self::values). A value given for
    /// `id` becomes the key filter instead of an assignment.
    pub fn update(mut self, fields: &[&str]) -> Self {
        if fields.is_empty() {
            self.update_list = self.declared_fields();
        } else {
            for field in fields {
                if self.is_known(field) {
                    self.update_list.push(field.to_string());
                }
            }
        }
        self
    }

    /// Update-by-key when `id` is among the fields, insert otherwise. An
    /// empty list means `id` plus every declared field.
    pub fn upsert(self, fields: &[&str]) -> Self {
        let owned: Vec<String> = if fields.is_empty() {
            let mut all = vec![FIELD_ID.to_string()];
            all.extend(self.declared_fields());
            all
        } else {
            fields.iter().map(|f| f.to_string()).collect()
        };
        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        if refs.contains(&FIELD_ID) {
            self.update(&refs)
        } else {
            self.insert(&refs)
        }
    }

    pub fn remove(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Values for the pending insert/update, in field order.
    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.values_list.extend(values.into_iter().map(Into::into));
        self
    }

    /// Add a filter. Clauses are ANDed after a `1=1` base.
    pub fn and_where(mut self, field: &str, op: Operator, value: impl Into<Value>) -> Self {
        let field_type = self.field_type(field);
        let field = if field_type.is_some() {
            field.to_string()
        } else {
            quote_identifier(field)
        };
        self.where_list.push(WhereClause {
            field,
            op,
            value: value.into(),
            field_type,
        });
        self
    }

    pub fn group(mut self, fields: &[&str]) -> Self {
        for field in fields {
            if self.is_known(field) {
                self.group_list.push(field.to_string());
            }
        }
        self
    }

    pub fn group_op(mut self, aggregate: Aggregate, field: &str) -> Self {
        if self.is_known(field) {
            self.group_list
                .push(format!("{}({})", aggregate.as_sql(), field));
        }
        self
    }

    pub fn order(mut self, order: Order, field: &str) -> Self {
        if self.is_known(field) {
            self.order_list.push(format!("{} {}", field, order.as_sql()));
        }
        self
    }

    /// Rows `start .. start + length`.
    pub fn lim(mut self, start: u64, length: u64) -> Self {
        self.limit = Some((start, length));
        self
    }

    /// The first `length` rows.
    pub fn first(self, length: u64) -> Self {
        self.lim(0, length)
    }

    /// Upsert every key of `row` with its value. Blank `id`/`timestamp`
    /// are left to the store, so a row with a null `id` is inserted.
    pub fn save(mut self, row: &Row) -> Self {
        let (fields, values): (Vec<&str>, Vec<Value>) = row
            .iter()
            .filter(|(f, v)| !(is_system_field(f) && is_blank(v)))
            .map(|(f, v)| (f, v.clone()))
            .unzip();
        if fields.is_empty() {
            self.default_insert = true;
            return self;
        }
        self.upsert(&fields).values(values)
    }

    /// Select rows equal to `row` on every non-null field.
    pub fn get(self, row: &Row) -> Self {
        self.equal_to(row).select(&[])
    }

    /// Delete rows equal to `row` on every non-null field.
    pub fn del(self, row: &Row) -> Self {
        self.equal_to(row).remove()
    }

    fn equal_to(mut self, row: &Row) -> Self {
        for (field, value) in row.iter() {
            if !is_blank(value) {
                self = self.and_where(field, Operator::Eq, value.clone());
            }
        }
        self
    }

    /// Turn a filter-only builder into a select of every column unless a
    /// projection was already requested.
    pub fn clean_for_select(mut self) -> Self {
        if !self.select_requested {
            self = self.select(&[]);
        }
        self.insert_list.clear();
        self.update_list.clear();
        self.default_insert = false;
        self.delete = false;
        self
    }

    /// Turn a filter-only builder into a delete.
    pub fn clean_for_delete(mut self) -> Self {
        self.delete = true;
        self.select_list.clear();
        self.select_requested = false;
        self.insert_list.clear();
        self.update_list.clear();
        self.default_insert = false;
        self
    }

    /// Assemble the statement.
    pub fn request(&self) -> Statement {
        let table = &self.schema.name;
        let mut out = Emitter::default();
        let mut key_filter: Option<Value> = None;

        if self.select_requested {
            out.raw("SELECT ");
            if self.distinct {
                out.raw("DISTINCT ");
            }
            if self.select_list.is_empty() {
                out.raw("*");
            } else {
                out.raw(&self.select_list.join(","));
            }
            out.raw(&format!(" FROM `{table}`"));
        }

        if !self.insert_list.is_empty() && self.insert_list.len() == self.values_list.len() {
            // The store assigns blank system fields itself.
            let pairs: Vec<(&String, &Value)> = self
                .insert_list
                .iter()
                .zip(self.values_list.iter())
                .filter(|(f, v)| !(is_system_field(f) && is_blank(v)))
                .collect();
            if pairs.is_empty() {
                out.raw(&format!("INSERT INTO `{table}` DEFAULT VALUES"));
            } else {
                let columns: Vec<&str> = pairs.iter().map(|(f, _)| f.as_str()).collect();
                out.raw(&format!("INSERT INTO `{table}` ({}) VALUES (", columns.join(",")));
                for (i, (field, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        out.raw(",");
                    }
                    out.value((*value).clone(), self.field_type(field));
                }
                out.raw(")");
            }
        } else if self.default_insert {
            out.raw(&format!("INSERT INTO `{table}` DEFAULT VALUES"));
        }

        if self.is_update() {
            out.raw(&format!("UPDATE `{table}` SET "));
            let mut first = true;
            let mut timestamp_set = false;
            for (field, value) in self.update_list.iter().zip(self.values_list.iter()) {
                if field == FIELD_ID {
                    key_filter = Some(value.clone());
                    continue;
                }
                if !first {
                    out.raw(",");
                }
                first = false;
                if field == FIELD_TIMESTAMP {
                    timestamp_set = true;
                    if is_blank(value) {
                        out.raw(&format!("{FIELD_TIMESTAMP}={NOW_EXPR}"));
                        continue;
                    }
                }
                out.raw(&format!("{field}="));
                out.value(value.clone(), self.field_type(field));
            }
            if !timestamp_set {
                if !first {
                    out.raw(",");
                }
                out.raw(&format!("{FIELD_TIMESTAMP}={NOW_EXPR}"));
            }
        }

        if self.delete {
            out.raw(&format!("DELETE FROM `{table}`"));
        }

        if !self.where_list.is_empty() || key_filter.is_some() {
            out.raw(" WHERE 1=1");
            for clause in &self.where_list {
                out.raw(&format!(" AND {} {} ", clause.field, clause.op.as_sql()));
                out.value(clause.value.clone(), clause.field_type);
            }
            if let Some(id) = key_filter {
                out.raw(&format!(" AND {FIELD_ID} = "));
                out.value(id, Some(FieldType::Int));
            }
        }

        if !self.group_list.is_empty() {
            out.raw(&format!(" GROUP BY {}", self.group_list.join(",")));
        }

        if !self.order_list.is_empty() {
            out.raw(&format!(" ORDER BY {}", self.order_list.join(",")));
        }

        if let Some((start, length)) = self.limit {
            out.raw(&format!(" LIMIT {start},{length}"));
        }

        out.raw(";");
        out.finish()
    }
}

fn is_system_field(field: &str) -> bool {
    field == FIELD_ID || field == FIELD_TIMESTAMP
}

/// Back-quote an identifier, doubling embedded back-quotes.
fn quote_identifier(field: &str) -> String {
    format!("`{}`", field.replace('`', "``"))
}

/// `CREATE TABLE` for a schema: system columns first, then declared fields.
pub fn create_table_sql(schema: &TableSchema) -> String {
    let mut columns = vec![
        format!("`{FIELD_ID}` INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT"),
        format!("`{FIELD_TIMESTAMP}` INTEGER NOT NULL DEFAULT ({NOW_EXPR})"),
    ];
    columns.extend(schema.fields.iter().map(column_definition));
    format!(
        "CREATE TABLE IF NOT EXISTS `{}` ({});",
        schema.name,
        columns.join(",")
    )
}

/// `ALTER TABLE ... ADD` for one declared field.
pub fn add_column_sql(table: &str, field: &FieldMeta) -> String {
    format!("ALTER TABLE `{table}` ADD {};", column_definition(field))
}

fn column_definition(field: &FieldMeta) -> String {
    format!("`{}` {}", field.name(), field.field_type.column_type())
}

/// Coerce a value to what its field's semantic type stores. Blank values
/// become `NULL`; fields without metadata pass through untouched.
pub fn encapsulate(value: Value, field_type: Option<FieldType>) -> Value {
    let Some(field_type) = field_type else {
        return value;
    };
    if is_blank(&value) {
        return Value::Null;
    }
    if field_type.is_numeric() {
        if let Value::Text(ref s) = value {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Value::Integer(i);
            }
            if let Ok(r) = s.trim().parse::<f64>() {
                return Value::Real(r);
            }
        }
        return value;
    }
    if field_type.is_textual() {
        return match value {
            Value::Integer(i) => Value::Text(i.to_string()),
            Value::Real(r) => Value::Text(r.to_string()),
            other => other,
        };
    }
    value
}

/// Escape quote and control characters for a single-quoted SQL literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\u{1a}' => out.push_str("\\Z"),
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => format!("'{}'", escape_string(s)),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

#[derive(Default)]
struct Emitter {
    sql: String,
    expanded: String,
    params: Vec<Value>,
}

impl Emitter {
    fn raw(&mut self, s: &str) {
        self.sql.push_str(s);
        self.expanded.push_str(s);
    }

    fn value(&mut self, value: Value, field_type: Option<FieldType>) {
        let value = encapsulate(value, field_type);
        self.expanded.push_str(&literal(&value));
        self.params.push(value);
        self.sql.push_str(&format!("?{}", self.params.len()));
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
            expanded: self.expanded,
        }
    }
}
