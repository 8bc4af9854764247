use super::{Entity, FieldDescriptor, FieldKind, FieldValue};
use crate::cluster::{NamedShardExecutor, ShardExecutor};
use crate::config::ClusterConfig;
use crate::core::{DbError, Result, Row, Value};
use crate::sql::{Dialect, NamedParams};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

pub const ID_COLUMN: &str = "id";
pub const CREATED_COLUMN: &str = "created";
pub const UPDATED_COLUMN: &str = "updated";

/// Column/value pairs joined with `AND` into a where clause. Ordered, so the
/// generated SQL is deterministic.
pub type WhereMap = BTreeMap<String, Value>;

/// Row mapper and SQL builder for one entity type.
///
/// Built once per type and shared as `Arc<EntityMapper<T>>`; it holds no
/// connection and no mutable state. Every statement it runs goes through
/// the executor of the shard the caller picked.
pub struct EntityMapper<T: Entity> {
    type_name: &'static str,
    table_name: String,
    fields: Vec<FieldDescriptor>,
    by_name: HashMap<&'static str, usize>,
    by_upper: HashMap<String, usize>,
    id_index: usize,
    created_index: Option<usize>,
    updated_index: Option<usize>,
    replace_supported: bool,
    ignore_supported: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> std::fmt::Debug for EntityMapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMapper")
            .field("table_name", &self.table_name)
            .field("columns", &self.columns())
            .field("replace_supported", &self.replace_supported)
            .field("ignore_supported", &self.ignore_supported)
            .finish()
    }
}

impl<T: Entity> EntityMapper<T> {
    pub fn new() -> Result<Self> {
        let descriptor = T::entity_descriptor();

        let mut by_name = HashMap::new();
        let mut by_upper = HashMap::new();
        for (index, field) in descriptor.fields.iter().enumerate() {
            if by_name.insert(field.name, index).is_some() {
                return Err(DbError::MappingError(format!(
                    "{} maps column '{}' twice",
                    descriptor.type_name, field.name
                )));
            }
            by_upper.entry(field.name.to_ascii_uppercase()).or_insert(index);
        }

        let id_index = *by_name.get(ID_COLUMN).ok_or_else(|| {
            DbError::MappingError(format!(
                "{} has no '{}' field",
                descriptor.type_name, ID_COLUMN
            ))
        })?;
        if descriptor.fields[id_index].kind != FieldKind::Text {
            return Err(DbError::MappingError(format!(
                "{}.{} must be a string field",
                descriptor.type_name, ID_COLUMN
            )));
        }

        let stamp_index = |column: &str| -> Result<Option<usize>> {
            match by_name.get(column) {
                Some(&index) if descriptor.fields[index].kind == FieldKind::Integer => Ok(Some(index)),
                Some(_) => Err(DbError::MappingError(format!(
                    "{}.{} must be an integer epoch-millisecond field",
                    descriptor.type_name, column
                ))),
                None => Ok(None),
            }
        };
        let created_index = stamp_index(CREATED_COLUMN)?;
        let updated_index = stamp_index(UPDATED_COLUMN)?;

        Ok(Self {
            type_name: descriptor.type_name,
            table_name: descriptor.table_name().to_string(),
            replace_supported: descriptor.replace_supported,
            ignore_supported: descriptor.ignore_supported,
            fields: descriptor.fields,
            by_name,
            by_upper,
            id_index,
            created_index,
            updated_index,
            _entity: PhantomData,
        })
    }

    /// Mapper whose table follows `config.table_names` when the entity type
    /// has an entry there.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let mapper = Self::new()?;
        Ok(match config.table_name_for(mapper.type_name) {
            Some(table) => mapper.with_table_name(table),
            None => mapper,
        })
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_replace_supported(mut self, supported: bool) -> Self {
        self.replace_supported = supported;
        self
    }

    pub fn with_ignore_supported(mut self, supported: bool) -> Self {
        self.ignore_supported = supported;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn is_replace_supported(&self) -> bool {
        self.replace_supported
    }

    pub fn is_ignore_supported(&self) -> bool {
        self.ignore_supported
    }

    /// Mapped columns in declaration order.
    pub fn columns(&self) -> Vec<&'static str> {
        self.fields.iter().map(|field| field.name).collect()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.by_name.contains_key(column)
    }

    /// Field index for a driver-reported column label: exact match first,
    /// then case-insensitive.
    pub fn field_index(&self, label: &str) -> Option<usize> {
        self.by_name
            .get(label)
            .or_else(|| self.by_upper.get(&label.to_ascii_uppercase()))
            .copied()
    }

    fn known_column(&self, column: &str) -> Result<usize> {
        self.field_index(column).ok_or_else(|| {
            DbError::MappingError(format!(
                "table {} has no column '{}'",
                self.table_name, column
            ))
        })
    }

    // ----- row <-> entity -----

    /// Builds an entity from a row. Unknown columns are ignored; mapped
    /// fields missing from the row keep their default.
    pub fn map_row(&self, row: Row) -> Result<T> {
        let columns: Vec<String> = row.columns().to_vec();
        let mut entity = T::default();
        for (label, value) in columns.iter().zip(row.into_values()) {
            if let Some(index) = self.field_index(label) {
                entity
                    .write_field(index, value)
                    .map_err(|err| err.in_field(self.fields[index].name))?;
            }
        }
        Ok(entity)
    }

    pub fn map_rows(&self, rows: Vec<Row>) -> Result<Vec<T>> {
        rows.into_iter().map(|row| self.map_row(row)).collect()
    }

    /// Every mapped field as a named parameter.
    pub fn value_map(&self, entity: &T) -> NamedParams {
        self.fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.name, entity.read_field(index)))
            .collect()
    }

    /// The entity's id, or `None` when it is unset (NULL or empty).
    pub fn object_id(&self, entity: &T) -> Option<String> {
        match entity.read_field(self.id_index) {
            Value::Text(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// Generates a UUID v4 id when the entity has none. Returns the id.
    pub fn assign_id_if_missing(&self, entity: &mut T) -> Result<String> {
        if let Some(id) = self.object_id(entity) {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        entity
            .write_field(self.id_index, Value::Text(id.clone()))
            .map_err(|err| err.in_field(ID_COLUMN))?;
        Ok(id)
    }

    fn stamp(&self, entity: &mut T, index: Option<usize>, now: i64) -> Result<()> {
        if let Some(index) = index {
            entity
                .write_field(index, Value::Integer(now))
                .map_err(|err| err.in_field(self.fields[index].name))?;
        }
        Ok(())
    }

    // ----- statements -----

    fn column_list(&self, dialect: Dialect) -> String {
        let quoted: Vec<String> = self
            .fields
            .iter()
            .map(|field| dialect.quote_ident(field.name))
            .collect();
        quoted.join(",")
    }

    fn named_values(&self) -> String {
        let names: Vec<String> = self.fields.iter().map(|f| format!(":{}", f.name)).collect();
        format!("({})", names.join(","))
    }

    /// `insert into`, or the dialect's ignore-on-conflict form when `ignore`
    /// is set.
    pub fn insert_stmt(&self, dialect: Dialect, ignore: bool) -> String {
        let columns = self.column_list(dialect);
        let values = self.named_values();
        match (ignore, dialect) {
            (false, _) => format!("insert into {} ({}) values {}", self.table_name, columns, values),
            (true, Dialect::Sqlite) => format!(
                "insert or ignore into {} ({}) values {}",
                self.table_name, columns, values
            ),
            (true, Dialect::Postgres) => format!(
                "insert into {} ({}) values {} on conflict ({}) do nothing",
                self.table_name,
                columns,
                values,
                dialect.quote_ident(ID_COLUMN)
            ),
            (true, _) => format!(
                "insert ignore into {} ({}) values {}",
                self.table_name, columns, values
            ),
        }
    }

    /// Native upsert statement; a plain insert when replace is not supported.
    pub fn replace_stmt(&self, dialect: Dialect) -> String {
        if !self.replace_supported {
            return self.insert_stmt(dialect, false);
        }
        let columns = self.column_list(dialect);
        let values = self.named_values();
        match dialect {
            Dialect::Sqlite => format!(
                "insert or replace into {} ({}) values {}",
                self.table_name, columns, values
            ),
            Dialect::Postgres => {
                let assignments: Vec<String> = self
                    .fields
                    .iter()
                    .filter(|field| field.name != ID_COLUMN)
                    .map(|field| format!("{0}=excluded.{0}", dialect.quote_ident(field.name)))
                    .collect();
                format!(
                    "insert into {} ({}) values {} on conflict ({}) do update set {}",
                    self.table_name,
                    columns,
                    values,
                    dialect.quote_ident(ID_COLUMN),
                    assignments.join(",")
                )
            }
            _ => format!("replace into {} ({}) values {}", self.table_name, columns, values),
        }
    }

    /// Predicates for `where_map` keyed by the mapped column names, with
    /// their values added to `params`.
    fn where_params(
        &self,
        dialect: Dialect,
        where_map: &WhereMap,
        params: &mut NamedParams,
    ) -> Result<String> {
        let mut predicates = Vec::with_capacity(where_map.len());
        for (column, value) in where_map {
            let name = self.fields[self.known_column(column)?].name;
            predicates.push(format!("{}=:{}", dialect.quote_ident(name), name));
            params.insert(name, value.clone());
        }
        Ok(where_sql(&predicates))
    }

    fn select_list(&self, dialect: Dialect, columns: &[&str]) -> Result<String> {
        if columns.is_empty() || columns == ["*"] {
            return Ok("*".to_string());
        }
        let mut quoted = Vec::with_capacity(columns.len());
        for column in columns {
            let name = self.fields[self.known_column(column)?].name;
            quoted.push(dialect.quote_ident(name));
        }
        Ok(quoted.join(","))
    }

    /// `create table if not exists` for the mapped columns, typed for
    /// `dialect`.
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let definitions: Vec<String> = self
            .fields
            .iter()
            .map(|field| {
                let column = dialect.quote_ident(field.name);
                if field.name == ID_COLUMN {
                    return format!("{} VARCHAR(64) PRIMARY KEY", column);
                }
                let sql_type = column_type(field.kind, dialect);
                if field.nullable {
                    format!("{} {}", column, sql_type)
                } else {
                    format!("{} {} NOT NULL", column, sql_type)
                }
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table_name,
            definitions.join(", ")
        )
    }

    // ----- writes -----

    pub async fn insert(&self, exec: &NamedShardExecutor, entity: &mut T) -> Result<u64> {
        let sql = self.insert_stmt(exec.dialect(), false);
        self.insert_or_replace(exec, &sql, entity).await
    }

    /// Insert that silently skips an existing id. Requires ignore support.
    pub async fn insert_ignore(&self, exec: &NamedShardExecutor, entity: &mut T) -> Result<u64> {
        if !self.ignore_supported {
            return Err(DbError::ConfigError(format!(
                "ignore-insert is not enabled for {}",
                self.table_name
            )));
        }
        let sql = self.insert_stmt(exec.dialect(), true);
        self.insert_or_replace(exec, &sql, entity).await
    }

    pub async fn replace(&self, exec: &NamedShardExecutor, entity: &mut T) -> Result<u64> {
        let sql = self.replace_stmt(exec.dialect());
        self.insert_or_replace(exec, &sql, entity).await
    }

    /// Runs an insert-shaped statement: assigns a missing id and stamps
    /// `created`/`updated` with the current time, overwriting both.
    pub async fn insert_or_replace(
        &self,
        exec: &NamedShardExecutor,
        sql: &str,
        entity: &mut T,
    ) -> Result<u64> {
        self.assign_id_if_missing(entity)?;
        let now = Utc::now().timestamp_millis();
        self.stamp(entity, self.created_index, now)?;
        self.stamp(entity, self.updated_index, now)?;

        exec.update(sql, &self.value_map(entity)).await
    }

    /// Updates `update_columns` (plus `updated` when mapped) from the entity.
    /// Rows are matched on `where_columns`, or on the id when that is empty.
    pub async fn update(
        &self,
        exec: &NamedShardExecutor,
        entity: &mut T,
        update_columns: &[&str],
        where_columns: &[&str],
    ) -> Result<u64> {
        let dialect = exec.dialect();
        let where_columns: &[&str] = if where_columns.is_empty() {
            &[ID_COLUMN]
        } else {
            where_columns
        };

        let mut assignments = Vec::new();
        let mut params = NamedParams::new();
        if let Some(index) = self.updated_index {
            self.stamp(entity, Some(index), Utc::now().timestamp_millis())?;
            assignments.push(format!(
                "{}=:{}",
                dialect.quote_ident(UPDATED_COLUMN),
                UPDATED_COLUMN
            ));
            params.insert(UPDATED_COLUMN, entity.read_field(index));
        }
        for column in update_columns {
            let index = self.known_column(column)?;
            let name = self.fields[index].name;
            if name == UPDATED_COLUMN && self.updated_index.is_some() {
                continue;
            }
            assignments.push(format!("{}=:{}", dialect.quote_ident(name), name));
            params.insert(name, entity.read_field(index));
        }
        if assignments.is_empty() {
            return Err(DbError::MappingError(format!(
                "update on {} names no columns",
                self.table_name
            )));
        }

        let mut predicates = Vec::with_capacity(where_columns.len());
        for column in where_columns {
            let index = self.known_column(column)?;
            let name = self.fields[index].name;
            predicates.push(format!("{}=:{}", dialect.quote_ident(name), name));
            params.insert(name, entity.read_field(index));
        }

        let sql = format!(
            "update {} set {}{}",
            self.table_name,
            assignments.join(","),
            where_sql(&predicates)
        );
        exec.update(&sql, &params).await
    }

    /// Updates every mapped column except `id` and `created`, matched on id.
    pub async fn update_entity(&self, exec: &NamedShardExecutor, entity: &mut T) -> Result<u64> {
        let columns: Vec<&str> = self
            .fields
            .iter()
            .map(|field| field.name)
            .filter(|name| ![ID_COLUMN, CREATED_COLUMN, UPDATED_COLUMN].contains(name))
            .collect();
        self.update(exec, entity, &columns, &[]).await
    }

    /// Updates explicit values. Set parameters are bound as `:u<column>` so
    /// the same column may appear on both sides.
    ///
    /// An empty `where_map` updates every row of the table.
    pub async fn update_values(
        &self,
        exec: &NamedShardExecutor,
        values: &WhereMap,
        where_map: &WhereMap,
    ) -> Result<u64> {
        let dialect = exec.dialect();
        let mut assignments = Vec::new();
        let mut params = NamedParams::new();

        let sets_updated = values
            .keys()
            .any(|column| self.field_index(column) == self.updated_index);
        if self.updated_index.is_some() && !sets_updated {
            assignments.push(format!(
                "{}=:u{}",
                dialect.quote_ident(UPDATED_COLUMN),
                UPDATED_COLUMN
            ));
            params.insert(
                format!("u{}", UPDATED_COLUMN),
                Utc::now().timestamp_millis(),
            );
        }
        for (column, value) in values {
            let name = self.fields[self.known_column(column)?].name;
            assignments.push(format!("{}=:u{}", dialect.quote_ident(name), name));
            params.insert(format!("u{}", name), value.clone());
        }
        if assignments.is_empty() {
            return Err(DbError::MappingError(format!(
                "update on {} names no columns",
                self.table_name
            )));
        }

        let where_clause = self.where_params(dialect, where_map, &mut params)?;
        let sql = format!(
            "update {} set {}{}",
            self.table_name,
            assignments.join(","),
            where_clause
        );
        exec.update(&sql, &params).await
    }

    /// Deletes rows matching every pair in `where_map`.
    ///
    /// **Dangerous:** an empty map deletes every row of the table.
    pub async fn delete(&self, exec: &NamedShardExecutor, where_map: &WhereMap) -> Result<u64> {
        let mut params = NamedParams::new();
        let where_clause = self.where_params(exec.dialect(), where_map, &mut params)?;
        let sql = format!("delete from {}{}", self.table_name, where_clause);
        exec.update(&sql, &params).await
    }

    // ----- reads -----

    /// `select <columns> from <table> where c1=:c1 and ...`; an empty
    /// `columns` selects `*`.
    pub async fn query(
        &self,
        exec: &NamedShardExecutor,
        where_map: &WhereMap,
        columns: &[&str],
    ) -> Result<Vec<T>> {
        let dialect = exec.dialect();
        let mut params = NamedParams::new();
        let where_clause = self.where_params(dialect, where_map, &mut params)?;
        let sql = format!(
            "select {} from {}{}",
            self.select_list(dialect, columns)?,
            self.table_name,
            where_clause
        );
        self.map_rows(exec.query(&sql, &params).await?)
    }

    /// At most one match; more than one is an `AmbiguousResult`.
    pub async fn unique_result(
        &self,
        exec: &NamedShardExecutor,
        where_map: &WhereMap,
        columns: &[&str],
    ) -> Result<Option<T>> {
        let found = self.query(exec, where_map, columns).await?;
        single(found, || format!("{} where {:?}", self.table_name, where_map))
    }

    pub async fn get_by_id(&self, exec: &NamedShardExecutor, id: &str) -> Result<Option<T>> {
        self.unique_result(exec, &id_predicate(id), &[]).await
    }

    pub async fn query_by_sql(
        &self,
        exec: &NamedShardExecutor,
        sql: &str,
        params: &NamedParams,
    ) -> Result<Vec<T>> {
        self.map_rows(exec.query(sql, params).await?)
    }

    pub async fn query_by_sql_positional(
        &self,
        exec: &ShardExecutor,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<T>> {
        self.map_rows(exec.query(sql, args).await?)
    }

    pub async fn query_unique_by_sql(
        &self,
        exec: &NamedShardExecutor,
        sql: &str,
        params: &NamedParams,
    ) -> Result<Option<T>> {
        let found = self.query_by_sql(exec, sql, params).await?;
        single(found, || sql.to_string())
    }

    /// One column of every matching row, converted to `C`.
    pub async fn query_column<C: FieldValue>(
        &self,
        exec: &NamedShardExecutor,
        column: &str,
        where_map: &WhereMap,
    ) -> Result<Vec<C>> {
        let dialect = exec.dialect();
        let name = self.fields[self.known_column(column)?].name;
        let mut params = NamedParams::new();
        let where_clause = self.where_params(dialect, where_map, &mut params)?;
        let sql = format!(
            "select {} from {}{}",
            dialect.quote_ident(name),
            self.table_name,
            where_clause
        );
        exec.query_for_list::<C>(&sql, &params)
            .await
            .map_err(|err| err.in_field(name))
    }
}

/// `id = <id>`.
pub(crate) fn id_predicate(id: &str) -> WhereMap {
    let mut where_map = WhereMap::new();
    where_map.insert(ID_COLUMN.to_string(), Value::from(id));
    where_map
}

fn where_sql(predicates: &[String]) -> String {
    if predicates.is_empty() {
        String::new()
    } else {
        format!(" where {}", predicates.join(" and "))
    }
}

/// SQLite has no boolean or double storage class the `Any` driver can decode
/// from a declared column type, so those map to `INTEGER` and `REAL` there.
fn column_type(kind: FieldKind, dialect: Dialect) -> &'static str {
    match (kind, dialect) {
        (FieldKind::Text, _) => "TEXT",
        (FieldKind::Integer, _) => "BIGINT",
        (FieldKind::Float, Dialect::Sqlite) => "REAL",
        (FieldKind::Float, _) => "DOUBLE PRECISION",
        (FieldKind::Boolean, Dialect::Sqlite) => "INTEGER",
        (FieldKind::Boolean, _) => "BOOLEAN",
        (FieldKind::Timestamp | FieldKind::Date | FieldKind::Enum, _) => "VARCHAR(64)",
    }
}

fn single<T>(mut found: Vec<T>, describe: impl FnOnce() -> String) -> Result<Option<T>> {
    if found.len() > 1 {
        return Err(DbError::AmbiguousResult(describe()));
    }
    Ok(found.pop())
}
