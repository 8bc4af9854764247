use crate::connection::pool::ShardPool;
use crate::core::{DbError, Result, Row, Value};
use crate::orm::FieldValue;
use crate::sql::{Dialect, NamedParams};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Column as _, Row as _};
use std::sync::Arc;

/// Receives rows one at a time from [`ShardExecutor::for_each_row`].
///
/// Any `FnMut(Row) -> Result<()>` closure is a handler; implement the trait
/// directly when handling a row needs to await.
#[async_trait]
pub trait RowHandler: Send {
    async fn handle(&mut self, row: Row) -> Result<()>;
}

#[async_trait]
impl<F> RowHandler for F
where
    F: FnMut(Row) -> Result<()> + Send,
{
    async fn handle(&mut self, row: Row) -> Result<()> {
        self(row)
    }
}

/// Statement executor for one shard using positional `?` parameters.
#[derive(Clone)]
pub struct ShardExecutor {
    shard_id: u32,
    pool: Arc<ShardPool>,
    dialect: Dialect,
}

impl ShardExecutor {
    pub(crate) fn new(shard_id: u32, pool: Arc<ShardPool>) -> Self {
        let dialect = pool.config().dialect();
        Self {
            shard_id,
            pool,
            dialect,
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        let (sql, args) = self.dialect.bind_positional(sql, args)?;
        fetch_rows(&self.pool, &sql, &args).await
    }

    pub async fn query_map<T, F>(&self, sql: &str, args: &[Value], f: F) -> Result<Vec<T>>
    where
        F: FnMut(Row) -> Result<T>,
    {
        self.query(sql, args).await?.into_iter().map(f).collect()
    }

    /// Reads the first column of every row as `C`.
    pub async fn query_for_list<C: FieldValue>(&self, sql: &str, args: &[Value]) -> Result<Vec<C>> {
        first_column(self.query(sql, args).await?)
    }

    /// Streams rows into `handler` without buffering the result set.
    /// Returns the number of rows delivered.
    pub async fn for_each_row<H>(&self, sql: &str, args: &[Value], handler: &mut H) -> Result<u64>
    where
        H: RowHandler + ?Sized,
    {
        let (sql, args) = self.dialect.bind_positional(sql, args)?;
        stream_rows(&self.pool, &sql, &args, handler).await
    }

    /// Runs a data-modifying statement, returning the affected row count.
    pub async fn update(&self, sql: &str, args: &[Value]) -> Result<u64> {
        let (sql, args) = self.dialect.bind_positional(sql, args)?;
        execute_statement(&self.pool, &sql, &args).await
    }

    /// Runs a statement without parameters (DDL and the like).
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        execute_statement(&self.pool, sql, &[]).await
    }
}

/// Statement executor for one shard using `:name` parameters.
///
/// List parameters are expanded in place, so `id in (:ids)` works with any
/// number of ids.
#[derive(Clone)]
pub struct NamedShardExecutor {
    inner: ShardExecutor,
}

impl NamedShardExecutor {
    pub(crate) fn new(inner: ShardExecutor) -> Self {
        Self { inner }
    }

    pub fn shard_id(&self) -> u32 {
        self.inner.shard_id
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    pub fn positional(&self) -> &ShardExecutor {
        &self.inner
    }

    pub async fn query(&self, sql: &str, params: &NamedParams) -> Result<Vec<Row>> {
        let (sql, args) = self.inner.dialect.expand_named(sql, params)?;
        fetch_rows(&self.inner.pool, &sql, &args).await
    }

    pub async fn query_map<T, F>(&self, sql: &str, params: &NamedParams, f: F) -> Result<Vec<T>>
    where
        F: FnMut(Row) -> Result<T>,
    {
        self.query(sql, params).await?.into_iter().map(f).collect()
    }

    pub async fn query_for_list<C: FieldValue>(
        &self,
        sql: &str,
        params: &NamedParams,
    ) -> Result<Vec<C>> {
        first_column(self.query(sql, params).await?)
    }

    pub async fn for_each_row<H>(&self, sql: &str, params: &NamedParams, handler: &mut H) -> Result<u64>
    where
        H: RowHandler + ?Sized,
    {
        let (sql, args) = self.inner.dialect.expand_named(sql, params)?;
        stream_rows(&self.inner.pool, &sql, &args, handler).await
    }

    pub async fn update(&self, sql: &str, params: &NamedParams) -> Result<u64> {
        let (sql, args) = self.inner.dialect.expand_named(sql, params)?;
        execute_statement(&self.inner.pool, &sql, &args).await
    }

    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.inner.execute(sql).await
    }
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Builds a non-persistent statement; nothing is cached server-side.
///
/// NULL arguments are normally inlined by the dialect before binding and
/// only reach this point alongside native `$n` markers.
fn prepare<'q>(sql: &'q str, args: &[Value]) -> AnyQuery<'q> {
    args.iter()
        .fold(sqlx::query(sql).persistent(false), |query, value| match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Integer(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Boolean(b) => query.bind(*b),
        })
}

async fn fetch_rows(pool: &ShardPool, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
    let mut guard = pool.get_connection().await?;
    let conn = guard.connection()?;
    let rows = prepare(sql, args).fetch_all(&mut *conn).await?;

    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns = column_labels(first);
    rows.iter().map(|row| decode_row(row, &columns)).collect()
}

async fn stream_rows<H>(pool: &ShardPool, sql: &str, args: &[Value], handler: &mut H) -> Result<u64>
where
    H: RowHandler + ?Sized,
{
    let mut guard = pool.get_connection().await?;
    let conn = guard.connection()?;
    let mut rows = prepare(sql, args).fetch(&mut *conn);

    let mut columns: Option<Arc<[String]>> = None;
    let mut delivered = 0u64;
    while let Some(row) = rows.try_next().await? {
        let labels = columns.get_or_insert_with(|| column_labels(&row));
        handler.handle(decode_row(&row, labels)?).await?;
        delivered += 1;
    }
    Ok(delivered)
}

async fn execute_statement(pool: &ShardPool, sql: &str, args: &[Value]) -> Result<u64> {
    let mut guard = pool.get_connection().await?;
    let conn = guard.connection()?;
    let done = prepare(sql, args).execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

fn first_column<C: FieldValue>(rows: Vec<Row>) -> Result<Vec<C>> {
    rows.into_iter()
        .map(|row| {
            let value = row.into_values().into_iter().next().unwrap_or(Value::Null);
            C::from_value(value)
        })
        .collect()
}

fn column_labels(row: &AnyRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect()
}

fn decode_row(row: &AnyRow, columns: &Arc<[String]>) -> Result<Row> {
    let values = (0..columns.len())
        .map(|index| decode_value(row, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Decodes one column by trying the scalar types the `Any` driver can
/// produce. The type check on each attempt rejects incompatible columns.
fn decode_value(row: &AnyRow, index: usize) -> Result<Value> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map_or(Value::Null, Value::Integer));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value.map_or(Value::Null, Value::Float));
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return Ok(value.map_or(Value::Null, Value::Boolean));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value.map_or(Value::Null, Value::Text));
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Ok(value.map_or(Value::Null, |bytes| {
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }));
    }

    let label = row
        .columns()
        .get(index)
        .map(|column| column.name().to_string())
        .unwrap_or_default();
    Err(DbError::MappingError(format!(
        "column '{}' has a type that cannot be decoded",
        label
    )))
}
