//! Postgres-backed collections.
//!
//! Each collection is a table of `(id TEXT PRIMARY KEY, doc JSONB)`. Filters and
//! sort keys compile to JSONB expressions; values bind as typed parameters.
//!
//! ## Atomic claims
//!
//! `find_and_modify` runs in one transaction:
//! 1. `SELECT ... ORDER BY ... LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. apply the [`Update`] to the selected document
//! 3. `UPDATE ... SET doc = $1 WHERE id = $2`
//!
//! A row locked by a concurrent claimer is skipped, so two engines never
//! receive the same task.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! The [`Collection`] trait is synchronous: calls block on the tokio runtime
//! captured when the store was created. They must not be made from inside an
//! async task.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use super::filter::parse_instant;
use super::{Collection, Document, Filter, SortKey, SortOrder, StoreError, Update};

/// Connection pool plus the runtime used to drive it from engine threads.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresStore {
    /// Connect from inside a tokio runtime; the current runtime is captured.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the table and its indexes if missing, then return a handle to it.
    pub async fn open<D>(&self, table: &str) -> Result<PostgresCollection<D>, StoreError> {
        let collection = PostgresCollection::new(self.pool.clone(), self.handle.clone(), table)?;
        collection.ensure_schema().await?;
        Ok(collection)
    }
}

/// A single table of JSONB documents.
#[derive(Debug)]
pub struct PostgresCollection<D> {
    pool: Arc<PgPool>,
    handle: Handle,
    table: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D> PostgresCollection<D> {
    pub fn new(pool: Arc<PgPool>, handle: Handle, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            handle,
            table: table.to_string(),
            _marker: PhantomData,
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let t = &self.table;
        let statements = [
            format!("CREATE TABLE IF NOT EXISTS {t} (id TEXT PRIMARY KEY, doc JSONB NOT NULL)"),
            format!("CREATE INDEX IF NOT EXISTS {t}_state_idx ON {t} ((doc->>'state'))"),
            format!("CREATE INDEX IF NOT EXISTS {t}_engine_guid_idx ON {t} ((doc->>'engineGuid'))"),
            format!("CREATE INDEX IF NOT EXISTS {t}_plan_id_idx ON {t} ((doc #>> '{{plan,_id}}'))"),
        ];
        for sql in statements {
            sqlx::query(&sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!(table = %self.table, "schema ensured");
        Ok(())
    }
}

impl<D: Document> PostgresCollection<D> {
    async fn insert_async(&self, id: String, doc: Value) -> Result<(), StoreError> {
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", self.table);
        sqlx::query(&sql)
            .bind(id)
            .bind(Json(doc))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn save_async(&self, id: String, doc: Value) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(Json(doc))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    async fn find_async(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<D>, StoreError> {
        let compiled = SelectSql::compile(&self.table, filter, sort, limit, false);
        let rows = compiled
            .bind(sqlx::query(&compiled.sql))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;
        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self, filter, sort, update), fields(table = %self.table), err)]
    async fn find_and_modify_async(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
    ) -> Result<Option<D>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("find_and_modify", e))?;

        let compiled = SelectSql::compile(&self.table, filter, sort, Some(1), true);
        let row = compiled
            .bind(sqlx::query(&compiled.sql))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_and_modify", e))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(|e| map_sqlx_error("find_and_modify", e))?;
        let Json(mut doc): Json<Value> = row.try_get("doc").map_err(|e| map_sqlx_error("find_and_modify", e))?;
        update.apply(&mut doc)?;
        let result: D = serde_json::from_value(doc.clone())?;

        let sql = format!("UPDATE {} SET doc = $1 WHERE id = $2", self.table);
        sqlx::query(&sql)
            .bind(Json(doc))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_and_modify", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("find_and_modify", e))?;
        Ok(Some(result))
    }

    async fn update_one_async(&self, id: &str, update: &Update) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update_one", e))?;

        let sql = format!("SELECT doc FROM {} WHERE id = $1 FOR UPDATE", self.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_one", e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let Json(mut doc): Json<Value> = row.try_get("doc").map_err(|e| map_sqlx_error("update_one", e))?;
        update.apply(&mut doc)?;

        let sql = format!("UPDATE {} SET doc = $1 WHERE id = $2", self.table);
        sqlx::query(&sql)
            .bind(Json(doc))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_one", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("update_one", e))?;
        Ok(true)
    }

    async fn count_async(&self, filter: &Filter) -> Result<usize, StoreError> {
        let mut builder = SqlBuilder::default();
        let condition = builder.filter(filter);
        let sql = format!("SELECT COUNT(*) AS total FROM {} WHERE {condition}", self.table);
        let row = builder
            .bind(sqlx::query(&sql))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("count", e))?;
        Ok(total.max(0) as usize)
    }
}

impl<D: Document> Collection<D> for PostgresCollection<D> {
    fn name(&self) -> &str {
        &self.table
    }

    fn insert(&self, doc: &D) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc)?;
        self.handle.block_on(self.insert_async(doc.document_id(), value))
    }

    fn save(&self, doc: &D) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc)?;
        self.handle.block_on(self.save_async(doc.document_id(), value))
    }

    fn find(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<D>, StoreError> {
        self.handle.block_on(self.find_async(filter, sort, limit))
    }

    fn find_and_modify(&self, filter: &Filter, sort: &[SortKey], update: &Update) -> Result<Option<D>, StoreError> {
        self.handle.block_on(self.find_and_modify_async(filter, sort, update))
    }

    fn update_one(&self, id: &str, update: &Update) -> Result<bool, StoreError> {
        self.handle.block_on(self.update_one_async(id, update))
    }

    fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        self.handle.block_on(self.count_async(filter))
    }
}

fn decode_row<D: Document>(row: &sqlx::postgres::PgRow) -> Result<D, StoreError> {
    let Json(doc): Json<Value> = row.try_get("doc").map_err(|e| map_sqlx_error("decode", e))?;
    Ok(serde_json::from_value(doc)?)
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::Storage(format!("invalid table name: {table:?}")));
    }
    Ok(())
}

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Path(Vec<String>),
    Text(String),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

/// Accumulates positional parameters while rendering SQL fragments.
#[derive(Debug, Default)]
struct SqlBuilder {
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    fn param(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn path(&mut self, path: &str) -> String {
        let p = self.param(SqlParam::Path(path.split('.').map(str::to_string).collect()));
        format!("(doc #> {p}::text[])")
    }

    /// Always renders a non-null boolean expression.
    fn filter(&mut self, filter: &Filter) -> String {
        match filter {
            Filter::All => "TRUE".to_string(),
            Filter::Eq(path, value) => self.equality(path, value),
            Filter::Ne(path, value) => format!("NOT {}", self.equality(path, value)),
            Filter::Lt(path, value) => self.comparison(path, "<", value),
            Filter::Lte(path, value) => self.comparison(path, "<=", value),
            Filter::Gt(path, value) => self.comparison(path, ">", value),
            Filter::Gte(path, value) => self.comparison(path, ">=", value),
            Filter::Exists(path, true) => format!("({} IS NOT NULL)", self.path(path)),
            Filter::Exists(path, false) => format!("({} IS NULL)", self.path(path)),
            Filter::And(filters) if filters.is_empty() => "TRUE".to_string(),
            Filter::Or(filters) if filters.is_empty() => "FALSE".to_string(),
            Filter::And(filters) => self.join(filters, " AND "),
            Filter::Or(filters) => self.join(filters, " OR "),
        }
    }

    fn join(&mut self, filters: &[Filter], op: &str) -> String {
        let parts: Vec<String> = filters.iter().map(|f| self.filter(f)).collect();
        format!("({})", parts.join(op))
    }

    fn equality(&mut self, path: &str, value: &Value) -> String {
        if value.is_null() {
            let x = self.path(path);
            return format!("(COALESCE(jsonb_typeof({x}), 'null') = 'null')");
        }
        match self.typed_operands(path, value) {
            Some((lhs, rhs)) => format!("COALESCE({lhs} = {rhs}, FALSE)"),
            None => {
                let x = self.path(path);
                let v = self.param(SqlParam::Json(value.clone()));
                format!("COALESCE({x} = {v}::jsonb, FALSE)")
            }
        }
    }

    fn comparison(&mut self, path: &str, op: &str, value: &Value) -> String {
        if value.is_null() {
            return match op {
                "<=" | ">=" => self.equality(path, value),
                _ => "FALSE".to_string(),
            };
        }
        match self.typed_operands(path, value) {
            Some((lhs, rhs)) => format!("COALESCE({lhs} {op} {rhs}, FALSE)"),
            None => "FALSE".to_string(),
        }
    }

    /// Left and right operands compared in the value's native type. The left
    /// side is null whenever the stored value has a different type.
    fn typed_operands(&mut self, path: &str, value: &Value) -> Option<(String, String)> {
        match value {
            Value::String(s) => match parse_instant(s) {
                Some(instant) => {
                    let lhs = self.date_expr(path);
                    let rhs = self.param(SqlParam::Timestamp(instant));
                    Some((lhs, format!("{rhs}::timestamptz")))
                }
                None => {
                    let x = self.path(path);
                    let rhs = self.param(SqlParam::Text(s.clone()));
                    Some((
                        format!("(CASE WHEN jsonb_typeof({x}) = 'string' THEN {x} #>> '{{}}' END) COLLATE \"C\""),
                        format!("{rhs}::text"),
                    ))
                }
            },
            Value::Number(n) => {
                let x = self.path(path);
                let rhs = self.param(SqlParam::Float(n.as_f64()?));
                Some((
                    format!("(CASE WHEN jsonb_typeof({x}) = 'number' THEN ({x} #>> '{{}}')::float8 END)"),
                    format!("{rhs}::float8"),
                ))
            }
            Value::Bool(b) => {
                let x = self.path(path);
                let rhs = self.param(SqlParam::Bool(*b));
                Some((
                    format!("(CASE WHEN jsonb_typeof({x}) = 'boolean' THEN ({x} #>> '{{}}')::boolean END)"),
                    format!("{rhs}::boolean"),
                ))
            }
            _ => None,
        }
    }

    /// The stored value as `timestamptz` when it is an RFC3339 string, else null.
    fn date_expr(&mut self, path: &str) -> String {
        let x = self.path(path);
        format!(
            "(CASE WHEN jsonb_typeof({x}) = 'string' AND ({x} #>> '{{}}') ~ '^\\d{{4}}-\\d{{2}}-\\d{{2}}T\\d{{2}}:\\d{{2}}:\\d{{2}}' \
             THEN ({x} #>> '{{}}')::timestamptz END)"
        )
    }

    fn order_by(&mut self, sort: &[SortKey]) -> String {
        if sort.is_empty() {
            return "id".to_string();
        }
        let mut parts = Vec::with_capacity(sort.len() * 2 + 1);
        for key in sort {
            let direction = match key.order {
                SortOrder::Asc => "ASC NULLS FIRST",
                SortOrder::Desc => "DESC NULLS LAST",
            };
            let date = self.date_expr(&key.path);
            let raw = self.path(&key.path);
            parts.push(format!("{date} {direction}"));
            parts.push(format!("{raw} {direction}"));
        }
        parts.push("id".to_string());
        parts.join(", ")
    }

    fn bind<'q>(&self, mut query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        for param in &self.params {
            query = match param.clone() {
                SqlParam::Path(p) => query.bind(p),
                SqlParam::Text(s) => query.bind(s),
                SqlParam::Float(f) => query.bind(f),
                SqlParam::Bool(b) => query.bind(b),
                SqlParam::Timestamp(t) => query.bind(t),
                SqlParam::Json(v) => query.bind(Json(v)),
            };
        }
        query
    }
}

/// A compiled `SELECT id, doc` with its parameters.
#[derive(Debug)]
struct SelectSql {
    sql: String,
    builder: SqlBuilder,
}

impl SelectSql {
    fn compile(table: &str, filter: &Filter, sort: &[SortKey], limit: Option<usize>, lock: bool) -> Self {
        let mut builder = SqlBuilder::default();
        let condition = builder.filter(filter);
        let order = builder.order_by(sort);
        let mut sql = format!("SELECT id, doc FROM {table} WHERE {condition} ORDER BY {order}");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if lock {
            sql.push_str(" FOR UPDATE SKIP LOCKED");
        }
        Self { sql, builder }
    }

    fn bind<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        self.builder.bind(query)
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {}", operation)),
        other => StoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}
