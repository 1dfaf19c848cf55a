//! `StorageAdapter` over Postgres.
//!
//! SQL is assembled at runtime because target tables are configuration,
//! not compile-time schema. Identifiers are quoted, values always travel
//! as `$n` bind parameters. Row locking uses `pg_advisory_xact_lock` on a
//! hash of `table/canonical-key`, released automatically at transaction
//! end.

use async_trait::async_trait;
use relay_engine::{Attributes, RowKey, StorageAdapter, StorageError};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo, ValueRef};
use std::time::Duration;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Postgres implementation of the storage seam.
#[derive(Clone)]
pub struct PgAdapter {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(3),
        }
    }

    /// How long a transaction waits on a contended advisory lock before
    /// failing with [`StorageError::LockTimeout`].
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[async_trait]
impl StorageAdapter for PgAdapter {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        // Transaction-local, reset at commit or rollback
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        Ok(tx)
    }

    async fn lock(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<(), StorageError> {
        let lock_key = format!("{}/{}", table, key.canonical());
        tracing::debug!(%lock_key, "acquiring advisory lock");
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&lock_key)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<Option<Attributes>, StorageError> {
        let (sql, params) = select_sql(table, key);
        let row = bind_all(sqlx::query(&sql), &params)
            .fetch_optional(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(row.as_ref().map(decode_row))
    }

    async fn create(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        _key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        let (sql, params) = insert_sql(table, row);
        bind_all(sqlx::query(&sql), &params)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        let (sql, params) = update_sql(table, key, row);
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Backend(format!(
                "update matched no row in {table} for {}",
                key.canonical()
            )));
        }
        Ok(())
    }

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<bool, StorageError> {
        let (sql, params) = delete_sql(table, key);
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.commit().await.map_err(classify)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.rollback().await.map_err(classify)
    }
}

// ---------------------------------------------------------------------------
// SQL assembly
// ---------------------------------------------------------------------------

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// WHERE clause over the natural key. NULL key parts compare with
/// `IS NULL` since `= NULL` never matches.
fn key_predicate(key: &RowKey, params: &mut Vec<Value>) -> String {
    let mut clauses = Vec::with_capacity(key.len());
    for (column, value) in key.fields() {
        if value.is_null() {
            clauses.push(format!("{} IS NULL", quote_ident(column)));
        } else {
            params.push(value.clone());
            clauses.push(format!("{} = ${}", quote_ident(column), params.len()));
        }
    }
    clauses.join(" AND ")
}

fn select_sql(table: &str, key: &RowKey) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let predicate = key_predicate(key, &mut params);
    (
        format!("SELECT * FROM {} WHERE {}", quote_ident(table), predicate),
        params,
    )
}

fn insert_sql(table: &str, row: &Attributes) -> (String, Vec<Value>) {
    let mut columns = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (column, value) in row {
        params.push(value.clone());
        columns.push(quote_ident(column));
        placeholders.push(format!("${}", params.len()));
    }
    (
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        ),
        params,
    )
}

fn update_sql(table: &str, key: &RowKey, row: &Attributes) -> (String, Vec<Value>) {
    let mut params = Vec::with_capacity(row.len() + key.len());
    let mut assignments = Vec::with_capacity(row.len());
    for (column, value) in row {
        params.push(value.clone());
        assignments.push(format!("{} = ${}", quote_ident(column), params.len()));
    }
    let predicate = key_predicate(key, &mut params);
    (
        format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            predicate
        ),
        params,
    )
}

fn delete_sql(table: &str, key: &RowKey) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let predicate = key_predicate(key, &mut params);
    (
        format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate),
        params,
    )
}

fn bind_all<'q>(mut query: PgQuery<'q>, params: &'q [Value]) -> PgQuery<'q> {
    for param in params {
        query = bind_param(query, param);
    }
    query
}

fn bind_param<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u as i64)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        // Structured values go over as jsonb
        Value::Array(_) | Value::Object(_) => query.bind(value.clone()),
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn decode_row(row: &PgRow) -> Attributes {
    let mut out = Attributes::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name());
        out.insert(column.name().to_string(), value);
    }
    out
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    let is_null = row
        .try_get_raw(index)
        .map(|raw| raw.is_null())
        .unwrap_or(true);
    if is_null {
        return Value::Null;
    }

    match type_name {
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
            .try_get::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(|v| Value::Number(i64::from(v).into()))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::Number(i64::from(v).into()))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<i64, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .ok()
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(index)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<bool, _>(index)
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Value, _>(index)
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<sqlx::types::Uuid, _>(index)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| Value::String(v.and_utc().to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => decode_fallback(row, index),
    }
}

// Try plausible decodings for types without a dedicated arm
fn decode_fallback(row: &PgRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Value, _>(index) {
        v
    } else if let Ok(s) = row.try_get::<String, _>(index) {
        Value::String(s)
    } else if let Ok(i) = row.try_get::<i64, _>(index) {
        Value::Number(i.into())
    } else if let Ok(f) = row.try_get::<f64, _>(index) {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Ok(b) = row.try_get::<bool, _>(index) {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            return classify_code(code.as_ref(), db.message());
        }
    }
    StorageError::Backend(err.to_string())
}

/// SQLSTATE mapping: lock_not_available becomes a retryable timeout,
/// class 23 (integrity violations) becomes a constraint error.
fn classify_code(code: &str, message: &str) -> StorageError {
    if code == "55P03" {
        StorageError::LockTimeout(message.to_string())
    } else if code.starts_with("23") {
        StorageError::Constraint(message.to_string())
    } else {
        StorageError::Backend(message.to_string())
    }
}
