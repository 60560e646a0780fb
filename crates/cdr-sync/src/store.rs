//! Remote analytical store
//!
//! One table per schedule. Source columns are stored as TEXT exactly as read;
//! two bookkeeping columns are appended to every row:
//!
//! - `_period`: the period identifier, used to purge and verify a period
//! - `_uploaded_at`: when the batch carrying the row was written

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

pub const PERIOD_COLUMN: &str = "_period";
pub const UPLOADED_AT_COLUMN: &str = "_uploaded_at";

/// Bookkeeping columns appended to every row
pub const BOOKKEEPING_COLUMNS: usize = 2;

/// PostgreSQL's hard limit on bind parameters per statement
pub const POSTGRES_MAX_BIND_PARAMS: usize = 65_535;

pub const DEFAULT_SCHEMA: &str = "ffiec";

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create `table` with `columns` if it does not exist yet
    ///
    /// An existing table is never altered. If it lacks one of `columns` the
    /// call fails with [`StoreError::Rejected`].
    async fn ensure_table(&self, table: &str, columns: &[String]) -> Result<(), StoreError>;

    /// Delete every row of `table` tagged with `period`; a missing table holds none
    async fn purge_period(&self, table: &str, period: &str) -> Result<u64, StoreError>;

    /// Write one batch in a single statement, returning the rows inserted
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        period: &str,
        uploaded_at: DateTime<Utc>,
        rows: &[Vec<String>],
    ) -> Result<u64, StoreError>;

    async fn count_period_rows(&self, table: &str, period: &str) -> Result<u64, StoreError>;

    /// Upper bound on bound values per statement, if the store has one
    fn max_bind_params(&self) -> Option<usize> {
        None
    }
}

/// [`RemoteStore`] backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgRemoteStore {
    pool: PgPool,
    schema: String,
}

impl PgRemoteStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Open a pool against `url`
    ///
    /// Connecting is lazy so that a run with nothing to upload never needs the
    /// database.
    pub fn connect_lazy(
        url: &str,
        schema: impl Into<String>,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;

        let store = Self::new(pool, schema);
        info!(
            schema = %store.schema,
            max_connections,
            "Remote store pool configured"
        );
        Ok(store)
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::TEXT FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(columns)
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn ensure_table(&self, table: &str, columns: &[String]) -> Result<(), StoreError> {
        let existing = self.existing_columns(table).await?;
        if !existing.is_empty() {
            return check_columns(table, &existing, columns);
        }

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.schema)
        ))
        .execute(&self.pool)
        .await?;

        let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (", self.qualified(table));
        for column in columns {
            ddl.push_str(&quote_ident(column));
            ddl.push_str(" TEXT, ");
        }
        ddl.push_str(&format!(
            "{} TEXT NOT NULL, {} TIMESTAMPTZ NOT NULL)",
            quote_ident(PERIOD_COLUMN),
            quote_ident(UPLOADED_AT_COLUMN)
        ));
        sqlx::query(&ddl).execute(&self.pool).await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&format!("{}_period_idx", table)),
            self.qualified(table),
            quote_ident(PERIOD_COLUMN)
        ))
        .execute(&self.pool)
        .await?;

        info!(table, columns = columns.len(), "Created remote table");
        Ok(())
    }

    async fn purge_period(&self, table: &str, period: &str) -> Result<u64, StoreError> {
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::TEXT")
            .bind(self.qualified(table))
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = $1",
            self.qualified(table),
            quote_ident(PERIOD_COLUMN)
        ))
        .bind(period)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        period: &str,
        uploaded_at: DateTime<Utc>,
        rows: &[Vec<String>],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (", self.qualified(table)));
        for column in columns {
            query_builder.push(quote_ident(column));
            query_builder.push(", ");
        }
        query_builder.push(format!(
            "{}, {}) ",
            quote_ident(PERIOD_COLUMN),
            quote_ident(UPLOADED_AT_COLUMN)
        ));

        query_builder.push_values(rows, |mut b, row| {
            for value in row {
                b.push_bind(value);
            }
            b.push_bind(period).push_bind(uploaded_at);
        });

        let result = query_builder.build().execute(&self.pool).await?;
        debug!(table, rows = result.rows_affected(), "Inserted batch");
        Ok(result.rows_affected())
    }

    async fn count_period_rows(&self, table: &str, period: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            self.qualified(table),
            quote_ident(PERIOD_COLUMN)
        ))
        .bind(period)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    fn max_bind_params(&self) -> Option<usize> {
        Some(POSTGRES_MAX_BIND_PARAMS)
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Existing tables must already carry every column an artifact brings
pub fn check_columns(table: &str, existing: &[String], wanted: &[String]) -> Result<(), StoreError> {
    let missing: Vec<&str> = wanted
        .iter()
        .filter(|c| !existing.iter().any(|e| e == *c))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "table '{}' exists without column(s) {}; existing tables are never altered",
            table,
            missing.join(", ")
        )))
    }
}
