//! PostgreSQL implementation of EntryStore
//!
//! Production persistence using PostgreSQL with:
//! - Batch claiming with `FOR UPDATE SKIP LOCKED`
//! - Lease-checked outcome updates (`owner_id` must still match)
//! - Single-statement archival into the history table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, instrument};

use super::entry::{EntryId, EntryState, HistoryEntry, NewEntry, QueueEntry};
use super::schema::{schema_statements, ENTRY_COLUMNS};
use super::store::{outcome_error, ClaimScope, EntryStore, StoreError};
use crate::config::{validate_identifier, ConfigError, QueueConfig};

/// PostgreSQL implementation of EntryStore
///
/// Table names come from [`QueueConfig`] and are validated before any query
/// is built from them.
///
/// # Example
///
/// ```ignore
/// use everruns_queue::{PostgresEntryStore, QueueConfig};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresEntryStore::from_config(pool, &QueueConfig::default())?;
/// store.install_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEntryStore {
    pool: PgPool,
    table: String,
    history_table: String,
}

impl PostgresEntryStore {
    /// Create a store using the default table names
    pub fn new(pool: PgPool) -> Self {
        let defaults = QueueConfig::default();
        Self {
            pool,
            table: defaults.table_name,
            history_table: defaults.history_table_name,
        }
    }

    /// Create a store using the table names of `config`
    pub fn from_config(pool: PgPool, config: &QueueConfig) -> Result<Self, ConfigError> {
        Self::new(pool).with_tables(&config.table_name, &config.history_table_name)
    }

    /// Use custom primary and history tables
    pub fn with_tables(
        mut self,
        table: impl Into<String>,
        history_table: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let table = table.into();
        let history_table = history_table.into();
        validate_identifier(&table)?;
        validate_identifier(&history_table)?;
        self.table = table;
        self.history_table = history_table;
        Ok(self)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Primary table name
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// History table name
    pub fn history_table_name(&self) -> &str {
        &self.history_table
    }

    /// Create tables and indexes if they do not exist
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.table, &self.history_table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("Failed to install schema", e))?;
        }
        debug!("Schema installed");
        Ok(())
    }

    /// Explain an outcome update that matched no row
    async fn lease_failure(&self, id: EntryId, owner_id: &str) -> StoreError {
        let state = sqlx::query(&format!("SELECT state FROM {} WHERE id = $1", self.table))
            .bind(id)
            .fetch_optional(&self.pool)
            .await;

        match state {
            Ok(Some(row)) => {
                match get::<String>(&row, "state").and_then(|s| s.parse::<EntryState>()) {
                    Ok(state) => outcome_error(id, owner_id, Some(state)),
                    Err(e) => e,
                }
            }
            Ok(None) => outcome_error(id, owner_id, None),
            Err(e) => db_error("Failed to read entry state", e),
        }
    }

    /// Run a lease-checked outcome update
    async fn finish_claimed(
        &self,
        sql: &str,
        id: EntryId,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(sql)
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update entry", e))?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(id, owner_id).await);
        }
        Ok(())
    }
}

/// Map a sqlx error, separating "store unreachable" from query failures
fn db_error(context: &str, err: sqlx::Error) -> StoreError {
    error!(error = %err, "{}", context);
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Database(err.to_string()),
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry, StoreError> {
    let state: String = get(row, "state")?;
    let error_count: i32 = get(row, "error_count")?;

    Ok(QueueEntry {
        id: get(row, "id")?,
        queue_name: get(row, "queue_name")?,
        search_key1: get(row, "search_key1")?,
        search_key2: get(row, "search_key2")?,
        user_token: get(row, "user_token")?,
        payload: get(row, "payload")?,
        available_time: get(row, "available_time")?,
        state: state.parse()?,
        owner_id: get(row, "owner_id")?,
        claimed_time: get(row, "claimed_time")?,
        error_count: u32::try_from(error_count).unwrap_or(0),
        creating_owner: get(row, "creating_owner")?,
        created_time: get(row, "created_time")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryEntry, StoreError> {
    Ok(HistoryEntry {
        entry: entry_from_row(row)?,
        processed_time: get(row, "processed_time")?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl EntryStore for PostgresEntryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("SELECT 1 FROM {} LIMIT 1", self.table))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(queue = %entry.queue_name))]
    async fn insert(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
        // Claims compare against the application clock, so insert on it too
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (queue_name, search_key1, search_key2, user_token, payload,
                            available_time, state, error_count, creating_owner, created_time)
            VALUES ($1, $2, $3, $4, $5, $6, 'AVAILABLE', 0, $7, $8)
            RETURNING id
            "#,
            self.table
        ))
        .bind(&entry.queue_name)
        .bind(entry.search_key1)
        .bind(entry.search_key2)
        .bind(entry.user_token)
        .bind(&entry.payload)
        .bind(entry.available_time.unwrap_or(now))
        .bind(&entry.creating_owner)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert entry", e))?;

        let id: EntryId = get(&row, "id")?;
        debug!(entry_id = id, "Entry inserted");
        Ok(id)
    }

    #[instrument(skip(self, scope, now), fields(queue = %queue_name, owner = %owner_id))]
    async fn claim_batch(
        &self,
        queue_name: &str,
        owner_id: &str,
        scope: &ClaimScope,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        // SKIP LOCKED lets concurrent claimants pass over each other's rows
        // instead of blocking, and guarantees disjoint batches.
        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE queue_name = $1
                  AND state = 'AVAILABLE'
                  AND available_time <= $2
                  AND ($3::TEXT IS NULL OR creating_owner = $3)
                ORDER BY available_time, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} e
            SET state = 'IN_PROCESSING',
                owner_id = $5,
                claimed_time = $2
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.*
            "#,
            table = self.table
        ))
        .bind(queue_name)
        .bind(now)
        .bind(scope.creating_owner())
        .bind(to_i64(limit))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim entries", e))?;

        let mut claimed = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not preserve the CTE order
        claimed.sort_by(|a, b| (a.available_time, a.id).cmp(&(b.available_time, b.id)));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed entries");
        }
        Ok(claimed)
    }

    #[instrument(skip(self), fields(entry_id = id))]
    async fn mark_processed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET state = 'PROCESSED', owner_id = NULL, claimed_time = NULL
            WHERE id = $1 AND owner_id = $2 AND state = 'IN_PROCESSING'
            "#,
            self.table
        );
        self.finish_claimed(&sql, id, owner_id).await
    }

    #[instrument(skip(self), fields(entry_id = id))]
    async fn mark_retry(
        &self,
        id: EntryId,
        owner_id: &str,
        available_time: DateTime<Utc>,
        error_count: u32,
    ) -> Result<(), StoreError> {
        let error_count = i32::try_from(error_count).unwrap_or(i32::MAX);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET state = 'AVAILABLE',
                owner_id = NULL,
                claimed_time = NULL,
                available_time = GREATEST(available_time, $3),
                error_count = GREATEST(error_count, $4)
            WHERE id = $1 AND owner_id = $2 AND state = 'IN_PROCESSING'
            "#,
            self.table
        ))
        .bind(id)
        .bind(owner_id)
        .bind(available_time)
        .bind(error_count)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to schedule retry", e))?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(id, owner_id).await);
        }
        debug!(error_count, %available_time, "Entry scheduled for retry");
        Ok(())
    }

    #[instrument(skip(self), fields(entry_id = id))]
    async fn mark_failed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET state = 'FAILED', owner_id = NULL, claimed_time = NULL
            WHERE id = $1 AND owner_id = $2 AND state = 'IN_PROCESSING'
            "#,
            self.table
        );
        self.finish_claimed(&sql, id, owner_id).await
    }

    #[instrument(skip(self), fields(entry_id = id))]
    async fn move_to_history(&self, id: EntryId) -> Result<HistoryEntry, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            WITH moved AS (
                DELETE FROM {table}
                WHERE id = $1 AND state IN ('PROCESSED', 'FAILED')
                RETURNING {columns}
            )
            INSERT INTO {history} ({columns}, processed_time)
            SELECT {columns}, NOW() FROM moved
            RETURNING {columns}, processed_time
            "#,
            table = self.table,
            history = self.history_table,
            columns = ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to move entry to history", e))?;

        match row {
            Some(row) => history_from_row(&row),
            None => match self.get_entry(id).await? {
                Some(entry) => Err(StoreError::InvalidState {
                    id,
                    actual: entry.state,
                    expected: "PROCESSED or FAILED",
                }),
                None => Err(StoreError::EntryNotFound(id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            WITH stale AS (
                SELECT id
                FROM {table}
                WHERE state = 'IN_PROCESSING'
                  AND claimed_time < $1
                ORDER BY claimed_time
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} e
            SET state = 'AVAILABLE',
                owner_id = NULL,
                claimed_time = NULL
            FROM stale s
            WHERE e.id = s.id
            "#,
            table = self.table
        ))
        .bind(older_than)
        .bind(to_i64(limit))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reclaim stale entries", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn archive_terminal(&self, limit: usize) -> Result<usize, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            WITH terminal AS (
                SELECT id
                FROM {table}
                WHERE state IN ('PROCESSED', 'FAILED')
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ),
            moved AS (
                DELETE FROM {table}
                WHERE id IN (SELECT id FROM terminal)
                RETURNING {columns}
            )
            INSERT INTO {history} ({columns}, processed_time)
            SELECT {columns}, NOW() FROM moved
            "#,
            table = self.table,
            history = self.history_table,
            columns = ENTRY_COLUMNS
        ))
        .bind(to_i64(limit))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to archive terminal entries", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn count_ready(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS ready
            FROM {}
            WHERE queue_name = $1 AND state = 'AVAILABLE' AND available_time <= $2
            "#,
            self.table
        ))
        .bind(queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count ready entries", e))?;

        let ready: i64 = get(&row, "ready")?;
        Ok(ready.max(0) as usize)
    }

    async fn find_by_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM {}
            WHERE queue_name = $1
              AND search_key1 = $2
              AND ($3::BIGINT IS NULL OR search_key2 = $3)
              AND state IN ('AVAILABLE', 'IN_PROCESSING')
            ORDER BY id
            "#,
            self.table
        ))
        .bind(queue_name)
        .bind(search_key1)
        .bind(search_key2)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn in_processing(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM {}
            WHERE queue_name = $1 AND state = 'IN_PROCESSING'
            ORDER BY id
            "#,
            self.table
        ))
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list claimed entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn history_entry(&self, id: EntryId) -> Result<Option<HistoryEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS}, processed_time FROM {} WHERE id = $1",
            self.history_table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get history entry", e))?;

        row.as_ref().map(history_from_row).transpose()
    }

    async fn history_for_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}, processed_time
            FROM {}
            WHERE queue_name = $1
              AND search_key1 = $2
              AND ($3::BIGINT IS NULL OR search_key2 = $3)
            ORDER BY id
            "#,
            self.history_table
        ))
        .bind(queue_name)
        .bind(search_key1)
        .bind(search_key2)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list history", e))?;

        rows.iter().map(history_from_row).collect()
    }
}
