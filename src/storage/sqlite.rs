//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{Storage, StorageError, TaskRecord};
use crate::core::state::TaskState;
use crate::core::task::ScanTask;
use crate::core::types::TaskId;

const SELECT_COLUMNS: &str = "SELECT id, target, arguments, label, state, attempts, result, failure, \
     cancel_requested, created_at, updated_at, version FROM tasks";

type TaskRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    i64,
    i64,
    i64,
);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // A single connection that never expires; the database lives with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a driver error, separating transient conditions from hard failures.
fn db_error(e: sqlx::Error) -> StorageError {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes.
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517")),
        _ => false,
    };
    if transient {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Other(e.to_string())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_record(row: TaskRow) -> Result<TaskRecord, StorageError> {
    let arguments: Vec<String> = from_json(&row.2)?;
    let task = ScanTask::with_id(
        TaskId::new(row.0),
        row.1,
        arguments,
        Some(row.3),
        millis_to_time(row.9),
    );
    let state = TaskState::from_str(&row.4).map_err(StorageError::SerializationError)?;

    Ok(TaskRecord {
        task,
        state,
        attempts: from_json(&row.5)?,
        result: row.6.as_deref().map(from_json).transpose()?,
        failure: row.7.as_deref().map(from_json).transpose()?,
        cancel_requested: row.8,
        updated_at: millis_to_time(row.10),
        version: row.11 as u64,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_task(&self, record: TaskRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, target, arguments, label, state, attempts, result, failure,
                               cancel_requested, created_at, updated_at, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id().as_str())
        .bind(record.task.target())
        .bind(to_json(record.task.arguments())?)
        .bind(record.task.label())
        .bind(record.state.as_str())
        .bind(to_json(&record.attempts)?)
        .bind(record.result.as_ref().map(to_json).transpose()?)
        .bind(record.failure.as_ref().map(to_json).transpose()?)
        .bind(record.cancel_requested)
        .bind(record.task.created_at().timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .bind(record.version as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("task: {}", record.id())))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_task(&self, id: &TaskId) -> Result<TaskRecord, StorageError> {
        let row: TaskRow = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;

        row_to_record(row)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let rows: Vec<TaskRow> =
            sqlx::query_as(&format!("{} ORDER BY created_at, rowid", SELECT_COLUMNS))
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn update_task(&self, record: &mut TaskRecord) -> Result<(), StorageError> {
        let next_version = record.version + 1;
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = ?, attempts = ?, result = ?, failure = ?,
                             cancel_requested = ?, updated_at = ?, version = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(record.state.as_str())
        .bind(to_json(&record.attempts)?)
        .bind(record.result.as_ref().map(to_json).transpose()?)
        .bind(record.failure.as_ref().map(to_json).transpose()?)
        .bind(record.cancel_requested)
        .bind(record.updated_at.timestamp_millis())
        .bind(next_version as i64)
        .bind(record.id().as_str())
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM tasks WHERE id = ?")
                .bind(record.id().as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

            return Err(match current {
                None => StorageError::NotFound(format!("task: {}", record.id())),
                Some((actual,)) => StorageError::Conflict {
                    id: record.id().to_string(),
                    expected: record.version,
                    actual: actual as u64,
                },
            });
        }

        record.version = next_version;
        Ok(())
    }

    async fn get_incomplete_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "{} WHERE state NOT IN ('COMPLETED', 'FAILED', 'CANCELLED') ORDER BY created_at, rowid",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(row_to_record).collect()
    }
}
