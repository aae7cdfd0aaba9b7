//! SQLite-backed [`Storage`] implementation.
//!
//! Uses a single `SqlitePool` and plain runtime `sqlx::query`/`query_as`
//! calls (no compile-time `query!` macro, since this crate must build
//! without a live database to check types against). Schema is created on
//! first connection; there is no external migrations directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{
    CommandRow, EventRow, NewEvent, ProjectionRow, SnapshotRow, Storage, StorageError,
};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect to `db_path` (the literal `:memory:` or a filesystem path)
    /// and ensure the schema exists.
    pub async fn connect(db_path: &str, max_connections: u32) -> Result<Self, StorageError> {
        // `:memory:` is private per-connection; `cache=shared` makes every
        // connection in the pool see the same in-memory database.
        let url = if db_path == ":memory:" {
            "sqlite:file::memory:?cache=shared".to_string()
        } else {
            format!("sqlite://{db_path}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                position        INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                aggregate_id    TEXT NOT NULL,
                aggregate_type  TEXT NOT NULL,
                event_type      TEXT NOT NULL,
                payload         TEXT NOT NULL,
                version         INTEGER NOT NULL,
                timestamp       TEXT NOT NULL,
                caused_by       TEXT,
                metadata        TEXT,
                UNIQUE(aggregate_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events(aggregate_id, version)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_type ON events(aggregate_type, position)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                aggregate_id    TEXT NOT NULL,
                aggregate_type  TEXT NOT NULL,
                version         INTEGER NOT NULL,
                state           TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projections (
                name      TEXT PRIMARY KEY,
                state     TEXT NOT NULL,
                position  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command_log (
                id              TEXT PRIMARY KEY,
                command_type    TEXT NOT NULL,
                payload         TEXT NOT NULL,
                issued_by       TEXT,
                issued_at       TEXT NOT NULL,
                status          TEXT NOT NULL,
                result          TEXT,
                error_message   TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    fn row_to_event(row: SqliteRow) -> Result<EventRow, StorageError> {
        let payload_raw: String = row.try_get("payload").map_err(backend)?;
        let metadata_raw: Option<String> = row.try_get("metadata").map_err(backend)?;
        Ok(EventRow {
            position: row.try_get("position").map_err(backend)?,
            id: row.try_get("id").map_err(backend)?,
            aggregate_id: row.try_get("aggregate_id").map_err(backend)?,
            aggregate_type: row.try_get("aggregate_type").map_err(backend)?,
            event_type: row.try_get("event_type").map_err(backend)?,
            payload: serde_json::from_str(&payload_raw)?,
            version: row.try_get("version").map_err(backend)?,
            timestamp: row
                .try_get::<String, _>("timestamp")
                .map_err(backend)?
                .parse::<DateTime<Utc>>()
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            caused_by: row.try_get("caused_by").map_err(backend)?,
            metadata: metadata_raw.map(|m| serde_json::from_str(&m)).transpose()?,
        })
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<i64>, StorageError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let current_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?",
        )
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        let mut positions = Vec::with_capacity(events.len());
        let mut next_version = current_version;
        for event in events {
            next_version += 1;
            if event.version != next_version {
                return Err(StorageError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected: next_version,
                    actual: event.version,
                });
            }

            let payload = serde_json::to_string(&event.payload)?;
            let metadata = event.metadata.as_ref().map(serde_json::to_string).transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO events
                    (id, aggregate_id, aggregate_type, event_type, payload, version, timestamp, caused_by, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(payload)
            .bind(event.version)
            .bind(event.timestamp.to_rfc3339())
            .bind(&event.caused_by)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            positions.push(result.last_insert_rowid());
        }

        tx.commit().await.map_err(backend)?;
        Ok(positions)
    }

    async fn load_events(
        &self,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRow>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE aggregate_id = ? AND version > ? ORDER BY version ASC",
        )
        .bind(aggregate_id)
        .bind(from_version)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn load_events_by_type(
        &self,
        aggregate_type: &str,
        after_position: i64,
    ) -> Result<Vec<EventRow>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE aggregate_type = ? AND position > ? ORDER BY position ASC",
        )
        .bind(aggregate_type)
        .bind(after_position)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn load_all_events(&self, after_position: i64) -> Result<Vec<EventRow>, StorageError> {
        let rows = sqlx::query("SELECT * FROM events WHERE position > ? ORDER BY position ASC")
            .bind(after_position)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn max_position(&self) -> Result<i64, StorageError> {
        let position: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(position)
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<i64, StorageError> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(version)
    }

    async fn aggregate_type_of(&self, aggregate_id: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT aggregate_type FROM events WHERE aggregate_id = ? LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(|(t,)| t))
    }

    async fn save_snapshot(&self, snapshot: SnapshotRow) -> Result<(), StorageError> {
        let state = serde_json::to_string(&snapshot.state)?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, state, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(aggregate_id, version) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(&snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version)
        .bind(state)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_latest_snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRow>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM snapshots WHERE aggregate_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };
        let state_raw: String = row.try_get("state").map_err(backend)?;
        Ok(Some(SnapshotRow {
            aggregate_id: row.try_get("aggregate_id").map_err(backend)?,
            aggregate_type: row.try_get("aggregate_type").map_err(backend)?,
            version: row.try_get("version").map_err(backend)?,
            state: serde_json::from_str(&state_raw)?,
            created_at: row
                .try_get::<String, _>("created_at")
                .map_err(backend)?
                .parse::<DateTime<Utc>>()
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        }))
    }

    async fn load_projection(&self, name: &str) -> Result<Option<ProjectionRow>, StorageError> {
        let row = sqlx::query("SELECT * FROM projections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };
        let state_raw: String = row.try_get("state").map_err(backend)?;
        Ok(Some(ProjectionRow {
            name: row.try_get("name").map_err(backend)?,
            state: serde_json::from_str(&state_raw)?,
            position: row.try_get("position").map_err(backend)?,
        }))
    }

    async fn save_projection(&self, row: ProjectionRow) -> Result<(), StorageError> {
        let state = serde_json::to_string(&row.state)?;
        sqlx::query(
            r#"
            INSERT INTO projections (name, state, position) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET state = excluded.state, position = excluded.position
            "#,
        )
        .bind(&row.name)
        .bind(state)
        .bind(row.position)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn insert_command(&self, row: CommandRow) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&row.payload)?;
        let result = row.result.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO command_log
                (id, command_type, payload, issued_by, issued_at, status, result, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.command_type)
        .bind(payload)
        .bind(&row.issued_by)
        .bind(row.issued_at.to_rfc3339())
        .bind(&row.status)
        .bind(result)
        .bind(&row.error_message)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn update_command(
        &self,
        id: &str,
        status: &str,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<(), StorageError> {
        let result = result.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE command_log SET status = ?, result = ?, error_message = ? WHERE id = ?",
        )
        .bind(status)
        .bind(result)
        .bind(&error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_command(&self, id: &str) -> Result<Option<CommandRow>, StorageError> {
        let row = sqlx::query("SELECT * FROM command_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };
        let payload_raw: String = row.try_get("payload").map_err(backend)?;
        let result_raw: Option<String> = row.try_get("result").map_err(backend)?;
        Ok(Some(CommandRow {
            id: row.try_get("id").map_err(backend)?,
            command_type: row.try_get("command_type").map_err(backend)?,
            payload: serde_json::from_str(&payload_raw)?,
            issued_by: row.try_get("issued_by").map_err(backend)?,
            issued_at: row
                .try_get::<String, _>("issued_at")
                .map_err(backend)?
                .parse::<DateTime<Utc>>()
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            status: row.try_get("status").map_err(backend)?,
            result: result_raw.map(|r| serde_json::from_str(&r)).transpose()?,
            error_message: row.try_get("error_message").map_err(backend)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_and_creates_schema_in_memory() {
        let storage = SqliteStorage::connect(":memory:", 1).await.unwrap();
        assert_eq!(storage.max_position().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_assigns_contiguous_positions_and_rejects_version_skew() {
        let storage = SqliteStorage::connect(":memory:", 1).await.unwrap();

        let events = vec![
            NewEvent {
                id: "e1".into(),
                aggregate_id: "a1".into(),
                aggregate_type: "Order".into(),
                event_type: "Created".into(),
                payload: Value::Null,
                version: 1,
                timestamp: Utc::now(),
                caused_by: None,
                metadata: None,
            },
            NewEvent {
                id: "e2".into(),
                aggregate_id: "a1".into(),
                aggregate_type: "Order".into(),
                event_type: "Updated".into(),
                payload: Value::Null,
                version: 2,
                timestamp: Utc::now(),
                caused_by: None,
                metadata: None,
            },
        ];

        let positions = storage.append_events("a1", events).await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(storage.current_version("a1").await.unwrap(), 2);

        let conflicting = vec![NewEvent {
            id: "e3".into(),
            aggregate_id: "a1".into(),
            aggregate_type: "Order".into(),
            event_type: "Updated".into(),
            payload: Value::Null,
            version: 2,
            timestamp: Utc::now(),
            caused_by: None,
            metadata: None,
        }];
        let err = storage.append_events("a1", conflicting).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
    }
}
