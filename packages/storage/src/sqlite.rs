// ABOUTME: SQLite implementation of the Persistence trait
// ABOUTME: Manages the connection pool, applies migrations and maps rows to session records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{MessageRole, Session, SessionFile, SessionStatus, TimelineMessage};
use crate::{Persistence, StorageError, StorageResult};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite implementation of Persistence
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `database_url` and run migrations
    pub async fn new(database_url: &str) -> StorageResult<Self> {
        if let Some(parent) = database_file(database_url).and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Database(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        let storage = Self::from_pool(pool).await?;
        info!("Opened session database at {}", database_url);
        Ok(storage)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single connection that never recycles, otherwise the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and bring its schema up to date
    pub async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Session database migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_session(row: &SqliteRow) -> StorageResult<Session> {
        let config_json: String = row.try_get("config")?;
        let status_str: String = row.try_get("status")?;
        let status = SessionStatus::from_str(&status_str).map_err(StorageError::Database)?;

        Ok(Session {
            id: row.try_get("id")?,
            prompt: row.try_get("prompt")?,
            config: serde_json::from_str(&config_json)?,
            status,
            error_message: row.try_get("error_message")?,
            input_tokens: row.try_get::<i64, _>("input_tokens")?.max(0) as u64,
            output_tokens: row.try_get::<i64, _>("output_tokens")?.max(0) as u64,
            cost_usd: row.try_get("cost_usd")?,
            duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_message(row: &SqliteRow) -> StorageResult<TimelineMessage> {
        let role_str: String = row.try_get("role")?;
        Ok(TimelineMessage {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            role: MessageRole::from_str(&role_str).map_err(StorageError::Database)?,
            content: row.try_get("content")?,
            timestamp: parse_timestamp(row.try_get("timestamp")?)?,
        })
    }

    fn row_to_file(row: &SqliteRow) -> StorageResult<SessionFile> {
        Ok(SessionFile {
            session_id: row.try_get("session_id")?,
            path: row.try_get("path")?,
            content: row.try_get("content")?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        })
    }
}

/// Filesystem path of a file-backed database URL, if it is one
fn database_file(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(Path::new(path))
    }
}

fn parse_timestamp(raw: String) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Database(format!("invalid timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl Persistence for SqliteStorage {
    async fn upsert_session(&self, session: &Session) -> StorageResult<()> {
        let config_json = serde_json::to_string(&session.config)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, prompt, config, status, error_message,
                input_tokens, output_tokens, cost_usd, duration_ms,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                prompt = excluded.prompt,
                config = excluded.config,
                status = excluded.status,
                error_message = excluded.error_message,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                cost_usd = excluded.cost_usd,
                duration_ms = excluded.duration_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(&session.prompt)
        .bind(config_json)
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .bind(session.input_tokens as i64)
        .bind(session.output_tokens as i64)
        .bind(session.cost_usd)
        .bind(session.duration_ms as i64)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session.id, status = %session.status, "Session saved");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC, id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_session).collect()
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {}", id)));
        }

        tx.commit().await?;
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    async fn upsert_message(&self, message: &TimelineMessage) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, seq, timestamp)
            VALUES (
                ?, ?, ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?),
                ?
            )
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                content = excluded.content
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.session_id)
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> StorageResult<Vec<TimelineMessage>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ? ORDER BY seq")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn save_file(&self, session_id: &str, path: &str, content: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (session_id, path, content, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, path) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(path)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_files(&self, session_id: &str) -> StorageResult<Vec<SessionFile>> {
        let rows = sqlx::query("SELECT * FROM files WHERE session_id = ? ORDER BY path")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_file).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn message(id: &str, session_id: &str, role: MessageRole, content: &str) -> TimelineMessage {
        TimelineMessage {
            id: id.to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_upsert_and_get() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut session = Session::new("s1", "a todo app", json!({"planning": true}));
        storage.upsert_session(&session).await.unwrap();

        session.status = SessionStatus::Completed;
        session.input_tokens = 120;
        session.output_tokens = 480;
        session.cost_usd = 0.0123;
        session.duration_ms = 4_500;
        storage.upsert_session(&session).await.unwrap();

        let loaded = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.input_tokens, 120);
        assert_eq!(loaded.output_tokens, 480);
        assert_eq!(loaded.duration_ms, 4_500);
        assert_eq!(loaded.config, json!({"planning": true}));
        assert!(storage.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_newest_first() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut older = Session::new("old", "first", json!({}));
        older.created_at = Utc::now() - ChronoDuration::minutes(5);
        let newer = Session::new("new", "second", json!({}));
        storage.upsert_session(&older).await.unwrap();
        storage.upsert_session(&newer).await.unwrap();

        let ids: Vec<String> = storage
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_message_upsert_keeps_timeline_position() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .upsert_session(&Session::new("s1", "prompt", json!({})))
            .await
            .unwrap();

        storage
            .upsert_message(&message("m1", "s1", MessageRole::Assistant, "Hel"))
            .await
            .unwrap();
        storage
            .upsert_message(&message("m2", "s1", MessageRole::System, "Wrote file"))
            .await
            .unwrap();
        storage
            .upsert_message(&message("m1", "s1", MessageRole::Assistant, "Hello"))
            .await
            .unwrap();

        let messages = storage.list_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].id, "m2");
        assert_eq!(messages[1].role, MessageRole::System);
    }

    #[tokio::test]
    async fn test_save_file_overwrites_content() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .upsert_session(&Session::new("s1", "prompt", json!({})))
            .await
            .unwrap();

        storage.save_file("s1", "server/src/index.ts", "v1").await.unwrap();
        storage.save_file("s1", "client/src/App.tsx", "app").await.unwrap();
        storage.save_file("s1", "server/src/index.ts", "v2").await.unwrap();

        let files = storage.list_files("s1").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "client/src/App.tsx");
        assert_eq!(files[1].content, "v2");
    }

    #[tokio::test]
    async fn test_delete_session_removes_children() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .upsert_session(&Session::new("s1", "prompt", json!({})))
            .await
            .unwrap();
        storage
            .upsert_message(&message("m1", "s1", MessageRole::User, "build it"))
            .await
            .unwrap();
        storage.save_file("s1", "README.md", "# app").await.unwrap();

        storage.delete_session("s1").await.unwrap();

        assert!(storage.get_session("s1").await.unwrap().is_none());
        assert!(storage.list_messages("s1").await.unwrap().is_empty());
        assert!(storage.list_files("s1").await.unwrap().is_empty());
        assert!(matches!(
            storage.delete_session("s1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sandcastle.db");
        let url = format!("sqlite://{}", path.display());

        let storage = SqliteStorage::new(&url).await.unwrap();
        storage
            .upsert_session(&Session::new("s1", "prompt", json!({})))
            .await
            .unwrap();

        assert!(path.exists());
        assert_eq!(storage.list_sessions().await.unwrap().len(), 1);
    }

    #[test]
    fn test_database_file_extraction() {
        assert_eq!(
            database_file("sqlite://.sandcastle/db.sqlite"),
            Some(Path::new(".sandcastle/db.sqlite"))
        );
        assert_eq!(database_file("sqlite:data.db?mode=rwc"), Some(Path::new("data.db")));
        assert_eq!(database_file("sqlite::memory:"), None);
    }
}
