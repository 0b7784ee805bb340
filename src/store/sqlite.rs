//! Sqlite session repository
//!
//! One row per session; messages and meta serialize as JSON columns. Script
//! provenance columns are split out so hash/path lookups stay indexable.
//! Schema is created on open.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::SessionRepository;
use crate::error::{Result, SessionError};
use crate::session::{BackendKind, ScriptProvenance, SessionRecord, SessionStatus};

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // In-memory sqlite is per-connection; a pool of one keeps it coherent.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to open session database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                messages TEXT NOT NULL,
                meta TEXT NOT NULL,
                script_path TEXT,
                script_hash TEXT,
                script_modified_at INTEGER,
                script_snapshot TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_path ON sessions(path)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_script_hash ON sessions(script_hash)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}

fn repo_err(e: impl Into<anyhow::Error>) -> SessionError {
    SessionError::Repository(e.into())
}

fn row_to_record(row: &SqliteRow) -> Result<SessionRecord> {
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let messages_json: String = row.get("messages");
    let meta_json: String = row.get("meta");

    let kind = BackendKind::from_str(&kind_str)
        .ok_or_else(|| repo_err(anyhow::anyhow!("unknown backend kind: {kind_str}")))?;
    let status = SessionStatus::from_str(&status_str)
        .ok_or_else(|| repo_err(anyhow::anyhow!("unknown session status: {status_str}")))?;

    let script = match row.get::<Option<String>, _>("script_path") {
        Some(path) => Some(ScriptProvenance {
            path,
            content_hash: row.get::<Option<String>, _>("script_hash").unwrap_or_default(),
            modified_at: row.get::<Option<i64>, _>("script_modified_at").unwrap_or(0),
            snapshot: row.get("script_snapshot"),
        }),
        None => None,
    };

    Ok(SessionRecord {
        id: row.get("id"),
        path: row.get("path"),
        kind,
        status,
        messages: serde_json::from_str(&messages_json).map_err(repo_err)?,
        meta: serde_json::from_str(&meta_json).map_err(repo_err)?,
        script,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl SessionRepository for SqliteRepository {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = $1")
            .bind(&record.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(repo_err)?;
        if exists.is_some() {
            return Err(SessionError::AlreadyExists(record.id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, path, kind, status, messages, meta,
                 script_path, script_hash, script_modified_at, script_snapshot,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&record.id)
        .bind(&record.path)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.messages).map_err(repo_err)?)
        .bind(serde_json::to_string(&record.meta).map_err(repo_err)?)
        .bind(record.script.as_ref().map(|s| s.path.clone()))
        .bind(record.script.as_ref().map(|s| s.content_hash.clone()))
        .bind(record.script.as_ref().map(|s| s.modified_at))
        .bind(record.script.as_ref().and_then(|s| s.snapshot.clone()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET path = $2, kind = $3, status = $4, messages = $5, meta = $6,
                script_path = $7, script_hash = $8, script_modified_at = $9,
                script_snapshot = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(&record.path)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.messages).map_err(repo_err)?)
        .bind(serde_json::to_string(&record.meta).map_err(repo_err)?)
        .bind(record.script.as_ref().map(|s| s.path.clone()))
        .bind(record.script.as_ref().map(|s| s.content_hash.clone()))
        .bind(record.script.as_ref().map(|s| s.modified_at))
        .bind(record.script.as_ref().and_then(|s| s.snapshot.clone()))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(repo_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(repo_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn find_by_script_hash(&self, hash: &str) -> Result<Vec<SessionRecord>> {
        if hash.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE script_hash = $1 ORDER BY created_at",
        )
        .bind(hash)
        .fetch_all(&self.pool)
        .await
        .map_err(repo_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn find_by_script_path(&self, path: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE path = $1 LIMIT 1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(repo_err)?;
        row.as_ref().map(row_to_record).transpose()
    }
}
