// ABOUTME: Storage layer for sandbox and snapshot metadata
// ABOUTME: Keyed CRUD over SQLite used by the manager for status, heartbeats and snapshot lookups

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp '{value}' in column {column}")]
    InvalidTimestamp { column: String, value: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Terminated,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "terminated" => Ok(Self::Terminated),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub tenant_id: String,
    pub owner_id: String,
    pub directory_path: String,
    pub knowledge_path: Option<String>,
    pub status: SandboxStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub sandbox_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub storage_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

const SANDBOX_COLUMNS: &str = "id, tenant_id, owner_id, directory_path, knowledge_path, status, \
                               pid, port, created_at, last_heartbeat, terminated_at";

const SNAPSHOT_COLUMNS: &str =
    "id, sandbox_id, session_id, tenant_id, storage_path, size_bytes, created_at";

pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    pub async fn create_sandbox(&self, mut sandbox: Sandbox) -> Result<Sandbox> {
        if sandbox.id.is_empty() {
            sandbox.id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        }

        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, tenant_id, owner_id, directory_path, knowledge_path, status,
                pid, port, created_at, last_heartbeat, terminated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.tenant_id)
        .bind(&sandbox.owner_id)
        .bind(&sandbox.directory_path)
        .bind(&sandbox.knowledge_path)
        .bind(sandbox.status.as_str())
        .bind(sandbox.pid.map(|p| p as i64))
        .bind(sandbox.port.map(|p| p as i32))
        .bind(sandbox.created_at.to_rfc3339())
        .bind(sandbox.last_heartbeat.map(|d| d.to_rfc3339()))
        .bind(sandbox.terminated_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(sandbox)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let row = sqlx::query(&format!("SELECT {} FROM sandboxes WHERE id = ?1", SANDBOX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_sandbox(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    pub async fn list_sandboxes(
        &self,
        tenant_id: Option<&str>,
        status: Option<SandboxStatus>,
    ) -> Result<Vec<Sandbox>> {
        let mut query = format!("SELECT {} FROM sandboxes WHERE 1=1", SANDBOX_COLUMNS);

        let mut param_count = 0;
        if tenant_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND tenant_id = ?{}", param_count));
        }
        if status.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND status = ?{}", param_count));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        if let Some(tid) = tenant_id {
            q = q.bind(tid);
        }
        if let Some(s) = &status {
            q = q.bind(s.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_sandbox).collect()
    }

    pub async fn count_running_for_tenant(&self, tenant_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sandboxes WHERE tenant_id = ?1 AND status = ?2",
        )
        .bind(tenant_id)
        .bind(SandboxStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }

    pub async fn update_status(&self, id: &str, status: SandboxStatus) -> Result<()> {
        let terminated_at = match status {
            SandboxStatus::Terminated => Some(Utc::now().to_rfc3339()),
            SandboxStatus::Running => None,
        };

        let result = sqlx::query(
            "UPDATE sandboxes SET status = ?1, terminated_at = COALESCE(?2, terminated_at) WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(terminated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    pub async fn update_heartbeat(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sandboxes SET last_heartbeat = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    pub async fn update_process_info(&self, id: &str, pid: Option<u32>, port: Option<u16>) -> Result<()> {
        let result = sqlx::query("UPDATE sandboxes SET pid = ?1, port = ?2 WHERE id = ?3")
            .bind(pid.map(|p| p as i64))
            .bind(port.map(|p| p as i32))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    // ========================================================================
    // SNAPSHOT OPERATIONS
    // ========================================================================

    pub async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        sqlx::query(
            r#"
            INSERT INTO sandbox_snapshots (
                id, sandbox_id, session_id, tenant_id, storage_path, size_bytes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.sandbox_id)
        .bind(&snapshot.session_id)
        .bind(&snapshot.tenant_id)
        .bind(&snapshot.storage_path)
        .bind(snapshot.size_bytes as i64)
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(snapshot)
    }

    pub async fn get_latest_snapshot_for_session(&self, session_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandbox_snapshots WHERE session_id = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_snapshot).transpose()
    }

    pub async fn list_snapshots_for_session(&self, session_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sandbox_snapshots WHERE session_id = ?1 \
             ORDER BY created_at DESC, rowid DESC",
            SNAPSHOT_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_snapshot).collect()
    }
}

// ========================================================================
// HELPER METHODS
// ========================================================================

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp {
            column: column.to_string(),
            value: value.to_string(),
        })
}

fn parse_optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.get::<Option<String>, _>(column)
        .map(|s| parse_timestamp(column, &s))
        .transpose()
}

fn row_to_sandbox(row: SqliteRow) -> Result<Sandbox> {
    Ok(Sandbox {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        owner_id: row.get("owner_id"),
        directory_path: row.get("directory_path"),
        knowledge_path: row.get("knowledge_path"),
        status: SandboxStatus::from_str(&row.get::<String, _>("status"))?,
        pid: row.get::<Option<i64>, _>("pid").map(|p| p as u32),
        port: row.get::<Option<i32>, _>("port").map(|p| p as u16),
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        last_heartbeat: parse_optional_timestamp(&row, "last_heartbeat")?,
        terminated_at: parse_optional_timestamp(&row, "terminated_at")?,
    })
}

fn row_to_snapshot(row: SqliteRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        session_id: row.get("session_id"),
        tenant_id: row.get("tenant_id"),
        storage_path: row.get("storage_path"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
    })
}
