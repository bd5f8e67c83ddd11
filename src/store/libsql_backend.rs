//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::automation::model::{AutomationDefinition, AutomationStatus, RunRecord, RunStatus};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

const AUTOMATION_COLUMNS: &str = "id, name, task_description, profile_reference, headless, run_on_startup, cron_expression, enabled, last_status, last_run, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, automation_id, status, started_at, completed_at, result, error_message, analysis";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(raw: String, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("bad uuid in {column}: {e}")))
}

fn row_to_automation(row: &libsql::Row) -> Result<AutomationDefinition, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("automation id: {e}")))?;
    let status_str: String = row.get(8).unwrap_or_else(|_| "idle".to_string());
    let status: AutomationStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let last_run: Option<String> = row.get::<String>(9).ok();
    let created_str: String = row.get(10).unwrap_or_default();
    let updated_str: String = row.get(11).unwrap_or_default();

    Ok(AutomationDefinition {
        id: parse_uuid(id, "automations.id")?,
        name: row.get(1).unwrap_or_default(),
        task_description: row.get(2).unwrap_or_default(),
        profile_reference: row.get::<String>(3).ok(),
        headless: row.get::<i64>(4).unwrap_or(1) != 0,
        run_on_startup: row.get::<i64>(5).unwrap_or(0) != 0,
        cron_expression: row.get::<String>(6).ok(),
        enabled: row.get::<i64>(7).unwrap_or(1) != 0,
        status,
        last_run_at: last_run.map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("run id: {e}")))?;
    let automation_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("run automation_id: {e}")))?;
    let status_str: String = row.get(2).unwrap_or_else(|_| "running".to_string());
    let status: RunStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let started_str: String = row.get(3).unwrap_or_default();
    let completed_str: Option<String> = row.get::<String>(4).ok();
    let result = match row.get::<String>(5).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        ),
        None => None,
    };

    Ok(RunRecord {
        id: parse_uuid(id, "automation_runs.id")?,
        automation_id: parse_uuid(automation_id, "automation_runs.automation_id")?,
        status,
        started_at: parse_datetime(&started_str),
        completed_at: completed_str.map(|s| parse_datetime(&s)),
        result,
        error_message: row.get::<String>(6).ok(),
        analysis: row.get::<String>(7).ok(),
    })
}

// ── Database impl ───────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(
        &self,
        automation: &AutomationDefinition,
    ) -> Result<(), DatabaseError> {
        let last_run: libsql::Value = match automation.last_run_at {
            Some(dt) => libsql::Value::Text(format_datetime(&dt)),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO automations ({AUTOMATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    automation.id.to_string(),
                    automation.name.clone(),
                    automation.task_description.clone(),
                    opt_text(automation.profile_reference.as_deref()),
                    automation.headless as i64,
                    automation.run_on_startup as i64,
                    opt_text(automation.cron_expression.as_deref()),
                    automation.enabled as i64,
                    automation.status.to_string(),
                    last_run,
                    format_datetime(&automation.created_at),
                    format_datetime(&automation.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_automation: {e}")))?;

        Ok(())
    }

    async fn get_automation(
        &self,
        id: Uuid,
    ) -> Result<Option<AutomationDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_automation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_automation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_automation: {e}"))),
        }
    }

    async fn list_automations(&self) -> Result<Vec<AutomationDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUTOMATION_COLUMNS} FROM automations ORDER BY name"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_automations: {e}")))?;

        let mut automations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_automation(&row) {
                Ok(a) => automations.push(a),
                Err(e) => tracing::warn!("Skipping automation row: {e}"),
            }
        }
        Ok(automations)
    }

    async fn update_automation(
        &self,
        automation: &AutomationDefinition,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE automations SET name=?1, task_description=?2, profile_reference=?3, headless=?4, run_on_startup=?5, cron_expression=?6, enabled=?7, updated_at=?8 WHERE id=?9",
                params![
                    automation.name.clone(),
                    automation.task_description.clone(),
                    opt_text(automation.profile_reference.as_deref()),
                    automation.headless as i64,
                    automation.run_on_startup as i64,
                    opt_text(automation.cron_expression.as_deref()),
                    automation.enabled as i64,
                    format_datetime(&Utc::now()),
                    automation.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_automation: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "automation".into(),
                id: automation.id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_automation(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM automations WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_automation: {e}")))?;
        Ok(count > 0)
    }

    async fn set_automation_status(
        &self,
        id: Uuid,
        status: AutomationStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE automations SET last_status=?1, updated_at=?2 WHERE id=?3",
                params![
                    status.to_string(),
                    format_datetime(&Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_automation_status: {e}")))?;
        Ok(())
    }

    async fn record_automation_run(
        &self,
        id: Uuid,
        status: AutomationStatus,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE automations SET last_status=?1, last_run=?2, updated_at=?3 WHERE id=?4",
                params![
                    status.to_string(),
                    format_datetime(&last_run_at),
                    format_datetime(&Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_automation_run: {e}")))?;
        Ok(())
    }

    async fn reset_automation_statuses(
        &self,
        from: AutomationStatus,
        to: AutomationStatus,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE automations SET last_status=?1, updated_at=?2 WHERE last_status=?3",
                params![
                    to.to_string(),
                    format_datetime(&Utc::now()),
                    from.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_automation_statuses: {e}")))?;
        Ok(count as usize)
    }

    // ── Run history ─────────────────────────────────────────────────

    async fn create_run(&self, run: &RunRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO automation_runs (id, automation_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.id.to_string(),
                    run.automation_id.to_string(),
                    run.status.to_string(),
                    format_datetime(&run.started_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_run: {e}")))?;
        Ok(())
    }

    async fn complete_run(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result_val = match result {
            Some(v) => libsql::Value::Text(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => libsql::Value::Null,
        };

        // The status guard makes completion first-writer-wins.
        let count = self
            .conn()
            .execute(
                "UPDATE automation_runs SET status=?1, completed_at=?2, result=?3, error_message=?4 WHERE id=?5 AND status='running'",
                params![
                    status.to_string(),
                    format_datetime(&completed_at),
                    result_val,
                    opt_text(error_message),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_run: {e}")))?;

        Ok(count > 0)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run: {e}"))),
        }
    }

    async fn list_runs(
        &self,
        automation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RunRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM automation_runs WHERE automation_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
                ),
                params![automation_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(r) => runs.push(r),
                Err(e) => tracing::warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }

    async fn set_run_analysis(&self, id: Uuid, analysis: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE automation_runs SET analysis=?1 WHERE id=?2",
                params![analysis, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_run_analysis: {e}")))?;
        Ok(count > 0)
    }

    async fn fail_running_runs(
        &self,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE automation_runs SET status='failed', completed_at=?1, error_message=?2 WHERE status='running'",
                params![format_datetime(&completed_at), error_message],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_running_runs: {e}")))?;
        Ok(count as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
