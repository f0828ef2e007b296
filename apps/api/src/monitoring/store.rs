use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
#[cfg(test)]
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::AppError;
use crate::monitoring::models::{MonitoringTarget, ScanOutcome, TargetKind, TargetRow};
#[cfg(test)]
use crate::monitoring::models::ScanStatus;

#[async_trait]
pub trait MonitoringStore: Send + Sync {
    async fn list(&self, user_sub: &str) -> Result<Vec<MonitoringTarget>, AppError>;

    async fn count(&self, user_sub: &str) -> Result<u64, AppError>;

    /// Returns `None` when the user already monitors this value.
    async fn create(
        &self,
        user_sub: &str,
        kind: TargetKind,
        value: &str,
    ) -> Result<Option<MonitoringTarget>, AppError>;

    async fn delete(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError>;

    /// Marks one of the user's targets as scanning and returns it.
    async fn begin_scan(&self, user_sub: &str, id: Uuid)
        -> Result<Option<MonitoringTarget>, AppError>;

    /// Claims up to `limit` targets last scanned before `due_before` (or never),
    /// marking them as scanning. Scans stuck since before `stale_before` are
    /// reclaimed. Concurrent callers never receive the same target.
    async fn claim_due(
        &self,
        due_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MonitoringTarget>, AppError>;

    async fn finish_scan(
        &self,
        id: Uuid,
        outcome: &ScanOutcome,
    ) -> Result<Option<MonitoringTarget>, AppError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

const TARGET_COLUMNS: &str =
    "id, user_sub, kind, value, status, findings, last_error, last_scanned_at, created_at";

pub struct PgMonitoringStore {
    pool: PgPool,
}

impl PgMonitoringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn convert(rows: Vec<TargetRow>) -> Result<Vec<MonitoringTarget>, AppError> {
    rows.into_iter()
        .map(|r| MonitoringTarget::try_from(r).map_err(AppError::Internal))
        .collect()
}

fn convert_one(row: Option<TargetRow>) -> Result<Option<MonitoringTarget>, AppError> {
    row.map(MonitoringTarget::try_from)
        .transpose()
        .map_err(AppError::Internal)
}

#[async_trait]
impl MonitoringStore for PgMonitoringStore {
    async fn list(&self, user_sub: &str) -> Result<Vec<MonitoringTarget>, AppError> {
        let rows: Vec<TargetRow> = sqlx::query_as(&format!(
            "SELECT {TARGET_COLUMNS} FROM monitoring_targets \
             WHERE user_sub = $1 ORDER BY created_at"
        ))
        .bind(user_sub)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn count(&self, user_sub: &str) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM monitoring_targets WHERE user_sub = $1")
                .bind(user_sub)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn create(
        &self,
        user_sub: &str,
        kind: TargetKind,
        value: &str,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let row: Option<TargetRow> = sqlx::query_as(&format!(
            "INSERT INTO monitoring_targets (id, user_sub, kind, value) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_sub, kind, value) DO NOTHING \
             RETURNING {TARGET_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_sub)
        .bind(kind.as_str())
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        convert_one(row)
    }

    async fn delete(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM monitoring_targets WHERE id = $1 AND user_sub = $2")
            .bind(id)
            .bind(user_sub)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin_scan(
        &self,
        user_sub: &str,
        id: Uuid,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let row: Option<TargetRow> = sqlx::query_as(&format!(
            "UPDATE monitoring_targets \
             SET status = 'scanning', scan_started_at = now() \
             WHERE id = $1 AND user_sub = $2 \
             RETURNING {TARGET_COLUMNS}"
        ))
        .bind(id)
        .bind(user_sub)
        .fetch_optional(&self.pool)
        .await?;
        convert_one(row)
    }

    async fn claim_due(
        &self,
        due_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MonitoringTarget>, AppError> {
        let rows: Vec<TargetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE monitoring_targets
            SET status = 'scanning', scan_started_at = now()
            WHERE id IN (
                SELECT id FROM monitoring_targets
                WHERE (last_scanned_at IS NULL OR last_scanned_at < $1)
                  AND (status <> 'scanning' OR scan_started_at < $2)
                ORDER BY last_scanned_at NULLS FIRST
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TARGET_COLUMNS}
            "#
        ))
        .bind(due_before)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn finish_scan(
        &self,
        id: Uuid,
        outcome: &ScanOutcome,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let row: Option<TargetRow> = sqlx::query_as(&format!(
            "UPDATE monitoring_targets \
             SET status = $2, findings = COALESCE($3, findings), last_error = $4, \
                 last_scanned_at = now(), scan_started_at = NULL \
             WHERE id = $1 \
             RETURNING {TARGET_COLUMNS}"
        ))
        .bind(id)
        .bind(outcome.status().as_str())
        .bind(outcome.findings())
        .bind(outcome.error())
        .fetch_optional(&self.pool)
        .await?;
        convert_one(row)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
struct StoredTarget {
    target: MonitoringTarget,
    scan_started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryMonitoringStore {
    targets: RwLock<Vec<StoredTarget>>,
}

#[cfg(test)]
impl InMemoryMonitoringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: pretends the target was last scanned at `at`.
    pub async fn set_last_scanned(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(stored) = self
            .targets
            .write()
            .await
            .iter_mut()
            .find(|s| s.target.id == id)
        {
            stored.target.last_scanned_at = Some(at);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl MonitoringStore for InMemoryMonitoringStore {
    async fn list(&self, user_sub: &str) -> Result<Vec<MonitoringTarget>, AppError> {
        Ok(self
            .targets
            .read()
            .await
            .iter()
            .filter(|s| s.target.user_sub == user_sub)
            .map(|s| s.target.clone())
            .collect())
    }

    async fn count(&self, user_sub: &str) -> Result<u64, AppError> {
        Ok(self
            .targets
            .read()
            .await
            .iter()
            .filter(|s| s.target.user_sub == user_sub)
            .count() as u64)
    }

    async fn create(
        &self,
        user_sub: &str,
        kind: TargetKind,
        value: &str,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let mut targets = self.targets.write().await;
        if targets.iter().any(|s| {
            s.target.user_sub == user_sub && s.target.kind == kind && s.target.value == value
        }) {
            return Ok(None);
        }
        let target = MonitoringTarget {
            id: Uuid::new_v4(),
            user_sub: user_sub.to_string(),
            kind,
            value: value.to_string(),
            status: ScanStatus::Pending,
            findings: 0,
            last_error: None,
            last_scanned_at: None,
            created_at: Utc::now(),
        };
        targets.push(StoredTarget {
            target: target.clone(),
            scan_started_at: None,
        });
        Ok(Some(target))
    }

    async fn delete(&self, user_sub: &str, id: Uuid) -> Result<bool, AppError> {
        let mut targets = self.targets.write().await;
        let before = targets.len();
        targets.retain(|s| !(s.target.user_sub == user_sub && s.target.id == id));
        Ok(targets.len() < before)
    }

    async fn begin_scan(
        &self,
        user_sub: &str,
        id: Uuid,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let mut targets = self.targets.write().await;
        Ok(targets
            .iter_mut()
            .find(|s| s.target.user_sub == user_sub && s.target.id == id)
            .map(|s| {
                s.target.status = ScanStatus::Scanning;
                s.scan_started_at = Some(Utc::now());
                s.target.clone()
            }))
    }

    async fn claim_due(
        &self,
        due_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MonitoringTarget>, AppError> {
        let mut targets = self.targets.write().await;
        let now = Utc::now();
        let mut due: Vec<&mut StoredTarget> = targets
            .iter_mut()
            .filter(|s| s.target.last_scanned_at.map_or(true, |t| t < due_before))
            .filter(|s| {
                s.target.status != ScanStatus::Scanning
                    || s.scan_started_at.map_or(true, |t| t < stale_before)
            })
            .collect();
        due.sort_by_key(|s| s.target.last_scanned_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| {
                s.target.status = ScanStatus::Scanning;
                s.scan_started_at = Some(now);
                s.target.clone()
            })
            .collect())
    }

    async fn finish_scan(
        &self,
        id: Uuid,
        outcome: &ScanOutcome,
    ) -> Result<Option<MonitoringTarget>, AppError> {
        let mut targets = self.targets.write().await;
        Ok(targets.iter_mut().find(|s| s.target.id == id).map(|s| {
            s.target.status = outcome.status();
            if let Some(n) = outcome.findings() {
                s.target.findings = n;
            }
            s.target.last_error = outcome.error().map(str::to_string);
            s.target.last_scanned_at = Some(Utc::now());
            s.scan_started_at = None;
            s.target.clone()
        }))
    }
}
