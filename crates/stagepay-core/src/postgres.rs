//! PostgreSQL stage store.
//!
//! Monetary columns are TEXT holding the decimal's canonical string form, so
//! values round-trip exactly. The compare-and-swap is a single conditional
//! `UPDATE` guarded by the `revision` column. One plan per project is enforced
//! by the `project_plans` primary key, written in the same transaction as the
//! plan's stages.

use crate::store::{StageStore, StoreError, StoreResult};
use crate::types::{PaymentStage, ProjectId, StageId, StageStatus};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

const STAGE_COLUMNS: &str = r#"
    stage_id,
    project_id,
    stage_name,
    stage_percentage,
    amount,
    required_progress,
    status,
    payment_link,
    external_payment_reference,
    due_date,
    paid_date,
    created_at,
    revision
"#;

#[derive(Debug, Clone)]
pub struct PostgresStageStore {
    pool: PgPool,
}

impl PostgresStageStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_stages (
                stage_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                stage_name TEXT NOT NULL,
                stage_percentage TEXT NOT NULL,
                amount TEXT NOT NULL,
                required_progress SMALLINT NOT NULL,
                status TEXT NOT NULL,
                payment_link TEXT NULL,
                external_payment_reference TEXT NULL,
                due_date TIMESTAMPTZ NULL,
                paid_date TIMESTAMPTZ NULL,
                created_at TIMESTAMPTZ NOT NULL,
                revision BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_plans (
                project_id TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO project_plans (project_id, created_at)
            SELECT project_id, MIN(created_at) FROM payment_stages GROUP BY project_id
            ON CONFLICT (project_id) DO NOTHING
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres plan backfill failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_payment_stages_project_id ON payment_stages (project_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres index create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_payment_stages_status ON payment_stages (status)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres index create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_progress (
                project_id TEXT PRIMARY KEY,
                progress SMALLINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StageStore for PostgresStageStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_plan(
        &self,
        project_id: &ProjectId,
        stages: &[PaymentStage],
    ) -> StoreResult<()> {
        if let Some(stray) = stages.iter().find(|stage| &stage.project_id != project_id) {
            return Err(StoreError::InvalidInput(format!(
                "payment stage {} belongs to project '{}', not '{}'",
                stray.id, stray.project_id, project_id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(format!("postgres begin failed: {e}")))?;

        sqlx::query("INSERT INTO project_plans (project_id, created_at) VALUES ($1, $2)")
            .bind(project_id.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                    format!("project '{}' already has a payment plan", project_id),
                ),
                other => StoreError::Backend(format!("postgres plan insert failed: {other}")),
            })?;

        for stage in stages {
            sqlx::query(
                r#"
                INSERT INTO payment_stages (
                    stage_id,
                    project_id,
                    stage_name,
                    stage_percentage,
                    amount,
                    required_progress,
                    status,
                    payment_link,
                    external_payment_reference,
                    due_date,
                    paid_date,
                    created_at,
                    revision
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(stage.id.to_string())
            .bind(stage.project_id.as_str())
            .bind(&stage.stage_name)
            .bind(stage.stage_percentage.to_string())
            .bind(stage.amount.to_string())
            .bind(i16::from(stage.required_progress))
            .bind(stage.status.as_str())
            .bind(&stage.payment_link)
            .bind(&stage.external_payment_reference)
            .bind(stage.due_date)
            .bind(stage.paid_date)
            .bind(stage.created_at)
            .bind(revision_to_db(stage.revision)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                    format!("payment stage {} already exists", stage.id),
                ),
                other => StoreError::Backend(format!("postgres insert failed: {other}")),
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(format!("postgres commit failed: {e}")))
    }

    async fn get_stage(&self, stage_id: &StageId) -> StoreResult<Option<PaymentStage>> {
        let row = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM payment_stages WHERE stage_id = $1"
        ))
        .bind(stage_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres load failed: {e}")))?;

        row.as_ref().map(row_to_stage).transpose()
    }

    async fn list_project_stages(
        &self,
        project_id: &ProjectId,
    ) -> StoreResult<Vec<PaymentStage>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM payment_stages WHERE project_id = $1 \
             ORDER BY required_progress ASC, created_at ASC, stage_id ASC"
        ))
        .bind(project_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres load failed: {e}")))?;

        rows.iter().map(row_to_stage).collect()
    }

    async fn list_stages_with_status(
        &self,
        status: StageStatus,
    ) -> StoreResult<Vec<PaymentStage>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGE_COLUMNS} FROM payment_stages WHERE status = $1 \
             ORDER BY required_progress ASC, created_at ASC, stage_id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres load failed: {e}")))?;

        rows.iter().map(row_to_stage).collect()
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut next: PaymentStage,
    ) -> StoreResult<PaymentStage> {
        let next_revision = expected_revision + 1;
        let result = sqlx::query(
            r#"
            UPDATE payment_stages
            SET status = $3,
                payment_link = $4,
                external_payment_reference = $5,
                due_date = $6,
                paid_date = $7,
                revision = $8
            WHERE stage_id = $1 AND revision = $2
            "#,
        )
        .bind(next.id.to_string())
        .bind(revision_to_db(expected_revision)?)
        .bind(next.status.as_str())
        .bind(&next.payment_link)
        .bind(&next.external_payment_reference)
        .bind(next.due_date)
        .bind(next.paid_date)
        .bind(revision_to_db(next_revision)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres update failed: {e}")))?;

        if result.rows_affected() == 1 {
            next.revision = next_revision;
            return Ok(next);
        }

        match self.get_stage(&next.id).await? {
            Some(current) => Err(StoreError::Conflict(format!(
                "payment stage {} is at revision {}, expected {}",
                next.id, current.revision, expected_revision
            ))),
            None => Err(StoreError::NotFound(format!("payment stage {}", next.id))),
        }
    }

    async fn project_progress(&self, project_id: &ProjectId) -> StoreResult<Option<u8>> {
        let row = sqlx::query("SELECT progress FROM project_progress WHERE project_id = $1")
            .bind(project_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres load failed: {e}")))?;

        match row {
            Some(row) => {
                let progress: i16 = row.try_get("progress").map_err(|e| {
                    StoreError::Serialization(format!("postgres decode progress failed: {e}"))
                })?;
                Ok(Some(progress_from_db(progress)?))
            }
            None => Ok(None),
        }
    }

    async fn set_project_progress(
        &self,
        project_id: &ProjectId,
        progress: u8,
    ) -> StoreResult<()> {
        if progress > 100 {
            return Err(StoreError::InvalidInput(format!(
                "progress {progress} exceeds 100"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO project_progress (project_id, progress, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id)
            DO UPDATE SET progress = EXCLUDED.progress, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(project_id.as_str())
        .bind(i16::from(progress))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres upsert failed: {e}")))?;

        Ok(())
    }
}

fn row_to_stage(row: &PgRow) -> StoreResult<PaymentStage> {
    let decode = |column: &str, e: sqlx::Error| {
        StoreError::Serialization(format!("postgres decode {column} failed: {e}"))
    };

    let stage_id: String = row.try_get("stage_id").map_err(|e| decode("stage_id", e))?;
    let project_id: String = row
        .try_get("project_id")
        .map_err(|e| decode("project_id", e))?;
    let stage_percentage: String = row
        .try_get("stage_percentage")
        .map_err(|e| decode("stage_percentage", e))?;
    let amount: String = row.try_get("amount").map_err(|e| decode("amount", e))?;
    let required_progress: i16 = row
        .try_get("required_progress")
        .map_err(|e| decode("required_progress", e))?;
    let status: String = row.try_get("status").map_err(|e| decode("status", e))?;
    let revision: i64 = row.try_get("revision").map_err(|e| decode("revision", e))?;

    Ok(PaymentStage {
        id: parse_stage_id(&stage_id)?,
        project_id: ProjectId::new(project_id),
        stage_name: row
            .try_get("stage_name")
            .map_err(|e| decode("stage_name", e))?,
        stage_percentage: parse_decimal("stage_percentage", &stage_percentage)?,
        amount: parse_decimal("amount", &amount)?,
        required_progress: progress_from_db(required_progress)?,
        status: parse_status(&status)?,
        payment_link: row
            .try_get("payment_link")
            .map_err(|e| decode("payment_link", e))?,
        external_payment_reference: row
            .try_get("external_payment_reference")
            .map_err(|e| decode("external_payment_reference", e))?,
        due_date: row.try_get("due_date").map_err(|e| decode("due_date", e))?,
        paid_date: row.try_get("paid_date").map_err(|e| decode("paid_date", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| decode("created_at", e))?,
        revision: revision_from_db(revision)?,
    })
}

fn parse_stage_id(value: &str) -> StoreResult<StageId> {
    value
        .parse()
        .map_err(|e| StoreError::Serialization(format!("invalid stage id '{value}': {e}")))
}

fn parse_decimal(column: &str, value: &str) -> StoreResult<Decimal> {
    value.parse::<Decimal>().map_err(|e| {
        StoreError::Serialization(format!("invalid decimal '{value}' in {column}: {e}"))
    })
}

fn parse_status(value: &str) -> StoreResult<StageStatus> {
    value.parse().map_err(StoreError::Serialization)
}

fn progress_from_db(value: i16) -> StoreResult<u8> {
    u8::try_from(value)
        .ok()
        .filter(|progress| *progress <= 100)
        .ok_or_else(|| StoreError::Serialization(format!("progress {value} out of range")))
}

fn revision_to_db(revision: u64) -> StoreResult<i64> {
    i64::try_from(revision)
        .map_err(|_| StoreError::InvalidInput("revision exceeds postgres BIGINT range".to_string()))
}

fn revision_from_db(revision: i64) -> StoreResult<u64> {
    u64::try_from(revision)
        .map_err(|_| StoreError::Serialization("negative revision in storage".to_string()))
}
