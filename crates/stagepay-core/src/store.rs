//! Stage Store: the only stateful component.
//!
//! Backends own stage records exclusively. The engine never overwrites a
//! record blindly; it reads, computes the next state, and writes it back with
//! [`StageStore::compare_and_swap`] so concurrent writers cannot lose updates.

use crate::postgres::PostgresStageStore;
use crate::types::{sort_in_plan_order, PaymentStage, ProjectId, StageId, StageStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable keyed storage of payment stages and project progress.
#[async_trait]
pub trait StageStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Insert a project's whole plan atomically.
    ///
    /// Fails with `Conflict` if the project already has a plan or any stage id
    /// already exists; in that case nothing is written.
    async fn insert_plan(&self, project_id: &ProjectId, stages: &[PaymentStage])
        -> StoreResult<()>;

    async fn get_stage(&self, stage_id: &StageId) -> StoreResult<Option<PaymentStage>>;

    /// All stages of a project in plan order.
    async fn list_project_stages(&self, project_id: &ProjectId)
        -> StoreResult<Vec<PaymentStage>>;

    async fn list_stages_with_status(&self, status: StageStatus)
        -> StoreResult<Vec<PaymentStage>>;

    /// Replace the stored record with `next` only if its revision still equals
    /// `expected_revision`. Returns the stored record with its bumped revision.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: PaymentStage,
    ) -> StoreResult<PaymentStage>;

    async fn project_progress(&self, project_id: &ProjectId) -> StoreResult<Option<u8>>;

    /// Last writer wins: a lower value than the stored one is recorded as is.
    /// Stages already unlocked are unaffected by a regression.
    async fn set_project_progress(&self, project_id: &ProjectId, progress: u8)
        -> StoreResult<()>;
}

/// Stage store backend selection.
#[derive(Debug, Clone, Default)]
pub enum StageStorageConfig {
    /// Keep stages in process memory only.
    #[default]
    Memory,
    /// Persist stages in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StageStorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Open the configured backend, creating the PostgreSQL schema if needed.
pub async fn bootstrap_store(config: StageStorageConfig) -> StoreResult<Arc<dyn StageStore>> {
    match config {
        StageStorageConfig::Memory => Ok(Arc::new(InMemoryStageStore::new())),
        StageStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresStageStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// In-memory stage store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStageStore {
    stages: RwLock<HashMap<StageId, PaymentStage>>,
    progress: RwLock<HashMap<ProjectId, u8>>,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
    fn backend_label(&self) -> &'static str {
        "memory"
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

        let mut guard = self
            .stages
            .write()
            .map_err(|_| StoreError::Backend("stages lock poisoned".to_string()))?;

        if guard.values().any(|stage| &stage.project_id == project_id) {
            return Err(StoreError::Conflict(format!(
                "project '{}' already has a payment plan",
                project_id
            )));
        }
        if let Some(existing) = stages.iter().find(|stage| guard.contains_key(&stage.id)) {
            return Err(StoreError::Conflict(format!(
                "payment stage {} already exists",
                existing.id
            )));
        }

        for stage in stages {
            guard.insert(stage.id, stage.clone());
        }
        Ok(())
    }

    async fn get_stage(&self, stage_id: &StageId) -> StoreResult<Option<PaymentStage>> {
        let guard = self
            .stages
            .read()
            .map_err(|_| StoreError::Backend("stages lock poisoned".to_string()))?;
        Ok(guard.get(stage_id).cloned())
    }

    async fn list_project_stages(
        &self,
        project_id: &ProjectId,
    ) -> StoreResult<Vec<PaymentStage>> {
        let guard = self
            .stages
            .read()
            .map_err(|_| StoreError::Backend("stages lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|stage| &stage.project_id == project_id)
            .cloned()
            .collect::<Vec<_>>();
        sort_in_plan_order(&mut values);
        Ok(values)
    }

    async fn list_stages_with_status(
        &self,
        status: StageStatus,
    ) -> StoreResult<Vec<PaymentStage>> {
        let guard = self
            .stages
            .read()
            .map_err(|_| StoreError::Backend("stages lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|stage| stage.status == status)
            .cloned()
            .collect::<Vec<_>>();
        sort_in_plan_order(&mut values);
        Ok(values)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut next: PaymentStage,
    ) -> StoreResult<PaymentStage> {
        let mut guard = self
            .stages
            .write()
            .map_err(|_| StoreError::Backend("stages lock poisoned".to_string()))?;
        let current = guard
            .get_mut(&next.id)
            .ok_or_else(|| StoreError::NotFound(format!("payment stage {}", next.id)))?;

        if current.revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "payment stage {} is at revision {}, expected {}",
                next.id, current.revision, expected_revision
            )));
        }

        next.revision = expected_revision + 1;
        *current = next.clone();
        Ok(next)
    }

    async fn project_progress(&self, project_id: &ProjectId) -> StoreResult<Option<u8>> {
        let guard = self
            .progress
            .read()
            .map_err(|_| StoreError::Backend("progress lock poisoned".to_string()))?;
        Ok(guard.get(project_id).copied())
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
        let mut guard = self
            .progress
            .write()
            .map_err(|_| StoreError::Backend("progress lock poisoned".to_string()))?;
        guard.insert(project_id.clone(), progress);
        Ok(())
    }
}
