use crate::error::StagePayError;
use crate::issuer::{IssuedLink, IssuerError, LinkIssuer, LinkRequest};
use crate::lifecycle::{self, Transition, TransitionOutcome};
use crate::plan::{build_stages, validate_plan, StageDefinition};
use crate::store::{StageStore, StoreError};
use crate::types::{
    sort_in_plan_order, PaymentStage, ProjectId, ProjectPaymentSummary, StageId, StageStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

/// What `generate_payment_link` does when the stage already has a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkReissuePolicy {
    /// Return the stage with its existing link; the issuer is not called.
    #[default]
    ReturnExisting,
    /// Fail with `AlreadyIssued`.
    Reject,
}

/// Lifecycle engine configuration.
#[derive(Debug, Clone)]
pub struct StageEngineConfig {
    pub currency: String,
    pub issuer_timeout: Duration,
    pub link_reissue: LinkReissuePolicy,
    pub max_cas_attempts: u32,
}

impl Default for StageEngineConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            issuer_timeout: Duration::from_secs(10),
            link_reissue: LinkReissuePolicy::ReturnExisting,
            max_cas_attempts: 8,
        }
    }
}

/// Result of one overdue sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueSweep {
    pub swept_at: DateTime<Utc>,
    pub examined: usize,
    pub marked_overdue: Vec<StageId>,
}

/// Payment-stage lifecycle engine.
///
/// Every mutation is a read / pure-transition / compare-and-swap cycle against
/// the store, retried on conflict. Operations on different stages never wait
/// on each other; link issuance for the same stage is serialized so a stage is
/// never sent to the issuer twice at once.
pub struct StageEngine {
    store: Arc<dyn StageStore>,
    issuer: Arc<dyn LinkIssuer>,
    issuing: DashMap<StageId, Arc<AsyncMutex<()>>>,
    config: StageEngineConfig,
}

impl StageEngine {
    pub fn new(
        store: Arc<dyn StageStore>,
        issuer: Arc<dyn LinkIssuer>,
        config: StageEngineConfig,
    ) -> Self {
        Self {
            store,
            issuer,
            issuing: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &StageEngineConfig {
        &self.config
    }

    pub fn storage_backend(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn issuer_id(&self) -> &'static str {
        self.issuer.issuer_id()
    }

    /// Stages of a project ordered by ascending required progress. Read-only.
    pub async fn list_stages(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<PaymentStage>, StagePayError> {
        let mut stages = self.store.list_project_stages(project_id).await?;
        if stages.is_empty() {
            return Err(StagePayError::project_not_found(project_id.as_str()));
        }
        sort_in_plan_order(&mut stages);
        Ok(stages)
    }

    pub async fn get_stage(&self, stage_id: &StageId) -> Result<PaymentStage, StagePayError> {
        self.store
            .get_stage(stage_id)
            .await?
            .ok_or_else(|| StagePayError::stage_not_found(stage_id))
    }

    /// Create a project's payment plan. Stages the current progress already
    /// admits start out `available`.
    ///
    /// The plan is inserted atomically; a concurrent second plan for the same
    /// project fails with `PlanExists`. Progress is re-read after the insert so
    /// a report that raced with the plan still unlocks its stages.
    #[instrument(skip_all, fields(project_id = %project_id, stages = definitions.len()))]
    pub async fn define_plan(
        &self,
        project_id: &ProjectId,
        definitions: Vec<StageDefinition>,
    ) -> Result<Vec<PaymentStage>, StagePayError> {
        if project_id.as_str().trim().is_empty() {
            return Err(StagePayError::InvalidInput(
                "project id must not be empty".to_string(),
            ));
        }
        validate_plan(&definitions)?;

        let progress = self.store.project_progress(project_id).await?.unwrap_or(0);
        let stages = build_stages(project_id, progress, definitions, Utc::now());
        match self.store.insert_plan(project_id, &stages).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(StagePayError::PlanExists(project_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        let current = self.store.project_progress(project_id).await?.unwrap_or(0);
        let mut defined = Vec::with_capacity(stages.len());
        if current > progress {
            let transition = Transition::Unlock {
                project_progress: current,
            };
            for stage in stages {
                match self.commit(&stage.id, &transition).await? {
                    Some(unlocked) => {
                        debug!(stage_id = %unlocked.id, current, "stage unlocked by concurrent progress");
                        defined.push(unlocked);
                    }
                    None => defined.push(self.get_stage(&stage.id).await?),
                }
            }
        } else {
            defined = stages;
        }
        sort_in_plan_order(&mut defined);

        info!(progress = current, "payment plan defined");
        Ok(defined)
    }

    /// Record project progress and unlock every stage the gate now admits.
    ///
    /// Returns only the stages this call unlocked. Reporting a lower progress
    /// is recorded but never re-locks a stage.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn update_project_progress(
        &self,
        project_id: &ProjectId,
        progress: u8,
    ) -> Result<Vec<PaymentStage>, StagePayError> {
        if progress > 100 {
            return Err(StagePayError::InvalidInput(format!(
                "progress {progress} is outside 0..=100"
            )));
        }
        self.store.set_project_progress(project_id, progress).await?;

        let pending = self
            .store
            .list_project_stages(project_id)
            .await?
            .into_iter()
            .filter(|stage| stage.status == StageStatus::Pending);

        let transition = Transition::Unlock {
            project_progress: progress,
        };
        let mut unlocked = Vec::new();
        for stage in pending {
            if let Some(stage) = self.commit(&stage.id, &transition).await? {
                info!(stage_id = %stage.id, required = stage.required_progress, "stage unlocked");
                unlocked.push(stage);
            }
        }

        Ok(unlocked)
    }

    /// Issue a payment link for an unlocked, unpaid stage.
    ///
    /// Issuer failures (including timeouts) leave the stage untouched and are
    /// surfaced as `LinkIssuanceFailed`; the caller decides whether to retry.
    #[instrument(skip_all, fields(stage_id = %stage_id))]
    pub async fn generate_payment_link(
        &self,
        stage_id: &StageId,
    ) -> Result<PaymentStage, StagePayError> {
        let stage = self.get_stage(stage_id).await?;
        lifecycle::ensure_accepts_command(&stage, lifecycle::ATTACH_LINK)?;
        if stage.has_payment_link() {
            return self.existing_link(stage);
        }

        let issue_slot = self
            .issuing
            .entry(*stage_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let result = {
            let _serialized = issue_slot.lock().await;
            self.issue_serialized(stage_id).await
        };

        drop(issue_slot);
        self.issuing
            .remove_if(stage_id, |_, slot| Arc::strong_count(slot) == 1);

        result
    }

    /// Authoritative completion signal. Succeeds exactly once per stage.
    #[instrument(skip_all, fields(stage_id = %stage_id))]
    pub async fn mark_as_paid(&self, stage_id: &StageId) -> Result<PaymentStage, StagePayError> {
        let transition = Transition::MarkPaid { at: Utc::now() };
        let Some(stage) = self.commit(stage_id, &transition).await? else {
            let current = self.get_stage(stage_id).await?;
            return Err(StagePayError::InvalidTransition {
                stage_id: *stage_id,
                from: current.status,
                action: transition.action(),
            });
        };

        info!(amount = %stage.amount, "stage paid");
        Ok(stage)
    }

    /// Move every `available` stage whose due date has passed to `overdue`.
    /// Idempotent: overdue, paid and pending stages are never touched.
    #[instrument(skip(self))]
    pub async fn refresh_overdue_status(
        &self,
        now: DateTime<Utc>,
    ) -> Result<OverdueSweep, StagePayError> {
        let candidates = self
            .store
            .list_stages_with_status(StageStatus::Available)
            .await?;
        let examined = candidates.len();
        let transition = Transition::MarkOverdue { now };

        let mut marked_overdue = Vec::new();
        for stage in candidates.iter().filter(|stage| stage.is_past_due(now)) {
            match self.commit(&stage.id, &transition).await {
                Ok(Some(stage)) => {
                    info!(stage_id = %stage.id, due_date = ?stage.due_date, "stage overdue");
                    marked_overdue.push(stage.id);
                }
                Ok(None) => {}
                Err(StagePayError::NotFound(_)) => {
                    debug!(stage_id = %stage.id, "stage vanished during sweep");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(OverdueSweep {
            swept_at: now,
            examined,
            marked_overdue,
        })
    }

    pub async fn project_summary(
        &self,
        project_id: &ProjectId,
    ) -> Result<ProjectPaymentSummary, StagePayError> {
        let stages = self.list_stages(project_id).await?;
        let progress = self.store.project_progress(project_id).await?.unwrap_or(0);
        Ok(ProjectPaymentSummary::from_stages(
            project_id.clone(),
            progress,
            &stages,
        ))
    }

    /// Runs while holding the stage's issuance slot.
    async fn issue_serialized(&self, stage_id: &StageId) -> Result<PaymentStage, StagePayError> {
        let stage = self.get_stage(stage_id).await?;
        lifecycle::ensure_accepts_command(&stage, lifecycle::ATTACH_LINK)?;
        if stage.has_payment_link() {
            return self.existing_link(stage);
        }

        let request = LinkRequest::for_stage(&stage, self.config.currency.clone());
        let issued = self.issue_with_timeout(&request).await?;

        match self.commit(stage_id, &Transition::AttachLink(issued)).await {
            Ok(Some(stage)) => {
                info!(
                    external_reference = stage.external_payment_reference.as_deref().unwrap_or(""),
                    "payment link issued"
                );
                Ok(stage)
            }
            Ok(None) => self.get_stage(stage_id).await,
            Err(StagePayError::AlreadyIssued(_)) => {
                let current = self.get_stage(stage_id).await?;
                warn!("another writer attached a link first; discarding the new one");
                self.existing_link(current)
            }
            Err(err) => Err(err),
        }
    }

    async fn issue_with_timeout(&self, request: &LinkRequest) -> Result<IssuedLink, StagePayError> {
        let timeout = self.config.issuer_timeout;
        let outcome = tokio::time::timeout(timeout, self.issuer.issue_link(request)).await;

        let result = match outcome {
            Ok(result) => result.and_then(IssuedLink::validate),
            Err(_) => Err(IssuerError::Unavailable(format!(
                "no response within {} ms",
                timeout.as_millis()
            ))),
        };

        result.map_err(|err| {
            warn!(error = %err, "link issuance failed");
            StagePayError::LinkIssuanceFailed(err)
        })
    }

    fn existing_link(&self, stage: PaymentStage) -> Result<PaymentStage, StagePayError> {
        match self.config.link_reissue {
            LinkReissuePolicy::ReturnExisting => {
                debug!("payment link already issued; returning it");
                Ok(stage)
            }
            LinkReissuePolicy::Reject => Err(StagePayError::AlreadyIssued(stage.id)),
        }
    }

    /// Apply `transition` atomically. `Ok(None)` means the transition did not
    /// apply to the stage's current state and nothing was written.
    async fn commit(
        &self,
        stage_id: &StageId,
        transition: &Transition,
    ) -> Result<Option<PaymentStage>, StagePayError> {
        let attempts = self.config.max_cas_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.get_stage(stage_id).await?;
            let next = match lifecycle::apply(&current, transition)? {
                TransitionOutcome::Changed(next) => next,
                TransitionOutcome::Unchanged => return Ok(None),
            };

            match self.store.compare_and_swap(current.revision, next).await {
                Ok(saved) => return Ok(Some(saved)),
                Err(StoreError::Conflict(reason)) => {
                    debug!(%stage_id, attempt, %reason, "stage changed concurrently; retrying");
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(StagePayError::stage_not_found(stage_id));
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(%stage_id, attempts, "giving up after repeated compare-and-swap conflicts");
        Err(StagePayError::Contention {
            stage_id: *stage_id,
            attempts,
        })
    }
}
