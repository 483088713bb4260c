use crate::issuer::IssuerError;
use crate::store::StoreError;
use crate::types::{StageId, StageStatus};
use thiserror::Error;

/// StagePay engine errors.
///
/// Every variant is raised before anything is committed, so a failed
/// operation always leaves the stage exactly as it was.
#[derive(Debug, Error)]
pub enum StagePayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("stage {stage_id} is pending and cannot be {action} until unlocked")]
    StageNotReady {
        stage_id: StageId,
        action: &'static str,
    },

    #[error("stage {stage_id} cannot be {action} from status '{from}'")]
    InvalidTransition {
        stage_id: StageId,
        from: StageStatus,
        action: &'static str,
    },

    #[error("stage {0} already has a payment link")]
    AlreadyIssued(StageId),

    #[error("payment link issuance failed: {0}")]
    LinkIssuanceFailed(#[from] IssuerError),

    #[error("invalid payment plan: {0}")]
    InvalidPlan(String),

    #[error("project '{0}' already has a payment plan")]
    PlanExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("stage {stage_id} kept changing underneath {attempts} update attempts")]
    Contention { stage_id: StageId, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl StagePayError {
    pub fn stage_not_found(stage_id: &StageId) -> Self {
        Self::NotFound(format!("payment stage '{}'", stage_id))
    }

    pub fn project_not_found(project_id: &str) -> Self {
        Self::NotFound(format!("project '{}' has no payment stages", project_id))
    }

    /// Stable machine-readable code, used by transports to report failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::StageNotReady { .. } => "stage_not_ready",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyIssued(_) => "already_issued",
            Self::LinkIssuanceFailed(IssuerError::Unavailable(_)) => "issuer_unavailable",
            Self::LinkIssuanceFailed(IssuerError::Rejected(_)) => "issuer_rejected",
            Self::InvalidPlan(_) => "invalid_plan",
            Self::PlanExists(_) => "plan_exists",
            Self::InvalidInput(_) => "invalid_input",
            Self::Contention { .. } => "contention",
            Self::Storage(_) => "storage",
        }
    }

    /// True when the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LinkIssuanceFailed(IssuerError::Unavailable(_)) | Self::Contention { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_failures_keep_their_cause_in_the_code() {
        let unavailable = StagePayError::from(IssuerError::Unavailable("timeout".to_string()));
        let rejected = StagePayError::from(IssuerError::Rejected("bad amount".to_string()));

        assert_eq!(unavailable.code(), "issuer_unavailable");
        assert!(unavailable.is_retryable());
        assert_eq!(rejected.code(), "issuer_rejected");
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("bad amount"));
    }

    #[test]
    fn invalid_transition_message_names_the_status() {
        let err = StagePayError::InvalidTransition {
            stage_id: StageId::new(),
            from: StageStatus::Paid,
            action: "marked paid",
        };
        assert!(err.to_string().contains("from status 'paid'"));
        assert_eq!(err.code(), "invalid_transition");
    }
}
