use crate::types::{PaymentStage, ProjectId, StageId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure reported by a link issuer. Both kinds are recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),

    #[error("issuer rejected request: {0}")]
    Rejected(String),
}

/// What the engine asks an issuer to mint a link for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub stage_id: StageId,
    pub project_id: ProjectId,
    pub amount: Decimal,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
}

impl LinkRequest {
    pub fn for_stage(stage: &PaymentStage, currency: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("project_id".to_string(), stage.project_id.to_string());
        metadata.insert("stage_name".to_string(), stage.stage_name.clone());
        metadata.insert(
            "stage_percentage".to_string(),
            stage.stage_percentage.to_string(),
        );

        Self {
            stage_id: stage.id,
            project_id: stage.project_id.clone(),
            amount: stage.amount,
            currency: currency.into(),
            metadata,
        }
    }
}

/// A payable URL plus the processor's reference used to reconcile confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedLink {
    pub link: String,
    pub external_reference: String,
}

impl IssuedLink {
    /// Blank links or references would break the link/reference invariant.
    pub fn validate(self) -> Result<Self, IssuerError> {
        if self.link.trim().is_empty() {
            return Err(IssuerError::Rejected("issuer returned an empty link".to_string()));
        }
        if self.external_reference.trim().is_empty() {
            return Err(IssuerError::Rejected(
                "issuer returned an empty external reference".to_string(),
            ));
        }
        Ok(self)
    }
}

/// External payment-processor capability that mints a payment link.
///
/// The engine bounds every call with a timeout and never retries on its own.
#[async_trait]
pub trait LinkIssuer: Send + Sync {
    fn issuer_id(&self) -> &'static str;

    async fn issue_link(&self, request: &LinkRequest) -> Result<IssuedLink, IssuerError>;
}
