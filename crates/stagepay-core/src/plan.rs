use crate::error::StagePayError;
use crate::lifecycle::initial_status;
use crate::types::{PaymentStage, ProjectId, StageId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One stage of a payment plan as supplied by the plan creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage_name: String,
    pub stage_percentage: Decimal,
    pub amount: Decimal,
    pub required_progress: u8,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl StageDefinition {
    pub fn new(
        stage_name: impl Into<String>,
        stage_percentage: Decimal,
        amount: Decimal,
        required_progress: u8,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            stage_percentage,
            amount,
            required_progress,
            due_date: None,
        }
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }
}

/// Checks a plan before any stage is created.
pub fn validate_plan(definitions: &[StageDefinition]) -> Result<(), StagePayError> {
    if definitions.is_empty() {
        return Err(StagePayError::InvalidPlan(
            "a plan needs at least one stage".to_string(),
        ));
    }

    let hundred = Decimal::ONE_HUNDRED;
    let mut total = Decimal::ZERO;
    for (index, definition) in definitions.iter().enumerate() {
        if definition.stage_name.trim().is_empty() {
            return Err(StagePayError::InvalidPlan(format!(
                "stage #{index} has an empty name"
            )));
        }
        if definition.stage_percentage.is_sign_negative() || definition.stage_percentage > hundred
        {
            return Err(StagePayError::InvalidPlan(format!(
                "stage '{}' percentage {} is outside 0..=100",
                definition.stage_name, definition.stage_percentage
            )));
        }
        if definition.amount.is_sign_negative() && !definition.amount.is_zero() {
            return Err(StagePayError::InvalidPlan(format!(
                "stage '{}' has negative amount {}",
                definition.stage_name, definition.amount
            )));
        }
        if definition.required_progress > 100 {
            return Err(StagePayError::InvalidPlan(format!(
                "stage '{}' requires progress {} above 100",
                definition.stage_name, definition.required_progress
            )));
        }
        total += definition.stage_percentage;
    }

    if total != hundred {
        return Err(StagePayError::InvalidPlan(format!(
            "stage percentages sum to {total}, expected 100"
        )));
    }

    Ok(())
}

/// Materializes validated definitions into stage records.
pub fn build_stages(
    project_id: &ProjectId,
    project_progress: u8,
    definitions: Vec<StageDefinition>,
    created_at: DateTime<Utc>,
) -> Vec<PaymentStage> {
    definitions
        .into_iter()
        .map(|definition| PaymentStage {
            id: StageId::new(),
            project_id: project_id.clone(),
            stage_name: definition.stage_name,
            stage_percentage: definition.stage_percentage,
            amount: definition.amount,
            required_progress: definition.required_progress,
            status: initial_status(project_progress, definition.required_progress),
            payment_link: None,
            external_payment_reference: None,
            due_date: definition.due_date,
            paid_date: None,
            created_at,
            revision: 0,
        })
        .collect()
}
