use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique, immutable payment stage identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(Uuid);

impl StageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for StageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for StageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owning project reference. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a payment stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Available,
    Paid,
    Overdue,
}

impl StageStatus {
    pub const ALL: [StageStatus; 4] = [
        StageStatus::Pending,
        StageStatus::Available,
        StageStatus::Paid,
        StageStatus::Overdue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
        }
    }

    /// Unlocked but not yet paid.
    pub fn is_payable(self) -> bool {
        matches!(self, Self::Available | Self::Overdue)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "available" => Ok(Self::Available),
            "paid" => Ok(Self::Paid),
            "overdue" => Ok(Self::Overdue),
            other => Err(format!("unknown stage status '{other}'")),
        }
    }
}

/// One milestone within a project's payment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStage {
    pub id: StageId,
    pub project_id: ProjectId,
    pub stage_name: String,
    /// Share of the total project value, 0..=100.
    pub stage_percentage: Decimal,
    pub amount: Decimal,
    /// Project progress percentage (0..=100) required before the stage is payable.
    pub required_progress: u8,
    pub status: StageStatus,
    pub payment_link: Option<String>,
    #[serde(alias = "mercado_pago_id")]
    pub external_payment_reference: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub paid_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Store-managed write counter used for compare-and-swap updates.
    #[serde(default)]
    pub revision: u64,
}

impl PaymentStage {
    pub fn has_payment_link(&self) -> bool {
        self.payment_link
            .as_deref()
            .map(|link| !link.is_empty())
            .unwrap_or(false)
    }

    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map(|due| now > due).unwrap_or(false)
    }

    /// Lists every violated record invariant. Empty for a well-formed stage.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if (self.status == StageStatus::Paid) != self.paid_date.is_some() {
            violations.push(format!(
                "paid_date presence ({}) disagrees with status '{}'",
                self.paid_date.is_some(),
                self.status
            ));
        }
        if self.has_payment_link() && self.status == StageStatus::Pending {
            violations.push("pending stage carries a payment link".to_string());
        }
        if self.has_payment_link() != self.external_payment_reference.is_some() {
            violations.push("payment link and external reference must be set together".to_string());
        }
        if self.status == StageStatus::Overdue && self.due_date.is_none() {
            violations.push("overdue stage has no due date".to_string());
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            violations.push(format!("negative amount {}", self.amount));
        }
        if self.required_progress > 100 {
            violations.push(format!(
                "required_progress {} exceeds 100",
                self.required_progress
            ));
        }

        violations
    }
}

/// Orders stages the way a plan is presented: by unlock threshold.
pub fn sort_in_plan_order(stages: &mut [PaymentStage]) {
    stages.sort_by(|a, b| {
        a.required_progress
            .cmp(&b.required_progress)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Aggregate payment position of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPaymentSummary {
    pub project_id: ProjectId,
    pub progress: u8,
    pub stage_count: usize,
    pub pending_count: usize,
    pub available_count: usize,
    pub overdue_count: usize,
    pub paid_count: usize,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub overdue_amount: Decimal,
    pub next_payable_stage: Option<StageId>,
}

impl ProjectPaymentSummary {
    /// `stages` must already be in plan order.
    pub fn from_stages(project_id: ProjectId, progress: u8, stages: &[PaymentStage]) -> Self {
        let mut summary = Self {
            project_id,
            progress,
            stage_count: stages.len(),
            pending_count: 0,
            available_count: 0,
            overdue_count: 0,
            paid_count: 0,
            total_amount: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            outstanding_amount: Decimal::ZERO,
            overdue_amount: Decimal::ZERO,
            next_payable_stage: None,
        };

        for stage in stages {
            summary.total_amount += stage.amount;
            match stage.status {
                StageStatus::Pending => {
                    summary.pending_count += 1;
                    summary.outstanding_amount += stage.amount;
                }
                StageStatus::Available => {
                    summary.available_count += 1;
                    summary.outstanding_amount += stage.amount;
                }
                StageStatus::Overdue => {
                    summary.overdue_count += 1;
                    summary.outstanding_amount += stage.amount;
                    summary.overdue_amount += stage.amount;
                }
                StageStatus::Paid => {
                    summary.paid_count += 1;
                    summary.paid_amount += stage.amount;
                }
            }
            if summary.next_payable_stage.is_none() && stage.status.is_payable() {
                summary.next_payable_stage = Some(stage.id);
            }
        }

        summary
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
            .single()
            .unwrap()
    }

    pub fn stage(required_progress: u8, status: StageStatus) -> PaymentStage {
        PaymentStage {
            id: StageId::new(),
            project_id: ProjectId::new("project-a"),
            stage_name: format!("stage at {required_progress}%"),
            stage_percentage: Decimal::new(25, 0),
            amount: Decimal::new(125_050, 2),
            required_progress,
            status,
            payment_link: None,
            external_payment_reference: None,
            due_date: None,
            paid_date: None,
            created_at: ts(2024, 1, 1),
            revision: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{stage, ts};
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in StageStatus::ALL {
            assert_eq!(status.as_str().parse::<StageStatus>().unwrap(), status);
        }
        assert!("settled".parse::<StageStatus>().is_err());
    }

    #[test]
    fn amount_serializes_as_decimal_string() {
        let stage = stage(50, StageStatus::Pending);
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["amount"], serde_json::json!("1250.50"));
        assert_eq!(value["status"], serde_json::json!("pending"));
    }

    #[test]
    fn legacy_processor_field_name_is_accepted() {
        let mut stage = stage(0, StageStatus::Available);
        stage.payment_link = Some("https://pay.example/x".to_string());
        stage.external_payment_reference = Some("pref-1".to_string());

        let mut value = serde_json::to_value(&stage).unwrap();
        let object = value.as_object_mut().unwrap();
        let reference = object.remove("external_payment_reference").unwrap();
        object.insert("mercado_pago_id".to_string(), reference);

        let decoded: PaymentStage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.external_payment_reference.as_deref(), Some("pref-1"));
    }

    #[test]
    fn invariants_flag_paid_without_date() {
        let mut stage = stage(0, StageStatus::Paid);
        assert_eq!(stage.invariant_violations().len(), 1);

        stage.paid_date = Some(ts(2024, 3, 1));
        assert!(stage.invariant_violations().is_empty());
    }

    #[test]
    fn plan_order_sorts_by_required_progress() {
        let mut stages = vec![
            stage(75, StageStatus::Pending),
            stage(0, StageStatus::Available),
            stage(50, StageStatus::Pending),
        ];
        sort_in_plan_order(&mut stages);
        let order: Vec<u8> = stages.iter().map(|s| s.required_progress).collect();
        assert_eq!(order, vec![0, 50, 75]);
    }

    #[test]
    fn summary_splits_paid_and_outstanding() {
        let mut paid = stage(0, StageStatus::Paid);
        paid.paid_date = Some(ts(2024, 2, 1));
        let mut overdue = stage(25, StageStatus::Overdue);
        overdue.due_date = Some(ts(2024, 1, 15));
        let pending = stage(50, StageStatus::Pending);

        let summary = ProjectPaymentSummary::from_stages(
            ProjectId::new("project-a"),
            30,
            &[paid, overdue.clone(), pending],
        );

        assert_eq!(summary.stage_count, 3);
        assert_eq!(summary.paid_amount, Decimal::new(125_050, 2));
        assert_eq!(summary.outstanding_amount, Decimal::new(250_100, 2));
        assert_eq!(summary.overdue_amount, Decimal::new(125_050, 2));
        assert_eq!(summary.next_payable_stage, Some(overdue.id));
    }
}
