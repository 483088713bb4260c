use crate::error::StagePayError;
use crate::gate::is_unlocked;
use crate::issuer::IssuedLink;
use crate::types::{PaymentStage, StageStatus};
use chrono::{DateTime, Utc};

/// A requested change to one payment stage.
///
/// Transitions are pure: [`apply`] never touches storage, it only decides what
/// the next record looks like. The engine commits the result with a
/// compare-and-swap and re-applies the same transition on conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Project progress was reported.
    Unlock { project_progress: u8 },
    /// The issuer minted a link for the stage.
    AttachLink(IssuedLink),
    /// Payment completion was confirmed.
    MarkPaid { at: DateTime<Utc> },
    /// Deadline check.
    MarkOverdue { now: DateTime<Utc> },
}

pub const UNLOCK: &str = "unlocked";
pub const ATTACH_LINK: &str = "given a payment link";
pub const MARK_PAID: &str = "marked paid";
pub const MARK_OVERDUE: &str = "marked overdue";

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Unlock { .. } => UNLOCK,
            Self::AttachLink(_) => ATTACH_LINK,
            Self::MarkPaid { .. } => MARK_PAID,
            Self::MarkOverdue { .. } => MARK_OVERDUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed(PaymentStage),
    /// The transition does not apply to the stage in its current state.
    Unchanged,
}

/// Decides the effect of `transition` on `stage`.
///
/// Sweeping triggers (`Unlock`, `MarkOverdue`) never fail: stages they do not
/// apply to come back `Unchanged`. Commands (`AttachLink`, `MarkPaid`) fail
/// when the stage is not in a state that accepts them.
pub fn apply(
    stage: &PaymentStage,
    transition: &Transition,
) -> Result<TransitionOutcome, StagePayError> {
    match transition {
        Transition::Unlock { project_progress } => Ok(match stage.status {
            StageStatus::Pending if is_unlocked(*project_progress, stage.required_progress) => {
                TransitionOutcome::Changed(with_status(stage, StageStatus::Available))
            }
            StageStatus::Pending
            | StageStatus::Available
            | StageStatus::Overdue
            | StageStatus::Paid => TransitionOutcome::Unchanged,
        }),
        Transition::AttachLink(issued) => {
            ensure_accepts_command(stage, transition.action())?;
            if stage.has_payment_link() {
                return Err(StagePayError::AlreadyIssued(stage.id));
            }
            let mut next = stage.clone();
            next.payment_link = Some(issued.link.clone());
            next.external_payment_reference = Some(issued.external_reference.clone());
            Ok(TransitionOutcome::Changed(next))
        }
        Transition::MarkPaid { at } => {
            ensure_accepts_command(stage, transition.action())?;
            let mut next = with_status(stage, StageStatus::Paid);
            next.paid_date = Some(*at);
            Ok(TransitionOutcome::Changed(next))
        }
        Transition::MarkOverdue { now } => Ok(match stage.status {
            StageStatus::Available if stage.is_past_due(*now) => {
                TransitionOutcome::Changed(with_status(stage, StageStatus::Overdue))
            }
            StageStatus::Pending
            | StageStatus::Available
            | StageStatus::Overdue
            | StageStatus::Paid => TransitionOutcome::Unchanged,
        }),
    }
}

/// Commands are only accepted by unlocked, unpaid stages.
pub fn ensure_accepts_command(
    stage: &PaymentStage,
    action: &'static str,
) -> Result<(), StagePayError> {
    match stage.status {
        StageStatus::Available | StageStatus::Overdue => Ok(()),
        StageStatus::Pending => Err(StagePayError::StageNotReady {
            stage_id: stage.id,
            action,
        }),
        StageStatus::Paid => Err(StagePayError::InvalidTransition {
            stage_id: stage.id,
            from: stage.status,
            action,
        }),
    }
}

/// Initial status of a freshly defined stage given the project's current progress.
pub fn initial_status(project_progress: u8, required_progress: u8) -> StageStatus {
    if is_unlocked(project_progress, required_progress) {
        StageStatus::Available
    } else {
        StageStatus::Pending
    }
}

fn with_status(stage: &PaymentStage, status: StageStatus) -> PaymentStage {
    let mut next = stage.clone();
    next.status = status;
    next
}
