//! StagePay core: milestone payment stages and their lifecycle.
//!
//! A project's payment plan is split into stages. Each stage unlocks once
//! project progress clears its threshold, receives a payment link from an
//! external issuer, and is eventually marked paid. Every mutation goes through
//! an atomic compare-and-swap against the [`StageStore`], so concurrent callers
//! can never double-complete a stage or lose an update.

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod gate;
pub mod issuer;
pub mod lifecycle;
pub mod plan;
pub mod postgres;
pub mod store;
pub mod types;

pub use engine::{LinkReissuePolicy, OverdueSweep, StageEngine, StageEngineConfig};
pub use error::StagePayError;
pub use gate::is_unlocked;
pub use issuer::{IssuedLink, IssuerError, LinkIssuer, LinkRequest};
pub use lifecycle::{Transition, TransitionOutcome};
pub use plan::StageDefinition;
pub use postgres::PostgresStageStore;
pub use store::{
    bootstrap_store, InMemoryStageStore, StageStorageConfig, StageStore, StoreError, StoreResult,
};
pub use types::{PaymentStage, ProjectId, ProjectPaymentSummary, StageId, StageStatus};
