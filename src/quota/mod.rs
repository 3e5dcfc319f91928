pub mod api;
pub mod bonus;
pub mod models;
pub mod providers;
pub mod service;
pub mod settlement;

pub use bonus::BonusService;
pub use models::{
    ConsumeMetadata, ConsumeOutcome, DebtRecord, GrantDetail, GrantDraw, Payment,
    PaymentCompletedEvent, PaymentOutcome, PaymentStatus, QuotaGrant, QuotaSummary, UsageRecord,
};
pub use providers::{adapter_for, HmacCallbackAdapter, PaymentProviderAdapter, ProviderCallback};
pub use service::QuotaService;
pub use settlement::SettlementService;

use thiserror::Error;

/// key: quota-errors -> ledger taxonomy
/// Insufficient balance is deliberately absent: a shortfall becomes a debt
/// record, never a rejection. Callers gate chargeable work on the summary
/// before invoking the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found")]
    NotFound,
    #[error("payment already processed")]
    AlreadyProcessed,
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("unknown product `{0}`")]
    UnknownProduct(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
