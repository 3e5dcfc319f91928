use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// key: quota-grant-model -> time-bounded credit allocation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuotaGrant {
    pub id: Uuid,
    pub user_id: i32,
    pub amount: i64,
    pub remaining: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub source_note: String,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QuotaGrant {
    /// `period_end` is the exclusive expiry instant: a grant whose window
    /// just closed is already inert.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.period_end > now
    }
}

/// Point-in-time balance over a user's currently valid grants.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QuotaSummary {
    pub granted: i64,
    pub remaining: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantDetail {
    #[serde(flatten)]
    pub grant: QuotaGrant,
    pub expired: bool,
}

/// key: quota-debt-model -> unreconciled liability
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DebtRecord {
    pub id: Uuid,
    pub user_id: i32,
    pub shortfall_amount: i64,
    pub created_at: DateTime<Utc>,
}

/// One append-only audit row per debit, naming every grant drawn.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: i32,
    pub amount_debited: i64,
    pub grants_drawn: Value,
    pub debt_amount: i64,
    pub tag: Option<String>,
    pub models: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// key: payment-model -> one-way state machine
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub payment_id: String,
    pub user_id: i32,
    pub product_id: String,
    pub provider: String,
    pub amount_cents: i64,
    pub status: String,
    pub provider_fields: Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Waiting,
    Success,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Waiting => "waiting",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "success" => PaymentStatus::Success,
            "failed" => PaymentStatus::Failed,
            "canceled" => PaymentStatus::Canceled,
            _ => PaymentStatus::Waiting,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Waiting)
    }
}

/// Terminal outcome reported by a payment provider callback.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failed,
    Canceled,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Success => "success",
            PaymentOutcome::Failed => "failed",
            PaymentOutcome::Canceled => "canceled",
        }
    }
}

/// key: payment-outbox-model
/// Written in the same transaction as the success transition; the
/// asynchronous consumer owns `processed_at`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentCompletedEvent {
    pub id: Uuid,
    pub user_id: i32,
    pub product_id: String,
    pub payment_id: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Caller-supplied context recorded with every debit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumeMetadata {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantDraw {
    pub grant_id: Uuid,
    pub amount: i64,
}

/// key: quota-consume-outcome
/// `usage_id` is `None` when the post-commit audit append failed; the debit
/// itself is already durable at that point.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    pub amount_debited: i64,
    pub draws: Vec<GrantDraw>,
    pub debt_amount: i64,
    pub usage_id: Option<Uuid>,
}
