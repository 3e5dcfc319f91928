use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::models::{
    ConsumeMetadata, ConsumeOutcome, DebtRecord, GrantDetail, Payment, QuotaSummary, UsageRecord,
};
use super::providers::adapter_for;
use super::{QuotaService, SettlementService};

/// key: quota-api -> rest endpoints

pub async fn summary(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<QuotaSummary>> {
    let service = QuotaService::new(pool);
    let summary = service.summary(user_id, Utc::now()).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct GrantDetailsQuery {
    pub lookback_months: Option<u32>,
}

pub async fn grant_details(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Query(params): Query<GrantDetailsQuery>,
) -> AppResult<Json<Vec<GrantDetail>>> {
    let lookback = params.lookback_months.unwrap_or(3).min(24);
    let service = QuotaService::new(pool);
    let details = service.grant_details(user_id, lookback, Utc::now()).await?;
    Ok(Json(details))
}

#[derive(Debug, Deserialize)]
pub struct UsageHistoryQuery {
    pub limit: Option<i64>,
}

pub async fn usage_history(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Query(params): Query<UsageHistoryQuery>,
) -> AppResult<Json<Vec<UsageRecord>>> {
    let service = QuotaService::new(pool);
    let records = service
        .usage_history(user_id, params.limit.unwrap_or(50))
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Debits the caller for one delivered completion. The gateway fronting the
/// model vendors gates chargeable work on the summary; by the time this runs
/// the tokens are spent, so the ledger accepts the debit and books any
/// shortfall as debt.
pub async fn consume(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<ConsumeRequest>,
) -> AppResult<Json<ConsumeOutcome>> {
    let amount = config::MODEL_PRICING.request_units(&payload.models);
    let service = QuotaService::new(pool);
    let outcome = service
        .consume(
            user_id,
            amount,
            ConsumeMetadata {
                tag: payload.tag,
                models: payload.models,
            },
            Utc::now(),
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CreateGrantRequest {
    pub user_id: i32,
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGrantResponse {
    pub grant_id: Uuid,
}

/// Admin-only escape hatch for support credits.
pub async fn create_grant(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Json(payload): Json<CreateGrantRequest>,
) -> AppResult<Json<CreateGrantResponse>> {
    if !user.is_admin() {
        return Err(AppError::Forbidden);
    }
    let service = QuotaService::new(pool);
    let grant_id = service
        .create_grant(
            payload.user_id,
            payload.amount,
            payload.expires_at,
            &payload.note,
            None,
        )
        .await?;
    Ok(Json(CreateGrantResponse { grant_id }))
}

pub async fn list_products() -> Json<Vec<config::Product>> {
    Json(config::PRODUCT_CATALOG.clone())
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub product_id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "card".to_string()
}

/// Opens a `waiting` payment for the product. The provider callback on
/// `/api/webhooks/payment/:provider` settles it later.
pub async fn purchase(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<PurchaseRequest>,
) -> AppResult<Json<Payment>> {
    if adapter_for(&payload.provider).is_none() {
        return Err(AppError::BadRequest(format!(
            "unsupported payment provider `{}`",
            payload.provider
        )));
    }
    let service = SettlementService::new(pool);
    let payment_id = format!("pay-{}", Uuid::new_v4().simple());
    let payment = service
        .create_payment(user_id, &payment_id, &payload.product_id, &payload.provider)
        .await?;
    Ok(Json(payment))
}

/// Lets a client poll its purchase while the provider callback is pending.
pub async fn get_payment(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(payment_id): Path<String>,
) -> AppResult<Json<Payment>> {
    let service = SettlementService::new(pool);
    let payment = service.load_payment(user_id, &payment_id).await?;
    Ok(Json(payment))
}

#[derive(Debug, Deserialize)]
pub struct DebtQuery {
    pub user_id: i32,
}

/// Admin read of the debt ledger for manual reconciliation.
pub async fn list_debts(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Query(params): Query<DebtQuery>,
) -> AppResult<Json<Vec<DebtRecord>>> {
    if !user.is_admin() {
        return Err(AppError::Forbidden);
    }
    let records = sqlx::query_as::<_, DebtRecord>(
        r#"
        SELECT id, user_id, shortfall_amount, created_at
        FROM debt_records
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT 100
        "#,
    )
    .bind(params.user_id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(records))
}
