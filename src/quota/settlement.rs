use chrono::{DateTime, Months, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;

use super::models::{Payment, PaymentCompletedEvent, PaymentOutcome, PaymentStatus};
use super::LedgerError;

const PAYMENT_COLUMNS: &str = "payment_id, user_id, product_id, provider, amount_cents, status, provider_fields, created_at, completed_at";

/// key: settlement-gateway -> payment state machine + outbox
#[derive(Clone)]
pub struct SettlementService {
    pool: PgPool,
}

impl SettlementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a `waiting` payment priced from the product catalog. Nothing is
    /// credited until the provider confirms the charge.
    pub async fn create_payment(
        &self,
        user_id: i32,
        payment_id: &str,
        product_id: &str,
        provider: &str,
    ) -> Result<Payment, LedgerError> {
        let product = config::product(product_id)
            .ok_or_else(|| LedgerError::UnknownProduct(product_id.to_string()))?;
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, user_id, product_id, provider, amount_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(user_id)
        .bind(&product.id)
        .bind(provider)
        .bind(product.price_cents)
        .bind(PaymentStatus::Waiting.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn load_payment(
        &self,
        user_id: i32,
        payment_id: &str,
    ) -> Result<Payment, LedgerError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1 AND user_id = $2"
        ))
        .bind(payment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        payment.ok_or(LedgerError::NotFound)
    }

    /// Applies a provider-confirmed terminal outcome exactly once.
    ///
    /// A repeated delivery observes a terminal status and gets
    /// `AlreadyProcessed` without touching the row. On success the
    /// completed-payment outbox event and the purchased grant are written in
    /// the same transaction as the status flip, so a crash can never leave a
    /// successful payment without its credit. Any storage error rolls the
    /// whole operation back and the payment stays `waiting` for a retry.
    pub async fn complete_payment(
        &self,
        user_id: i32,
        payment_id: &str,
        outcome: PaymentOutcome,
        provider_fields: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // FOR UPDATE makes the status check and the terminal write atomic
        // against a concurrent delivery of the same confirmation.
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT status, product_id FROM payments WHERE payment_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(payment_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, product_id)) = row else {
            return Err(LedgerError::NotFound);
        };
        if PaymentStatus::from_str(&status).is_terminal() {
            return Err(LedgerError::AlreadyProcessed);
        }

        // jsonb concatenation needs an object on both sides.
        let fields = match provider_fields {
            Value::Object(_) => provider_fields,
            Value::Null => json!({}),
            other => json!({ "raw": other }),
        };

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $1,
                provider_fields = provider_fields || $2,
                completed_at = $3
            WHERE payment_id = $4
            "#,
        )
        .bind(outcome.as_str())
        .bind(&fields)
        .bind(now)
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;

        let event_id = if outcome == PaymentOutcome::Success {
            let product = config::product(&product_id)
                .ok_or_else(|| LedgerError::UnknownProduct(product_id.clone()))?;

            let event_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO payment_completed_events (id, user_id, product_id, payment_id)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(&product_id)
            .bind(payment_id)
            .fetch_one(&mut *tx)
            .await?;

            let expires_at = now
                .checked_add_months(Months::new(product.valid_months))
                .unwrap_or(now);
            sqlx::query(
                r#"
                INSERT INTO quota_grants (
                    id,
                    user_id,
                    amount,
                    remaining,
                    period_start,
                    period_end,
                    source_note,
                    payment_id
                ) VALUES ($1, $2, $3, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(product.quota_units)
            .bind(now)
            .bind(expires_at)
            .bind(format!("purchase:{product_id}"))
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;

            Some(event_id)
        } else {
            None
        };

        tx.commit().await?;
        Ok(event_id)
    }

    /// Poll surface for the outbox consumer: oldest unprocessed events
    /// first. Marking rows processed is the consumer's job.
    pub async fn unprocessed_events(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentCompletedEvent>, LedgerError> {
        let events = sqlx::query_as::<_, PaymentCompletedEvent>(
            r#"
            SELECT id, user_id, product_id, payment_id, created_at, processed_at
            FROM payment_completed_events
            WHERE processed_at IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
