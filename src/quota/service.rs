use chrono::{DateTime, Months, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    ConsumeMetadata, ConsumeOutcome, GrantDetail, GrantDraw, QuotaGrant, QuotaSummary, UsageRecord,
};
use super::LedgerError;

/// Rows returned by `grant_details`, newest first.
const DETAILS_ROW_CAP: i64 = 100;

/// key: quota-service -> grant store, balance aggregation, consumption
#[derive(Clone)]
pub struct QuotaService {
    pool: PgPool,
}

impl QuotaService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issues a new grant. `expires_at` is the exclusive end of the validity
    /// window; `payment_id` correlates purchased grants with their payment.
    pub async fn create_grant(
        &self,
        user_id: i32,
        amount: i64,
        expires_at: DateTime<Utc>,
        note: &str,
        payment_id: Option<&str>,
    ) -> Result<Uuid, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let id: Uuid = sqlx::query_scalar(
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
            ) VALUES ($1, $2, $3, $3, NOW(), $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount)
        .bind(expires_at)
        .bind(note)
        .bind(payment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Sums over grants that are still inside their validity window. A user
    /// with no grants gets the zero summary.
    pub async fn summary(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<QuotaSummary, LedgerError> {
        let (granted, remaining): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(amount), 0)::BIGINT,
                COALESCE(SUM(remaining), 0)::BIGINT
            FROM quota_grants
            WHERE user_id = $1 AND period_end > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(QuotaSummary {
            granted,
            remaining,
            used: granted - remaining,
        })
    }

    /// Grant history for the account page: newest first, windows ending
    /// inside the lookback horizon, capped at `DETAILS_ROW_CAP` rows.
    pub async fn grant_details(
        &self,
        user_id: i32,
        lookback_months: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantDetail>, LedgerError> {
        let window_start = now
            .checked_sub_months(Months::new(lookback_months))
            .unwrap_or(now);
        let grants = sqlx::query_as::<_, QuotaGrant>(
            r#"
            SELECT id, user_id, amount, remaining, period_start, period_end, source_note, payment_id, created_at
            FROM quota_grants
            WHERE user_id = $1 AND period_end > $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(window_start)
        .bind(DETAILS_ROW_CAP)
        .fetch_all(&self.pool)
        .await?;

        Ok(grants
            .into_iter()
            .map(|grant| GrantDetail {
                expired: !grant.is_active(now),
                grant,
            })
            .collect())
    }

    /// Read side of the audit log, newest first.
    pub async fn usage_history(
        &self,
        user_id: i32,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, LedgerError> {
        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT id, user_id, amount_debited, grants_drawn, debt_amount, tag, models, created_at
            FROM usage_records
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, DETAILS_ROW_CAP))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Debits `amount` units from the user's active grants, soonest expiry
    /// first, splitting across grants as needed. A shortfall is booked as a
    /// debt record in the same transaction; the debit itself always goes
    /// through. The audit row is appended after commit and is best-effort.
    pub async fn consume(
        &self,
        user_id: i32,
        amount: i64,
        metadata: ConsumeMetadata,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        // FOR UPDATE serializes concurrent debits for the same user: a
        // waiter re-evaluates `remaining > 0` once the lock holder commits,
        // so a grant the winner drained drops out of its candidate set.
        let candidates: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, remaining
            FROM quota_grants
            WHERE user_id = $1 AND remaining > 0 AND period_end > $2
            ORDER BY period_end ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut left = amount;
        let mut draws = Vec::new();
        for (grant_id, remaining) in candidates {
            if left == 0 {
                break;
            }
            let draw = remaining.min(left);
            sqlx::query("UPDATE quota_grants SET remaining = remaining - $1 WHERE id = $2")
                .bind(draw)
                .bind(grant_id)
                .execute(&mut *tx)
                .await?;
            draws.push(GrantDraw {
                grant_id,
                amount: draw,
            });
            left -= draw;
        }

        let debt_amount = left;
        if debt_amount > 0 {
            sqlx::query(
                "INSERT INTO debt_records (id, user_id, shortfall_amount) VALUES ($1, $2, $3)",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(debt_amount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let usage_id = match self
            .append_usage(user_id, amount, &draws, debt_amount, &metadata)
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(?err, user_id, amount, "failed to append usage audit record");
                None
            }
        };

        Ok(ConsumeOutcome {
            amount_debited: amount,
            draws,
            debt_amount,
            usage_id,
        })
    }

    async fn append_usage(
        &self,
        user_id: i32,
        amount: i64,
        draws: &[GrantDraw],
        debt_amount: i64,
        metadata: &ConsumeMetadata,
    ) -> Result<Uuid, sqlx::Error> {
        let mut drawn = Map::new();
        for draw in draws {
            drawn.insert(draw.grant_id.to_string(), Value::from(draw.amount));
        }
        sqlx::query_scalar(
            r#"
            INSERT INTO usage_records (id, user_id, amount_debited, grants_drawn, debt_amount, tag, models)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount)
        .bind(Value::Object(drawn))
        .bind(debt_amount)
        .bind(metadata.tag.as_deref())
        .bind(&metadata.models)
        .fetch_one(&self.pool)
        .await
    }
}
