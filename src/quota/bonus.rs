use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;

use super::LedgerError;

/// key: quota-bonus -> signup/bind/referral grant sources
/// Each source issues at most one grant per (user, note); the guard is a
/// single conditional insert so a racing duplicate request cannot slip a
/// second grant in.
#[derive(Clone)]
pub struct BonusService {
    pool: PgPool,
}

impl BonusService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One-time signup gift. Returns `None` when the user already has one
    /// or the gift is configured to zero.
    pub async fn signup_gift(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LedgerError> {
        self.grant_once(
            user_id,
            *config::SIGNUP_GIFT_UNITS,
            *config::SIGNUP_GIFT_VALID_DAYS,
            "signup-gift",
            now,
        )
        .await
    }

    /// Issued on the first successful phone bind.
    pub async fn phone_bind_bonus(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LedgerError> {
        self.grant_once(
            user_id,
            *config::PHONE_BIND_BONUS_UNITS,
            *config::PHONE_BIND_BONUS_VALID_DAYS,
            "phone-bind-bonus",
            now,
        )
        .await
    }

    /// Reward for the inviter, keyed on the invited account so each referral
    /// pays out exactly once.
    pub async fn referral_reward(
        &self,
        inviter_id: i32,
        invited_user_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LedgerError> {
        self.grant_once(
            inviter_id,
            *config::REFERRAL_REWARD_UNITS,
            *config::REFERRAL_REWARD_VALID_DAYS,
            &format!("referral:{invited_user_id}"),
            now,
        )
        .await
    }

    async fn grant_once(
        &self,
        user_id: i32,
        units: i64,
        valid_days: i64,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, LedgerError> {
        if units <= 0 {
            return Ok(None);
        }
        let expires_at = now + Duration::days(valid_days);
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO quota_grants (
                id,
                user_id,
                amount,
                remaining,
                period_start,
                period_end,
                source_note
            )
            SELECT $1, $2, $3, $3, $4, $5, $6
            WHERE NOT EXISTS (
                SELECT 1 FROM quota_grants WHERE user_id = $2 AND source_note = $6
            )
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(units)
        .bind(now)
        .bind(expires_at)
        .bind(note)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}
