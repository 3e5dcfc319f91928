use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::quota::BonusService;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct BindPhoneRequest {
    pub phone: String,
}

#[derive(Serialize)]
struct Claims {
    sub: i32,
    role: String,
    exp: usize,
}

#[derive(Serialize)]
pub struct UserInfo {
    pub id: i32,
    pub email: String,
    pub role: String,
    pub phone: Option<String>,
    pub referral_code: String,
}

pub async fn register_user(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<StatusCode> {
    if payload.password.len() < 8 {
        return Err(AppError::BadRequest("Password too short".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|e| AppError::Message(format!("Hashing failed: {}", e)))?;

    let inviter_id: Option<i32> = match payload.referral_code.as_deref() {
        Some(code) => {
            sqlx::query_scalar("SELECT id FROM users WHERE referral_code = $1")
                .bind(code)
                .fetch_optional(&pool)
                .await?
        }
        None => None,
    };

    let referral_code = Uuid::new_v4().simple().to_string();
    let result = sqlx::query_scalar::<_, i32>(
        "INSERT INTO users (email, password_hash, referral_code, invited_by) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(&payload.email)
    .bind(hash.to_string())
    .bind(&referral_code)
    .bind(inviter_id)
    .fetch_one(&pool)
    .await;
    let user_id = match result {
        Ok(id) => id,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("users_email_key") {
                    return Err(AppError::BadRequest("Email already registered".into()));
                }
            }
            return Err(AppError::Db(e));
        }
    };

    // The account exists at this point; a failed gift insert is logged for
    // reconciliation rather than failing the registration.
    let bonuses = BonusService::new(pool);
    let now = Utc::now();
    if let Err(err) = bonuses.signup_gift(user_id, now).await {
        error!(?err, user_id, "failed to issue signup gift");
    }
    if let Some(inviter_id) = inviter_id {
        if let Err(err) = bonuses.referral_reward(inviter_id, user_id, now).await {
            error!(?err, inviter_id, user_id, "failed to issue referral reward");
        }
    }

    Ok(StatusCode::CREATED)
}

pub async fn login_user(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, &'static str)> {
    let rec = sqlx::query("SELECT id, password_hash, role FROM users WHERE email = $1")
        .bind(&payload.email)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching user");
            AppError::Db(e)
        })?;
    let rec = rec.ok_or(AppError::Unauthorized)?;
    let id: i32 = rec.get("id");
    let pass_hash: String = rec.get("password_hash");
    let role: String = rec.get("role");
    let parsed = PasswordHash::new(&pass_hash).map_err(|e| {
        error!(?e, "Hash parse error");
        AppError::Message(format!("Hash error: {}", e))
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthorized);
    }
    let exp = Utc::now()
        .checked_add_signed(Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;
    let claims = Claims {
        sub: id,
        role: role.clone(),
        exp,
    };
    let secret = crate::config::JWT_SECRET.as_str();
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!(?e, "Token encoding error");
        AppError::Message("Token error".into())
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("auth_token={token}; HttpOnly; Secure; SameSite=Strict; Path=/")
            .parse()
            .expect("valid header value"),
    );
    Ok((headers, "Login successful"))
}

pub async fn logout_user() -> (HeaderMap, &'static str) {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        "auth_token=deleted; HttpOnly; Path=/; Max-Age=0"
            .parse()
            .expect("valid header value"),
    );
    (headers, "Logged out")
}

/// Binds a phone number once and issues the bind bonus. The SMS code
/// round-trip happens upstream; this endpoint trusts its caller's check.
pub async fn bind_phone(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<BindPhoneRequest>,
) -> AppResult<StatusCode> {
    let phone = payload.phone.trim();
    if phone.is_empty() {
        return Err(AppError::BadRequest("Phone required".into()));
    }

    let result = sqlx::query("UPDATE users SET phone = $1 WHERE id = $2 AND phone IS NULL")
        .bind(phone)
        .bind(user_id)
        .execute(&pool)
        .await;
    let updated = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("users_phone_key") {
                    return Err(AppError::BadRequest("Phone already in use".into()));
                }
            }
            return Err(AppError::Db(e));
        }
    };
    if updated.rows_affected() == 0 {
        return Err(AppError::BadRequest("Phone already bound".into()));
    }

    if let Err(err) = BonusService::new(pool)
        .phone_bind_bonus(user_id, Utc::now())
        .await
    {
        error!(?err, user_id, "failed to issue phone bind bonus");
    }

    Ok(StatusCode::OK)
}

pub async fn current_user(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, role }: AuthUser,
) -> AppResult<Json<UserInfo>> {
    let rec = sqlx::query("SELECT email, phone, referral_code FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching user");
            AppError::Db(e)
        })?;
    let Some(row) = rec else {
        return Err(AppError::NotFound);
    };
    let email: String = row.get("email");
    let phone: Option<String> = row.get("phone");
    let referral_code: String = row.get("referral_code");
    Ok(Json(UserInfo {
        id: user_id,
        email,
        role,
        phone,
        referral_code,
    }))
}
