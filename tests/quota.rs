use chrono::{Duration, Utc};
use quota_ledger::quota::{BonusService, ConsumeMetadata, QuotaService};
use sqlx::PgPool;
use uuid::Uuid;

// key: quota-tests -> consumption engine properties

async fn seed_user(pool: &PgPool, email: &str) -> i32 {
    sqlx::migrate!("./migrations").run(pool).await.unwrap();
    sqlx::query_scalar(
        "INSERT INTO users (email, password_hash, referral_code) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(email)
    .bind("hashed")
    .bind(Uuid::new_v4().simple().to_string())
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn grant_remaining(pool: &PgPool, grant_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT remaining FROM quota_grants WHERE id = $1")
        .bind(grant_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn consume_matching_total_drains_every_grant(pool: PgPool) {
    let user_id = seed_user(&pool, "drain@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    service
        .create_grant(user_id, 30, now + Duration::days(5), "signup-gift", None)
        .await
        .unwrap();
    service
        .create_grant(user_id, 20, now + Duration::days(10), "phone-bind-bonus", None)
        .await
        .unwrap();

    let outcome = service
        .consume(user_id, 50, ConsumeMetadata::default(), now)
        .await
        .unwrap();
    assert_eq!(outcome.amount_debited, 50);
    assert_eq!(outcome.debt_amount, 0);
    assert_eq!(outcome.draws.iter().map(|d| d.amount).sum::<i64>(), 50);

    let summary = service.summary(user_id, now).await.unwrap();
    assert_eq!(summary.granted, 50);
    assert_eq!(summary.remaining, 0);
    assert_eq!(summary.used, 50);

    let debts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM debt_records WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(debts, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overdraft_books_exactly_one_debt_record(pool: PgPool) {
    let user_id = seed_user(&pool, "overdraft@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    service
        .create_grant(user_id, 10, now + Duration::days(2), "signup-gift", None)
        .await
        .unwrap();
    service
        .create_grant(user_id, 5, now + Duration::days(3), "phone-bind-bonus", None)
        .await
        .unwrap();

    let outcome = service
        .consume(user_id, 25, ConsumeMetadata::default(), now)
        .await
        .unwrap();
    assert_eq!(outcome.amount_debited, 25);
    assert_eq!(outcome.debt_amount, 10);
    assert_eq!(outcome.draws.iter().map(|d| d.amount).sum::<i64>(), 15);

    let summary = service.summary(user_id, now).await.unwrap();
    assert_eq!(summary.remaining, 0);

    let shortfalls: Vec<i64> =
        sqlx::query_scalar("SELECT shortfall_amount FROM debt_records WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(shortfalls, vec![10]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn consume_draws_soonest_expiry_first(pool: PgPool) {
    let user_id = seed_user(&pool, "ordering@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    let long_lived = service
        .create_grant(user_id, 10, now + Duration::days(30), "purchase:starter", None)
        .await
        .unwrap();
    let short_lived = service
        .create_grant(user_id, 10, now + Duration::days(1), "signup-gift", None)
        .await
        .unwrap();

    let outcome = service
        .consume(user_id, 15, ConsumeMetadata::default(), now)
        .await
        .unwrap();

    assert_eq!(outcome.draws.len(), 2);
    assert_eq!(outcome.draws[0].grant_id, short_lived);
    assert_eq!(outcome.draws[0].amount, 10);
    assert_eq!(outcome.draws[1].grant_id, long_lived);
    assert_eq!(outcome.draws[1].amount, 5);

    assert_eq!(grant_remaining(&pool, short_lived).await, 0);
    assert_eq!(grant_remaining(&pool, long_lived).await, 5);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expired_grants_are_never_drawn_or_summed(pool: PgPool) {
    let user_id = seed_user(&pool, "expired@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    let expired = service
        .create_grant(user_id, 10, now - Duration::days(1), "signup-gift", None)
        .await
        .unwrap();
    let active = service
        .create_grant(user_id, 5, now + Duration::days(5), "purchase:starter", None)
        .await
        .unwrap();

    let summary = service.summary(user_id, now).await.unwrap();
    assert_eq!(summary.granted, 5);
    assert_eq!(summary.remaining, 5);

    let outcome = service
        .consume(user_id, 8, ConsumeMetadata::default(), now)
        .await
        .unwrap();
    assert_eq!(outcome.draws.len(), 1);
    assert_eq!(outcome.draws[0].grant_id, active);
    assert_eq!(outcome.debt_amount, 3);

    // the lapsed grant keeps its balance as inert history
    assert_eq!(grant_remaining(&pool, expired).await, 10);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn usage_record_accounts_for_every_draw(pool: PgPool) {
    let user_id = seed_user(&pool, "audit@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    service
        .create_grant(user_id, 7, now + Duration::days(1), "signup-gift", None)
        .await
        .unwrap();
    service
        .create_grant(user_id, 9, now + Duration::days(2), "phone-bind-bonus", None)
        .await
        .unwrap();

    let metadata = ConsumeMetadata {
        tag: Some("chat".to_string()),
        models: vec!["gpt-4".to_string()],
    };
    let outcome = service.consume(user_id, 20, metadata, now).await.unwrap();
    assert!(outcome.usage_id.is_some());

    let (amount_debited, debt_amount, grants_drawn, tag, models): (
        i64,
        i64,
        serde_json::Value,
        Option<String>,
        Vec<String>,
    ) = sqlx::query_as(
        "SELECT amount_debited, debt_amount, grants_drawn, tag, models FROM usage_records WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(amount_debited, 20);
    assert_eq!(debt_amount, 4);
    assert_eq!(tag.as_deref(), Some("chat"));
    assert_eq!(models, vec!["gpt-4".to_string()]);

    let drawn_total: i64 = grants_drawn
        .as_object()
        .unwrap()
        .values()
        .map(|value| value.as_i64().unwrap())
        .sum();
    assert_eq!(drawn_total, amount_debited - debt_amount);
    assert_eq!(grants_drawn.as_object().unwrap().len(), 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_consumes_serialize_per_user(pool: PgPool) {
    let user_id = seed_user(&pool, "contention@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    // 8 concurrent debits of 1 against 7 remaining: exactly one must
    // overdraw. A non-locking read-modify-write loses updates here.
    service
        .create_grant(user_id, 7, now + Duration::days(1), "signup-gift", None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            QuotaService::new(pool)
                .consume(user_id, 1, ConsumeMetadata::default(), Utc::now())
                .await
        }));
    }

    let mut overdrawn = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.debt_amount > 0 {
            assert_eq!(outcome.debt_amount, 1);
            overdrawn += 1;
        }
    }
    assert_eq!(overdrawn, 1);

    let summary = service.summary(user_id, now).await.unwrap();
    assert_eq!(summary.remaining, 0);

    let shortfalls: Vec<i64> =
        sqlx::query_scalar("SELECT shortfall_amount FROM debt_records WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(shortfalls, vec![1]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn grant_details_marks_expired_rows(pool: PgPool) {
    let user_id = seed_user(&pool, "details@example.com").await;
    let service = QuotaService::new(pool.clone());
    let now = Utc::now();

    service
        .create_grant(user_id, 10, now - Duration::days(2), "signup-gift", None)
        .await
        .unwrap();
    service
        .create_grant(user_id, 20, now + Duration::days(20), "purchase:starter", None)
        .await
        .unwrap();

    let details = service.grant_details(user_id, 3, now).await.unwrap();
    assert_eq!(details.len(), 2);
    // newest first
    assert_eq!(details[0].grant.amount, 20);
    assert!(!details[0].expired);
    assert_eq!(details[1].grant.amount, 10);
    assert!(details[1].expired);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn bonus_grants_issue_once_per_source(pool: PgPool) {
    let inviter = seed_user(&pool, "inviter@example.com").await;
    let invited = seed_user(&pool, "invited@example.com").await;
    let other = seed_user(&pool, "other@example.com").await;
    let bonuses = BonusService::new(pool.clone());
    let now = Utc::now();

    assert!(bonuses.signup_gift(invited, now).await.unwrap().is_some());
    assert!(bonuses.signup_gift(invited, now).await.unwrap().is_none());

    assert!(bonuses
        .referral_reward(inviter, invited, now)
        .await
        .unwrap()
        .is_some());
    assert!(bonuses
        .referral_reward(inviter, invited, now)
        .await
        .unwrap()
        .is_none());
    // a different invited account is a fresh reward
    assert!(bonuses
        .referral_reward(inviter, other, now)
        .await
        .unwrap()
        .is_some());

    let inviter_grants: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM quota_grants WHERE user_id = $1")
            .bind(inviter)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(inviter_grants, 2);
}
