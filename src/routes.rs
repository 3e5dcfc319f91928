use axum::{
    routing::{get, post},
    Router,
};

use crate::{auth, quota::api as quota_api, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/register", post(auth::register_user))
        .route("/api/login", post(auth::login_user))
        .route("/api/logout", post(auth::logout_user))
        .route("/api/me", get(auth::current_user))
        .route("/api/bind-phone", post(auth::bind_phone))
        .route("/api/quota/summary", get(quota_api::summary))
        .route(
            "/api/quota/grants",
            get(quota_api::grant_details).post(quota_api::create_grant),
        )
        .route("/api/quota/usage", get(quota_api::usage_history))
        .route("/api/quota/consume", post(quota_api::consume))
        .route("/api/quota/debts", get(quota_api::list_debts))
        .route("/api/quota/products", get(quota_api::list_products))
        .route("/api/quota/purchase", post(quota_api::purchase))
        .route("/api/quota/payments/:payment_id", get(quota_api::get_payment))
        .route(
            "/api/webhooks/payment/:provider",
            post(webhooks::payment_webhook),
        )
}
