use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::quota::{adapter_for, LedgerError, SettlementService};

/// key: webhooks-payment -> provider callback intake
///
/// Providers redeliver until they see 2xx, so a duplicate confirmation is
/// acknowledged as success: the settlement layer already guarantees the
/// terminal transition applied exactly once.
pub async fn payment_webhook(
    Extension(pool): Extension<PgPool>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let Some(adapter) = adapter_for(&provider) else {
        return Err(StatusCode::NOT_FOUND);
    };

    let signature = headers
        .get("x-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let callback = match adapter.verify_and_parse(signature, &body).await {
        Ok(callback) => callback,
        Err(err) => {
            warn!(?err, %provider, "rejected payment callback");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let service = SettlementService::new(pool);
    match service
        .complete_payment(
            callback.user_id,
            &callback.payment_id,
            callback.outcome,
            callback.fields,
            Utc::now(),
        )
        .await
    {
        Ok(event_id) => {
            info!(
                %provider,
                payment_id = %callback.payment_id,
                outcome = callback.outcome.as_str(),
                "payment settled"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "ok", "event_id": event_id })),
            ))
        }
        Err(LedgerError::AlreadyProcessed) => {
            Ok((StatusCode::OK, Json(json!({ "status": "duplicate" }))))
        }
        Err(LedgerError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            warn!(
                ?err,
                %provider,
                payment_id = %callback.payment_id,
                "payment settlement failed"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
