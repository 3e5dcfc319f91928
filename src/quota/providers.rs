use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::config;

use super::models::PaymentOutcome;

/// Normalized provider callback after signature verification.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCallback {
    pub payment_id: String,
    pub user_id: i32,
    pub outcome: PaymentOutcome,
    #[serde(default)]
    pub fields: Value,
}

/// key: payment-provider-adapter -> callback boundary
/// Verifies a delivery and normalizes its payload. Provider-specific receipt
/// cryptography lives behind implementations of this trait, outside the
/// ledger.
#[async_trait]
pub trait PaymentProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn verify_and_parse(&self, signature: &str, body: &[u8]) -> Result<ProviderCallback>;
}

/// Adapter for providers that sign the raw callback body with a shared
/// HMAC-SHA256 secret.
pub struct HmacCallbackAdapter;

#[async_trait]
impl PaymentProviderAdapter for HmacCallbackAdapter {
    fn name(&self) -> &'static str {
        "hmac"
    }

    async fn verify_and_parse(&self, signature: &str, body: &[u8]) -> Result<ProviderCallback> {
        verify_signature(config::PAYMENT_WEBHOOK_SECRET.as_bytes(), body, signature)?;
        let callback = serde_json::from_slice(body)
            .map_err(|err| anyhow!("malformed callback payload: {err}"))?;
        Ok(callback)
    }
}

pub fn adapter_for(provider: &str) -> Option<&'static dyn PaymentProviderAdapter> {
    match provider {
        "card" | "iap" => Some(&HmacCallbackAdapter),
        _ => None,
    }
}

pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<()> {
    let raw = hex::decode(signature.trim()).map_err(|_| anyhow!("malformed signature"))?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&raw)
        .map_err(|_| anyhow!("signature mismatch"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{adapter_for, sign, verify_signature, ProviderCallback};
    use crate::quota::models::PaymentOutcome;

    #[test]
    fn signature_round_trips() {
        let body = br#"{"payment_id":"pay-1","user_id":9,"outcome":"success"}"#;
        let signature = sign(b"secret", body);
        assert!(verify_signature(b"secret", body, &signature).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = sign(b"secret", b"original");
        assert!(verify_signature(b"secret", b"tampered", &signature).is_err());
        assert!(verify_signature(b"other-secret", b"original", &signature).is_err());
        assert!(verify_signature(b"secret", b"original", "not-hex").is_err());
    }

    #[test]
    fn known_providers_share_the_hmac_adapter() {
        assert!(adapter_for("card").is_some());
        assert!(adapter_for("iap").is_some());
        assert!(adapter_for("cash-by-mail").is_none());
    }

    #[test]
    fn callback_parses_with_default_fields() {
        let callback: ProviderCallback =
            serde_json::from_str(r#"{"payment_id":"pay-2","user_id":4,"outcome":"canceled"}"#)
                .unwrap();
        assert_eq!(callback.payment_id, "pay-2");
        assert_eq!(callback.outcome, PaymentOutcome::Canceled);
        assert!(callback.fields.is_null());
    }
}
