use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Shared secret payment providers use to sign callback bodies. Must be set
/// via the `PAYMENT_WEBHOOK_SECRET` env variable.
pub static PAYMENT_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("PAYMENT_WEBHOOK_SECRET").expect("PAYMENT_WEBHOOK_SECRET must be set")
});

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: quota-config -> signup gift size
pub static SIGNUP_GIFT_UNITS: Lazy<i64> = Lazy::new(|| {
    std::env::var("SIGNUP_GIFT_UNITS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(100)
});

/// key: quota-config -> signup gift validity window
pub static SIGNUP_GIFT_VALID_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("SIGNUP_GIFT_VALID_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// key: quota-config -> phone bind bonus size
pub static PHONE_BIND_BONUS_UNITS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PHONE_BIND_BONUS_UNITS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(50)
});

/// key: quota-config -> phone bind bonus validity window
pub static PHONE_BIND_BONUS_VALID_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PHONE_BIND_BONUS_VALID_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// key: quota-config -> referral reward size
pub static REFERRAL_REWARD_UNITS: Lazy<i64> = Lazy::new(|| {
    std::env::var("REFERRAL_REWARD_UNITS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(100)
});

/// key: quota-config -> referral reward validity window
pub static REFERRAL_REWARD_VALID_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("REFERRAL_REWARD_VALID_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(90)
});

/// A purchasable quota package. `valid_months` counts from the moment the
/// payment is confirmed, not from checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub price_cents: i64,
    pub quota_units: i64,
    pub valid_months: u32,
}

/// key: quota-config -> purchasable packages
/// Loaded once from `PRODUCT_CATALOG_JSON`; falls back to the built-in
/// catalog. Grant issuance maps `product_id` through this table.
pub static PRODUCT_CATALOG: Lazy<Vec<Product>> = Lazy::new(|| {
    match std::env::var("PRODUCT_CATALOG_JSON") {
        Ok(raw) if !raw.trim().is_empty() => parse_catalog(raw.trim()),
        _ => default_catalog(),
    }
});

pub fn product(id: &str) -> Option<&'static Product> {
    PRODUCT_CATALOG.iter().find(|product| product.id == id)
}

fn parse_catalog(raw: &str) -> Vec<Product> {
    serde_json::from_str(raw)
        .unwrap_or_else(|err| panic!("failed to parse PRODUCT_CATALOG_JSON: {err}"))
}

fn default_catalog() -> Vec<Product> {
    vec![
        Product {
            id: "starter".to_string(),
            title: "Starter pack".to_string(),
            price_cents: 500,
            quota_units: 500,
            valid_months: 1,
        },
        Product {
            id: "standard".to_string(),
            title: "Standard pack".to_string(),
            price_cents: 1800,
            quota_units: 2000,
            valid_months: 3,
        },
        Product {
            id: "bulk".to_string(),
            title: "Bulk pack".to_string(),
            price_cents: 6000,
            quota_units: 8000,
            valid_months: 12,
        },
    ]
}

/// Per-model debit pricing in quota units. Callers price a completed request
/// through this table before handing the ledger the final amount.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPricing {
    #[serde(default = "default_unit_price")]
    pub default_units: i64,
    #[serde(default)]
    pub per_model: HashMap<String, i64>,
}

fn default_unit_price() -> i64 {
    1
}

impl ModelPricing {
    pub fn units_for(&self, model: &str) -> i64 {
        self.per_model
            .get(model)
            .copied()
            .unwrap_or(self.default_units)
    }

    /// Price for one completed request touching the given models. A request
    /// with no model annotation is charged the default rate once.
    pub fn request_units(&self, models: &[String]) -> i64 {
        if models.is_empty() {
            return self.default_units;
        }
        models.iter().map(|model| self.units_for(model)).sum()
    }
}

/// key: quota-config -> model pricing table
/// Loaded once from `MODEL_PRICING_JSON`; replaces the mutable package-level
/// coin tables of earlier iterations.
pub static MODEL_PRICING: Lazy<ModelPricing> = Lazy::new(|| {
    match std::env::var("MODEL_PRICING_JSON") {
        Ok(raw) if !raw.trim().is_empty() => parse_pricing(raw.trim()),
        _ => default_pricing(),
    }
});

fn parse_pricing(raw: &str) -> ModelPricing {
    serde_json::from_str(raw)
        .unwrap_or_else(|err| panic!("failed to parse MODEL_PRICING_JSON: {err}"))
}

fn default_pricing() -> ModelPricing {
    let mut per_model = HashMap::new();
    per_model.insert("gpt-3.5-turbo".to_string(), 1);
    per_model.insert("gpt-4".to_string(), 15);
    per_model.insert("gpt-4-32k".to_string(), 30);
    ModelPricing {
        default_units: 1,
        per_model,
    }
}
