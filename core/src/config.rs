use crate::types::CollectionMethod;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Fees ──────────────────────────────────────────────────────────

/// `amount * percentage + fixed`, in the transaction currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub percentage: Decimal,
    pub fixed: Decimal,
}

impl FeeSchedule {
    pub fn new(percentage: Decimal, fixed: Decimal) -> Self {
        Self { percentage, fixed }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Platform commission when a barber has no override. 0.15 = 15%.
    pub default_commission_rate: Decimal,
    /// Used whenever a processor's own schedule is missing or invalid.
    pub default_processing:      FeeSchedule,
    /// Keyed by `PaymentProcessor::fee_key()`: "platform", "stripe", "square", "paypal".
    #[serde(default)]
    pub processors:              HashMap<String, FeeSchedule>,
    /// Share of a split payment collected centrally as a deposit.
    pub split_platform_share:    Decimal,
}

// ── Verification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    FailClosed,
    FailOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    pub policy:                   VerificationPolicy,
    /// Max age of a signed timestamp (Stripe `t=`, PayPal transmission time).
    pub signature_tolerance_secs: i64,
    /// Verification + normalization time above which a delivery is logged
    /// and audited as slow.
    pub budget_ms:                u64,
    /// Square signs `notification_url + body`.
    pub square_notification_url:  String,
}

// ── Pull repair ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    pub lookback_minutes:     i64,
    pub pull_timeout_ms:      u64,
    pub lease_ttl_secs:       i64,
    pub backoff_base_secs:    i64,
    pub backoff_max_secs:     i64,
    pub backoff_jitter_secs:  i64,
    /// Consecutive failures after which a connection is marked `error`.
    pub error_after_failures: u32,
    pub max_parallel:         usize,
}

// ── Collection ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub default_method:      CollectionMethod,
    /// A collection still `pending` with no billing reference this long
    /// after its last submission attempt is submitted again.
    #[serde(default = "default_resubmit_after_secs")]
    pub resubmit_after_secs: i64,
}

fn default_resubmit_after_secs() -> i64 {
    5 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    pub fees:         FeeConfig,
    pub verification: VerificationConfig,
    pub repair:       RepairConfig,
    pub collection:   CollectionConfig,
}

impl PaymentsConfig {
    /// Load from `{data_dir}/payments.json`.
    /// In tests, use PaymentsConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/payments.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: PaymentsConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        Ok(config)
    }

    /// Config with hardcoded defaults for use in tests.
    /// Identical to `Default` except for a deterministic Square notification URL
    /// and zero backoff jitter.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.verification.square_notification_url =
            "https://hooks.test.barberpay.local/webhooks/square".into();
        config.repair.backoff_jitter_secs = 0;
        config
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        let processors = [
            ("platform", FeeSchedule::new(Decimal::new(29, 3), Decimal::new(30, 2))),
            ("stripe", FeeSchedule::new(Decimal::new(29, 3), Decimal::new(30, 2))),
            ("square", FeeSchedule::new(Decimal::new(26, 3), Decimal::new(10, 2))),
            ("paypal", FeeSchedule::new(Decimal::new(349, 4), Decimal::new(49, 2))),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            fees: FeeConfig {
                default_commission_rate: Decimal::new(15, 2),
                default_processing: FeeSchedule::new(Decimal::new(29, 3), Decimal::new(30, 2)),
                processors,
                split_platform_share: Decimal::new(20, 2),
            },
            verification: VerificationConfig {
                policy: VerificationPolicy::FailClosed,
                signature_tolerance_secs: 300,
                budget_ms: 100,
                square_notification_url: String::new(),
            },
            repair: RepairConfig {
                lookback_minutes: 24 * 60,
                pull_timeout_ms: 10_000,
                lease_ttl_secs: 15 * 60,
                backoff_base_secs: 60,
                backoff_max_secs: 6 * 60 * 60,
                backoff_jitter_secs: 30,
                error_after_failures: 3,
                max_parallel: 8,
            },
            collection: CollectionConfig {
                default_method: CollectionMethod::CardOnFile,
                resubmit_after_secs: default_resubmit_after_secs(),
            },
        }
    }
}
