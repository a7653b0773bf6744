//! Configuration resolver — the read path into per-barber payment settings
//! and processor connections.
//!
//! `PaymentSettings` is the seam: the router and verifier only see this
//! trait, the SQLite store implements it, and tests can substitute their own.

use crate::{
    error::PayResult,
    types::{
        BarberId, CollectionMethod, ConnectionId, ConnectionStatus, PaymentMode, ProcessorType,
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Time-of-day tiebreak for hybrid routing: inside the window → external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// Inclusive local hour, 0–23.
    pub start_hour:         u32,
    /// Exclusive local hour, 1–24.
    pub end_hour:           u32,
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridRules {
    /// Payments strictly below this go through the platform.
    #[serde(default)]
    pub minimum_external_amount: Option<Decimal>,
    /// Service types always sent to the barber's own processor.
    #[serde(default)]
    pub external_service_types:  Vec<String>,
    /// Only consulted when no primary processor is set. `None` disables it.
    #[serde(default)]
    pub business_hours:          Option<BusinessHours>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfiguration {
    pub barber_id:                 BarberId,
    /// Monotonic per barber; the highest version is the live one.
    pub version:                   i64,
    pub mode:                      PaymentMode,
    pub primary_processor:         Option<ProcessorType>,
    pub fallback_to_platform:      bool,
    /// Overrides the platform default commission rate.
    pub commission_rate:           Option<Decimal>,
    pub hybrid_rules:              HybridRules,
    pub minimum_collection_amount: Decimal,
    pub maximum_outstanding:       Option<Decimal>,
    pub collection_method:         CollectionMethod,
    pub created_at:                DateTime<Utc>,
}

impl PaymentConfiguration {
    /// Onboarding default: everything through the platform.
    pub fn onboarding(barber_id: impl Into<BarberId>, collection_method: CollectionMethod) -> Self {
        Self {
            barber_id: barber_id.into(),
            version: 0,
            mode: PaymentMode::Centralized,
            primary_processor: None,
            fallback_to_platform: true,
            commission_rate: None,
            hybrid_rules: HybridRules::default(),
            minimum_collection_amount: Decimal::new(10, 0),
            maximum_outstanding: None,
            collection_method,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConnection {
    pub connection_id:      ConnectionId,
    pub barber_id:          BarberId,
    pub processor_type:     ProcessorType,
    pub account_id:         String,
    pub status:             ConnectionStatus,
    #[serde(skip_serializing)]
    pub webhook_secret:     Option<String>,
    pub capabilities:       Vec<String>,
    pub total_transactions: i64,
    pub total_volume:       Decimal,
    pub created_at:         DateTime<Utc>,
    pub updated_at:         DateTime<Utc>,
    pub revoked_at:         Option<DateTime<Utc>>,
}

impl ProcessorConnection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// What a barber supplies when linking an account.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub barber_id:      BarberId,
    pub processor_type: ProcessorType,
    pub account_id:     String,
    pub webhook_secret: String,
    pub capabilities:   Vec<String>,
}

pub trait PaymentSettings {
    /// Live (highest-version) configuration, if the barber was onboarded.
    fn payment_configuration(&self, barber_id: &str) -> PayResult<Option<PaymentConfiguration>>;

    /// Connections with `status = connected`, oldest first.
    fn active_connections(&self, barber_id: &str) -> PayResult<Vec<ProcessorConnection>>;

    fn connection(&self, connection_id: &str) -> PayResult<Option<ProcessorConnection>>;

    /// Lookup by the processor's account identifier: the live link if there
    /// is one, else the most recently revoked.
    fn connection_for_account(
        &self,
        processor: ProcessorType,
        account_id: &str,
    ) -> PayResult<Option<ProcessorConnection>>;

    /// Commission on succeeded transactions not yet collected.
    fn outstanding_commission(&self, barber_id: &str) -> PayResult<Decimal>;
}
