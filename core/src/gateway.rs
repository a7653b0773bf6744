//! Outbound collaborators: processor APIs and platform billing.
//!
//! Vendor SDK calls live behind these traits. The core only consumes the
//! results; it never retries inside a call.

use crate::{
    error::{BillingError, GatewayError},
    settings::ProcessorConnection,
    types::{BarberId, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A transaction as the processor reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub external_transaction_id: String,
    pub status:                  TransactionStatus,
    pub amount:                  Decimal,
    pub currency:                String,
    pub updated_at:              DateTime<Utc>,
    #[serde(default)]
    pub metadata:                BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPaymentRequest {
    pub amount:          Decimal,
    pub currency:        String,
    /// Opaque token for the customer's payment method at the processor.
    pub payment_method:  String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPayment {
    pub external_transaction_id: String,
    pub status: TransactionStatus,
}

pub trait GatewayAdapter: Send + Sync {
    fn create_external_payment(
        &self,
        connection: &ProcessorConnection,
        request: &ExternalPaymentRequest,
    ) -> Result<ExternalPayment, GatewayError>;

    /// `amount = None` refunds in full.
    fn refund(
        &self,
        connection: &ProcessorConnection,
        external_transaction_id: &str,
        amount: Option<Decimal>,
    ) -> Result<GatewayTransaction, GatewayError>;

    fn get_transaction(
        &self,
        connection: &ProcessorConnection,
        external_transaction_id: &str,
    ) -> Result<GatewayTransaction, GatewayError>;

    /// Transactions updated at or after `since`. Must give up after `timeout`.
    fn list_recent_transactions(
        &self,
        connection: &ProcessorConnection,
        since: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<GatewayTransaction>, GatewayError>;
}

/// Platform billing: charges a barber the commission they owe.
pub trait CollectionBilling: Send + Sync {
    /// Returns billing's own reference for the collection. The final outcome
    /// arrives later through `record_collection_outcome`.
    fn create_collection(
        &self,
        barber_id: &BarberId,
        amount: Decimal,
        currency: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<String, BillingError>;
}
