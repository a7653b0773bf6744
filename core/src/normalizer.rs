//! Webhook normalizer — vendor payload → `CanonicalEvent`.
//!
//! Amounts leave here as major-unit decimals at the currency's precision,
//! whatever the vendor's encoding. Events we do not model come out as
//! `Unknown` and are acknowledged upstream; they are never an error.

use crate::{
    error::NormalizationError,
    processors::ProcessorTable,
    types::{ProcessorType, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalEventType {
    Succeeded,
    Failed,
    Refunded,
    Disputed,
    Canceled,
    Pending,
    Unknown,
}

impl CanonicalEventType {
    /// Transaction status this event asserts, if any.
    pub fn status(&self) -> Option<TransactionStatus> {
        match self {
            Self::Succeeded => Some(TransactionStatus::Succeeded),
            Self::Failed => Some(TransactionStatus::Failed),
            Self::Refunded => Some(TransactionStatus::Refunded),
            Self::Disputed => Some(TransactionStatus::Disputed),
            Self::Canceled => Some(TransactionStatus::Canceled),
            Self::Pending => Some(TransactionStatus::Pending),
            Self::Unknown => None,
        }
    }

    pub fn from_status(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending => Self::Pending,
            TransactionStatus::Succeeded => Self::Succeeded,
            TransactionStatus::Failed => Self::Failed,
            TransactionStatus::Canceled => Self::Canceled,
            TransactionStatus::Refunded => Self::Refunded,
            TransactionStatus::Disputed => Self::Disputed,
        }
    }
}

/// A processor event in processor-neutral form. `external_id`, `amount` and
/// `currency` are always present unless `event_type` is `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub processor:         ProcessorType,
    pub event_type:        CanonicalEventType,
    pub vendor_event_id:   Option<String>,
    pub vendor_event_type: String,
    pub external_id:       Option<String>,
    pub amount:            Option<Decimal>,
    pub currency:          Option<String>,
    pub occurred_at:       Option<DateTime<Utc>>,
    /// Vendor fields with no canonical slot.
    pub metadata:          BTreeMap<String, serde_json::Value>,
}

impl CanonicalEvent {
    pub fn unknown(
        processor: ProcessorType,
        vendor_event_id: Option<String>,
        vendor_event_type: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            processor,
            event_type: CanonicalEventType::Unknown,
            vendor_event_id,
            vendor_event_type: vendor_event_type.into(),
            external_id: None,
            amount: None,
            currency: None,
            occurred_at: None,
            metadata,
        }
    }

    pub fn status(&self) -> Option<TransactionStatus> {
        self.event_type.status()
    }
}

pub struct WebhookNormalizer<'a> {
    processors: &'a ProcessorTable,
}

impl<'a> WebhookNormalizer<'a> {
    pub fn new(processors: &'a ProcessorTable) -> Self {
        Self { processors }
    }

    pub fn normalize(
        &self,
        processor: ProcessorType,
        payload: &serde_json::Value,
    ) -> Result<CanonicalEvent, NormalizationError> {
        let strategy = self
            .processors
            .get(processor)
            .ok_or_else(|| NormalizationError::Malformed {
                processor,
                detail: "no normalizer registered".into(),
            })?;
        let event = strategy.normalizer.normalize(payload)?;
        if event.event_type == CanonicalEventType::Unknown {
            log::debug!(
                "processor={processor} normalize: ignoring unmodelled event type '{}'",
                event.vendor_event_type
            );
        }
        Ok(event)
    }
}
