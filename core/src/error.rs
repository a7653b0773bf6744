use crate::types::{BarberId, ProcessorType};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state for {entity} '{id}': {detail}")]
    InvalidState {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PayResult<T> = Result<T, PayError>;

/// Why the router could not place a payment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingErrorKind {
    #[error("no payment configuration on file")]
    NoConfiguration,

    #[error("no connected external processor and platform fallback is disabled")]
    NoActiveConnection,

    #[error("outstanding commission limit reached and platform fallback is disabled")]
    OutstandingLimit,

    #[error("invalid amount or currency: {0}")]
    InvalidAmount(String),
}

/// A payment attempt that could not be routed. Carries enough context for the
/// caller to log the attempt and show a user-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("routing failed for barber {barber_id} (appointment {appointment_id:?}, mode {mode:?}, amount {amount} {currency}): {kind}")]
pub struct RoutingError {
    pub kind:           RoutingErrorKind,
    pub barber_id:      BarberId,
    pub appointment_id: Option<String>,
    pub mode:           Option<String>,
    pub amount:         Decimal,
    pub currency:       String,
}

impl RoutingError {
    /// Message safe to show to the paying client.
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            RoutingErrorKind::InvalidAmount(_) => {
                "This payment amount could not be processed. Please check the booking and try again."
            }
            _ => "This barber cannot accept this payment method right now. Please try another payment method.",
        }
    }
}

/// Webhook rejected before reconciliation. Never shown to the processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no verifier registered for {0}")]
    UnsupportedProcessor(ProcessorType),

    #[error("missing signature header '{0}'")]
    MissingHeader(&'static str),

    #[error("malformed signature header: {0}")]
    MalformedSignature(String),

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("signature timestamp outside tolerance ({age_secs}s old)")]
    StaleTimestamp { age_secs: i64 },

    #[error("payload carries no account identifier")]
    MissingAccount,

    #[error("payload is not valid JSON: {0}")]
    UnreadablePayload(String),

    #[error("no connection for {processor} account '{account_id}'")]
    UnknownConnection {
        processor: ProcessorType,
        account_id: String,
    },

    #[error("connection {connection_id} is {status}")]
    InactiveConnection {
        connection_id: String,
        status: String,
    },

    #[error("connection {0} has no webhook secret")]
    MissingSecret(String),
}

impl VerificationError {
    /// Signature-level failures are the only ones a `fail_open` policy may bypass.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_)
                | Self::MalformedSignature(_)
                | Self::SignatureMismatch
                | Self::StaleTimestamp { .. }
                | Self::MissingSecret(_)
        )
    }
}

/// An authentic payload whose shape the normalizer could not read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("{processor} payload could not be parsed: {detail}")]
    Malformed {
        processor: ProcessorType,
        detail: String,
    },

    #[error("{processor} payload has invalid amount '{raw}'")]
    InvalidAmount {
        processor: ProcessorType,
        raw: String,
    },
}

/// Missing or invalid per-processor fee configuration. Always recovered from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeeCalculationError {
    #[error("no fee schedule configured for '{0}'")]
    MissingSchedule(String),

    #[error("fee schedule for '{key}' is invalid: {detail}")]
    InvalidSchedule { key: String, detail: String },

    #[error("commission rate {0} is outside [0, 1)")]
    InvalidCommissionRate(Decimal),
}

/// Failure talking to a processor API through the gateway adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("processor API timed out after {0} ms")]
    Timeout(u64),

    #[error("processor API unavailable: {0}")]
    Unavailable(String),

    #[error("processor rejected the request: {0}")]
    Rejected(String),

    #[error("transaction '{0}' not found at processor")]
    NotFound(String),
}

/// Failure submitting a commission collection to billing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    #[error("billing unavailable: {0}")]
    Unavailable(String),

    #[error("billing rejected collection: {0}")]
    Rejected(String),
}
