//! Per-processor webhook protocols, dispatched through `ProcessorTable`.
//!
//! Each processor contributes two strategies: an authenticator (where the
//! account id lives, how the signature is computed) and a payload normalizer
//! (how vendor events map onto `CanonicalEvent`).

mod paypal;
mod square;
mod stripe;

pub use paypal::PaypalProtocol;
pub use square::SquareProtocol;
pub use stripe::StripeProtocol;

use crate::{
    error::{NormalizationError, VerificationError},
    normalizer::CanonicalEvent,
    types::ProcessorType,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Request headers, keys lowercased.
pub type Headers = BTreeMap<String, String>;

/// Inputs an authenticator needs besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub now:                     DateTime<Utc>,
    pub tolerance_secs:          i64,
    pub square_notification_url: &'a str,
}

pub trait WebhookAuthenticator: Send + Sync {
    /// The processor-side account identifier that selects the connection.
    fn account_reference(&self, payload: &serde_json::Value) -> Result<String, VerificationError>;

    fn authenticate(
        &self,
        headers: &Headers,
        body: &[u8],
        secret: &str,
        ctx: &AuthContext<'_>,
    ) -> Result<(), VerificationError>;
}

pub trait PayloadNormalizer: Send + Sync {
    fn normalize(&self, payload: &serde_json::Value) -> Result<CanonicalEvent, NormalizationError>;
}

#[derive(Clone)]
pub struct ProcessorStrategy {
    pub authenticator: Arc<dyn WebhookAuthenticator>,
    pub normalizer: Arc<dyn PayloadNormalizer>,
}

#[derive(Clone, Default)]
pub struct ProcessorTable {
    entries: HashMap<ProcessorType, ProcessorStrategy>,
}

impl ProcessorTable {
    /// Stripe, Square and PayPal.
    pub fn standard() -> Self {
        let mut table = Self::default();
        let stripe = Arc::new(StripeProtocol);
        let square = Arc::new(SquareProtocol);
        let paypal = Arc::new(PaypalProtocol);
        table.register(ProcessorType::Stripe, stripe.clone(), stripe);
        table.register(ProcessorType::Square, square.clone(), square);
        table.register(ProcessorType::Paypal, paypal.clone(), paypal);
        table
    }

    pub fn register(
        &mut self,
        processor: ProcessorType,
        authenticator: Arc<dyn WebhookAuthenticator>,
        normalizer: Arc<dyn PayloadNormalizer>,
    ) {
        self.entries.insert(
            processor,
            ProcessorStrategy {
                authenticator,
                normalizer,
            },
        );
    }

    pub fn get(&self, processor: ProcessorType) -> Option<&ProcessorStrategy> {
        self.entries.get(&processor)
    }
}

// ── Shared helpers ────────────────────────────────────────────────

pub(crate) fn header<'a>(
    headers: &'a Headers,
    name: &'static str,
) -> Result<&'a str, VerificationError> {
    headers
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or(VerificationError::MissingHeader(name))
}

fn keyed(secret: &str) -> Result<HmacSha256, VerificationError> {
    if secret.is_empty() {
        return Err(VerificationError::MissingSecret(String::new()));
    }
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VerificationError::MalformedSignature(e.to_string()))
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> Result<Vec<u8>, VerificationError> {
    let mut mac = keyed(secret)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of `expected` against HMAC-SHA256 of `parts`.
pub(crate) fn verify_hmac_sha256(
    secret: &str,
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<(), VerificationError> {
    let mut mac = keyed(secret)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected)
        .map_err(|_| VerificationError::SignatureMismatch)
}

pub(crate) fn check_freshness(
    signed_at: DateTime<Utc>,
    ctx: &AuthContext<'_>,
) -> Result<(), VerificationError> {
    let age_secs = (ctx.now - signed_at).num_seconds();
    if age_secs.abs() > ctx.tolerance_secs {
        return Err(VerificationError::StaleTimestamp { age_secs });
    }
    Ok(())
}

/// Look up a string at a JSON pointer such as `/data/object/id`.
pub(crate) fn str_at<'a>(payload: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(|v| v.as_str())
}

/// Every field of `object` not in `mapped`, for the event's metadata bag.
pub(crate) fn unmapped_fields(
    object: Option<&serde_json::Value>,
    mapped: &[&str],
) -> BTreeMap<String, serde_json::Value> {
    object
        .and_then(|o| o.as_object())
        .map(|o| {
            o.iter()
                .filter(|(k, _)| !mapped.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}
