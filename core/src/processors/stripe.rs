//! Stripe Connect webhooks.
//!
//! Header: `stripe-signature: t=<unix>,v1=<hex>[,v1=<hex>...]`, HMAC-SHA256
//! over `"{t}.{body}"`. Amounts are integer minor units. The connected
//! account comes from the top-level `account` field.

use super::{
    check_freshness, header, hmac_sha256, str_at, unmapped_fields, verify_hmac_sha256,
    AuthContext, Headers, PayloadNormalizer, WebhookAuthenticator,
};
use crate::{
    error::{NormalizationError, VerificationError},
    money,
    normalizer::{CanonicalEvent, CanonicalEventType},
    types::ProcessorType,
};
use chrono::{TimeZone, Utc};
use serde_json::Value;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Object fields consumed into canonical slots.
const MAPPED: &[&str] = &["id", "amount", "amount_received", "currency", "payment_intent", "charge"];

#[derive(Debug, Clone, Copy, Default)]
pub struct StripeProtocol;

impl StripeProtocol {
    /// Value for `stripe-signature` that verifies `body` under `secret`.
    pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, VerificationError> {
        let t = timestamp.to_string();
        let mac = hmac_sha256(secret, &[t.as_bytes(), b".", body])?;
        Ok(format!("t={t},v1={}", hex::encode(mac)))
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_signature_header(raw: &str) -> Result<SignatureHeader, VerificationError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in raw.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => {
                timestamp = Some(t.parse::<i64>().map_err(|_| {
                    VerificationError::MalformedSignature(format!("bad timestamp '{t}'"))
                })?)
            }
            Some(("v1", sig)) => signatures.push(
                hex::decode(sig)
                    .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?,
            ),
            // v0 and unknown schemes are ignored
            _ => {}
        }
    }
    let timestamp =
        timestamp.ok_or_else(|| VerificationError::MalformedSignature("missing t=".into()))?;
    if signatures.is_empty() {
        return Err(VerificationError::MalformedSignature("missing v1=".into()));
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

impl WebhookAuthenticator for StripeProtocol {
    fn account_reference(&self, payload: &Value) -> Result<String, VerificationError> {
        str_at(payload, "/account")
            .map(str::to_string)
            .ok_or(VerificationError::MissingAccount)
    }

    fn authenticate(
        &self,
        headers: &Headers,
        body: &[u8],
        secret: &str,
        ctx: &AuthContext<'_>,
    ) -> Result<(), VerificationError> {
        let parsed = parse_signature_header(header(headers, SIGNATURE_HEADER)?)?;
        let signed_at = Utc
            .timestamp_opt(parsed.timestamp, 0)
            .single()
            .ok_or_else(|| VerificationError::MalformedSignature("timestamp out of range".into()))?;
        check_freshness(signed_at, ctx)?;

        let t = parsed.timestamp.to_string();
        let parts: [&[u8]; 3] = [t.as_bytes(), b".", body];
        // Stripe sends several v1 values while a secret is being rolled.
        let mut last = VerificationError::SignatureMismatch;
        for candidate in &parsed.signatures {
            match verify_hmac_sha256(secret, &parts, candidate) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl PayloadNormalizer for StripeProtocol {
    fn normalize(&self, payload: &Value) -> Result<CanonicalEvent, NormalizationError> {
        let malformed = |detail: &str| NormalizationError::Malformed {
            processor: ProcessorType::Stripe,
            detail: detail.to_string(),
        };
        let vendor_type = str_at(payload, "/type").ok_or_else(|| malformed("missing type"))?;
        let vendor_id = str_at(payload, "/id").map(str::to_string);
        let object = payload.pointer("/data/object");
        let mut metadata = unmapped_fields(object, MAPPED);
        if let Some(id) = &vendor_id {
            metadata.insert("vendor_event_id".into(), Value::String(id.clone()));
        }

        let event_type = match vendor_type {
            "payment_intent.succeeded" | "charge.succeeded" => CanonicalEventType::Succeeded,
            "payment_intent.payment_failed" | "charge.failed" => CanonicalEventType::Failed,
            "payment_intent.processing" | "charge.pending" => CanonicalEventType::Pending,
            "payment_intent.canceled" => CanonicalEventType::Canceled,
            "charge.refunded" => CanonicalEventType::Refunded,
            "charge.dispute.created" => CanonicalEventType::Disputed,
            other => {
                return Ok(CanonicalEvent::unknown(
                    ProcessorType::Stripe,
                    vendor_id,
                    other,
                    metadata,
                ))
            }
        };
        let object = object.ok_or_else(|| malformed("missing data.object"))?;

        // Everything is keyed by the PaymentIntent so that charge, refund and
        // dispute events land on the same row as the intent's own events.
        let external_id = (if vendor_type.starts_with("payment_intent.") {
            str_at(object, "/id")
        } else if vendor_type == "charge.dispute.created" {
            str_at(object, "/payment_intent").or_else(|| str_at(object, "/charge"))
        } else {
            str_at(object, "/payment_intent").or_else(|| str_at(object, "/id"))
        })
        .ok_or_else(|| malformed("missing object id"))?
        .to_string();

        let currency = str_at(object, "/currency")
            .map(money::normalize_currency)
            .ok_or_else(|| malformed("missing currency"))?;
        let raw_amount = if vendor_type == "payment_intent.succeeded" {
            object.get("amount_received").or_else(|| object.get("amount"))
        } else {
            object.get("amount")
        };
        let minor = raw_amount
            .and_then(Value::as_i64)
            .ok_or_else(|| NormalizationError::InvalidAmount {
                processor: ProcessorType::Stripe,
                raw: raw_amount.map(|v| v.to_string()).unwrap_or_default(),
            })?;
        if minor < 0 {
            return Err(NormalizationError::InvalidAmount {
                processor: ProcessorType::Stripe,
                raw: minor.to_string(),
            });
        }

        let occurred_at = payload
            .get("created")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(CanonicalEvent {
            processor: ProcessorType::Stripe,
            event_type,
            vendor_event_id: vendor_id,
            vendor_event_type: vendor_type.to_string(),
            external_id: Some(external_id),
            amount: Some(money::from_minor_units(minor, &currency)),
            currency: Some(currency),
            occurred_at,
            metadata,
        })
    }
}
