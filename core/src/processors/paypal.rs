//! PayPal webhooks.
//!
//! Headers `paypal-transmission-id`, `paypal-transmission-time` and
//! `paypal-transmission-sig` (base64 HMAC-SHA256 over
//! `"{id}|{time}|{body}"`). Amounts are decimal strings.

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
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value;

pub const TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
pub const TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";
pub const TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";

const MAPPED: &[&str] = &["id", "status", "amount", "dispute_amount", "links", "payee"];

#[derive(Debug, Clone, Copy, Default)]
pub struct PaypalProtocol;

impl PaypalProtocol {
    pub fn sign(
        secret: &str,
        transmission_id: &str,
        transmission_time: &str,
        body: &[u8],
    ) -> Result<String, VerificationError> {
        let mac = hmac_sha256(
            secret,
            &[transmission_id.as_bytes(), b"|", transmission_time.as_bytes(), b"|", body],
        )?;
        Ok(STANDARD.encode(mac))
    }
}

fn is_dispute(payload: &Value) -> bool {
    str_at(payload, "/event_type").is_some_and(|t| t.starts_with("CUSTOMER.DISPUTE."))
}

impl WebhookAuthenticator for PaypalProtocol {
    fn account_reference(&self, payload: &Value) -> Result<String, VerificationError> {
        let account = if is_dispute(payload) {
            str_at(payload, "/resource/disputed_transactions/0/seller/merchant_id")
        } else {
            str_at(payload, "/resource/payee/merchant_id")
        };
        account
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
        let id = header(headers, TRANSMISSION_ID_HEADER)?;
        let time = header(headers, TRANSMISSION_TIME_HEADER)?;
        let sig = header(headers, TRANSMISSION_SIG_HEADER)?;

        let sent_at = DateTime::parse_from_rfc3339(time)
            .map_err(|e| VerificationError::MalformedSignature(format!("transmission time: {e}")))?
            .with_timezone(&Utc);
        check_freshness(sent_at, ctx)?;

        let provided = STANDARD
            .decode(sig)
            .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;
        verify_hmac_sha256(
            secret,
            &[id.as_bytes(), b"|", time.as_bytes(), b"|", body],
            &provided,
        )
    }
}

/// Capture id from a refund's `links[rel=up]` href (`.../captures/{id}`).
fn captured_id_from_links(resource: &Value) -> Option<&str> {
    resource
        .get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("up"))?
        .get("href")?
        .as_str()?
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
}

impl PayloadNormalizer for PaypalProtocol {
    fn normalize(&self, payload: &Value) -> Result<CanonicalEvent, NormalizationError> {
        let malformed = |detail: &str| NormalizationError::Malformed {
            processor: ProcessorType::Paypal,
            detail: detail.to_string(),
        };
        let vendor_type =
            str_at(payload, "/event_type").ok_or_else(|| malformed("missing event_type"))?;
        let vendor_id = str_at(payload, "/id").map(str::to_string);
        let resource = payload.get("resource");
        let mut metadata = unmapped_fields(resource, MAPPED);
        if let Some(id) = &vendor_id {
            metadata.insert("vendor_event_id".into(), Value::String(id.clone()));
        }

        let event_type = match vendor_type {
            "PAYMENT.CAPTURE.COMPLETED" => CanonicalEventType::Succeeded,
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => CanonicalEventType::Failed,
            "PAYMENT.CAPTURE.PENDING" => CanonicalEventType::Pending,
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => CanonicalEventType::Refunded,
            "CUSTOMER.DISPUTE.CREATED" => CanonicalEventType::Disputed,
            other => {
                return Ok(CanonicalEvent::unknown(
                    ProcessorType::Paypal,
                    vendor_id,
                    other,
                    metadata,
                ))
            }
        };
        let resource = resource.ok_or_else(|| malformed("missing resource"))?;

        let (external_id, amount_ptr) = match vendor_type {
            // The refund resource is the refund itself; its parent capture
            // is the transaction we track.
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => {
                (captured_id_from_links(resource), "/amount")
            }
            "CUSTOMER.DISPUTE.CREATED" => (
                str_at(resource, "/disputed_transactions/0/seller_transaction_id"),
                "/dispute_amount",
            ),
            _ => (str_at(resource, "/id"), "/amount"),
        };
        let external_id = external_id
            .ok_or_else(|| malformed("missing capture id"))?
            .to_string();

        let currency = resource
            .pointer(&format!("{amount_ptr}/currency_code"))
            .and_then(Value::as_str)
            .map(money::normalize_currency)
            .ok_or_else(|| malformed("missing currency_code"))?;
        let raw = resource
            .pointer(&format!("{amount_ptr}/value"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let amount = money::parse_decimal(raw, &currency)
            .filter(|a| !a.is_sign_negative())
            .ok_or_else(|| NormalizationError::InvalidAmount {
                processor: ProcessorType::Paypal,
                raw: raw.to_string(),
            })?;

        let occurred_at = str_at(payload, "/create_time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(CanonicalEvent {
            processor: ProcessorType::Paypal,
            event_type,
            vendor_event_id: vendor_id,
            vendor_event_type: vendor_type.to_string(),
            external_id: Some(external_id),
            amount: Some(amount),
            currency: Some(currency),
            occurred_at,
            metadata,
        })
    }
}
