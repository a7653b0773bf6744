//! Square webhooks.
//!
//! Header: `x-square-hmacsha256-signature: <base64>`, HMAC-SHA256 over the
//! subscription's notification URL followed by the raw body. Square signs
//! no timestamp, so there is no freshness window. Amounts are
//! `amount_money {amount: <minor units>, currency}`.

use super::{
    header, hmac_sha256, str_at, unmapped_fields, verify_hmac_sha256, AuthContext, Headers,
    PayloadNormalizer, WebhookAuthenticator,
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

pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

const MAPPED: &[&str] = &["id", "payment_id", "status", "amount_money", "disputed_payment"];

#[derive(Debug, Clone, Copy, Default)]
pub struct SquareProtocol;

impl SquareProtocol {
    pub fn sign(secret: &str, notification_url: &str, body: &[u8]) -> Result<String, VerificationError> {
        let mac = hmac_sha256(secret, &[notification_url.as_bytes(), body])?;
        Ok(STANDARD.encode(mac))
    }
}

impl WebhookAuthenticator for SquareProtocol {
    fn account_reference(&self, payload: &Value) -> Result<String, VerificationError> {
        str_at(payload, "/merchant_id")
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
        let provided = STANDARD
            .decode(header(headers, SIGNATURE_HEADER)?)
            .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;
        verify_hmac_sha256(
            secret,
            &[ctx.square_notification_url.as_bytes(), body],
            &provided,
        )
    }
}

impl PayloadNormalizer for SquareProtocol {
    fn normalize(&self, payload: &Value) -> Result<CanonicalEvent, NormalizationError> {
        let malformed = |detail: &str| NormalizationError::Malformed {
            processor: ProcessorType::Square,
            detail: detail.to_string(),
        };
        let vendor_type = str_at(payload, "/type").ok_or_else(|| malformed("missing type"))?;
        let vendor_id = str_at(payload, "/event_id").map(str::to_string);

        let (kind, object_ptr) = match vendor_type {
            "payment.created" | "payment.updated" => ("payment", "/data/object/payment"),
            "refund.created" | "refund.updated" => ("refund", "/data/object/refund"),
            "dispute.created" => ("dispute", "/data/object/dispute"),
            _ => ("", ""),
        };
        let object = (!object_ptr.is_empty())
            .then(|| payload.pointer(object_ptr))
            .flatten();
        let mut metadata = unmapped_fields(object, MAPPED);
        if let Some(id) = &vendor_id {
            metadata.insert("vendor_event_id".into(), Value::String(id.clone()));
        }
        if kind.is_empty() {
            return Ok(CanonicalEvent::unknown(
                ProcessorType::Square,
                vendor_id,
                vendor_type,
                metadata,
            ));
        }
        let object = object.ok_or_else(|| malformed("missing data.object"))?;
        let status = str_at(object, "/status").unwrap_or_default();

        let (event_type, external_id) = match kind {
            "payment" => {
                let event_type = match status {
                    "COMPLETED" => CanonicalEventType::Succeeded,
                    "APPROVED" | "PENDING" => CanonicalEventType::Pending,
                    "FAILED" => CanonicalEventType::Failed,
                    "CANCELED" => CanonicalEventType::Canceled,
                    _ => CanonicalEventType::Unknown,
                };
                (event_type, str_at(object, "/id"))
            }
            "refund" => {
                // Only a completed refund moves money back.
                let event_type = if status == "COMPLETED" {
                    CanonicalEventType::Refunded
                } else {
                    CanonicalEventType::Unknown
                };
                (event_type, str_at(object, "/payment_id"))
            }
            _ => (
                CanonicalEventType::Disputed,
                str_at(object, "/disputed_payment/payment_id"),
            ),
        };
        if event_type == CanonicalEventType::Unknown {
            return Ok(CanonicalEvent::unknown(
                ProcessorType::Square,
                vendor_id,
                format!("{vendor_type}:{status}"),
                metadata,
            ));
        }
        let external_id = external_id
            .ok_or_else(|| malformed("missing payment id"))?
            .to_string();

        let currency = str_at(object, "/amount_money/currency")
            .map(money::normalize_currency)
            .ok_or_else(|| malformed("missing amount_money.currency"))?;
        let raw = object.pointer("/amount_money/amount");
        let minor = raw
            .and_then(Value::as_i64)
            .filter(|m| *m >= 0)
            .ok_or_else(|| NormalizationError::InvalidAmount {
                processor: ProcessorType::Square,
                raw: raw.map(|v| v.to_string()).unwrap_or_default(),
            })?;

        let occurred_at = str_at(payload, "/created_at")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(CanonicalEvent {
            processor: ProcessorType::Square,
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    const URL: &str = "https://hooks.example.test/square";

    fn ctx() -> AuthContext<'static> {
        AuthContext {
            now: Utc::now(),
            tolerance_secs: 300,
            square_notification_url: URL,
        }
    }

    #[test]
    fn signature_covers_the_notification_url() {
        let body = br#"{"merchant_id":"M1"}"#;
        let sig = SquareProtocol::sign("sq_key", URL, body).unwrap();
        let h: Headers = [(SIGNATURE_HEADER.to_string(), sig)].into_iter().collect();
        assert!(SquareProtocol.authenticate(&h, body, "sq_key", &ctx()).is_ok());

        let wrong_url = AuthContext {
            square_notification_url: "https://elsewhere.test/square",
            ..ctx()
        };
        assert_eq!(
            SquareProtocol.authenticate(&h, body, "sq_key", &wrong_url),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn completed_payment_is_succeeded_in_major_units() {
        let payload = json!({
            "merchant_id": "M1",
            "type": "payment.updated",
            "event_id": "e-1",
            "created_at": "2026-03-01T15:00:00Z",
            "data": {"object": {"payment": {
                "id": "sq_pay_1", "status": "COMPLETED",
                "amount_money": {"amount": 4550, "currency": "USD"},
                "location_id": "L1"
            }}}
        });
        let event = SquareProtocol.normalize(&payload).unwrap();
        assert_eq!(event.event_type, CanonicalEventType::Succeeded);
        assert_eq!(event.external_id.as_deref(), Some("sq_pay_1"));
        assert_eq!(event.amount, Some(Decimal::new(4550, 2)));
        assert_eq!(event.metadata["location_id"], "L1");
    }

    #[test]
    fn pending_refund_is_ignored() {
        let payload = json!({
            "merchant_id": "M1",
            "type": "refund.created",
            "data": {"object": {"refund": {
                "id": "r1", "payment_id": "sq_pay_1", "status": "PENDING",
                "amount_money": {"amount": 100, "currency": "USD"}
            }}}
        });
        let event = SquareProtocol.normalize(&payload).unwrap();
        assert_eq!(event.event_type, CanonicalEventType::Unknown);
    }
}
