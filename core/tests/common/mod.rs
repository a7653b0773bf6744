//! Shared fixtures for the integration tests: an engine on a fixed clock,
//! scripted gateway and billing fakes, and signed webhook builders.
#![allow(dead_code)]

use barberpay_core::{
    clock::{Clock, FixedClock},
    config::PaymentsConfig,
    engine::PaymentEngine,
    error::{BillingError, GatewayError},
    gateway::{
        CollectionBilling, ExternalPayment, ExternalPaymentRequest, GatewayAdapter,
        GatewayTransaction,
    },
    ingest::WebhookRequest,
    processors::{PaypalProtocol, SquareProtocol, StripeProtocol},
    settings::{NewConnection, PaymentConfiguration, ProcessorConnection},
    store::PaymentStore,
    types::{BarberId, PaymentMode, ProcessorType, TransactionId, TransactionStatus},
};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Monday 2026-03-02 15:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
}

pub fn dec(raw: &str) -> Decimal {
    raw.parse().unwrap()
}

pub fn secret_for(account_id: &str) -> String {
    format!("whsec_{account_id}")
}

pub struct Harness {
    pub engine: PaymentEngine,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<FakeGateway>,
    pub billing: Arc<FakeBilling>,
}

/// In-memory engine on `default_test()` config.
pub fn build() -> Harness {
    build_with(PaymentsConfig::default_test(), PaymentStore::in_memory().unwrap())
}

pub fn build_with_config(config: PaymentsConfig) -> Harness {
    build_with(config, PaymentStore::in_memory().unwrap())
}

pub fn build_with(config: PaymentsConfig, store: PaymentStore) -> Harness {
    let clock = Arc::new(FixedClock::new(t0()));
    let gateway = Arc::new(FakeGateway::default());
    let billing = Arc::new(FakeBilling::default());
    let engine = PaymentEngine::build(
        store,
        config,
        clock.clone(),
        gateway.clone(),
        billing.clone(),
    )
    .unwrap();
    Harness {
        engine,
        clock,
        gateway,
        billing,
    }
}

/// A fresh SQLite file under the system temp dir.
pub fn temp_db_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("barberpay-{tag}-{}.db", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

impl Harness {
    /// Save a configuration built from the onboarding default.
    pub fn configure(
        &self,
        barber_id: &str,
        mode: PaymentMode,
        edit: impl FnOnce(&mut PaymentConfiguration),
    ) -> PaymentConfiguration {
        let mut config = PaymentConfiguration::onboarding(
            barber_id,
            self.engine.config().collection.default_method,
        );
        config.mode = mode;
        edit(&mut config);
        self.engine.save_configuration(&config).unwrap()
    }

    /// Link an account whose webhook secret is `secret_for(account_id)`.
    pub fn connect(
        &self,
        barber_id: &str,
        processor: ProcessorType,
        account_id: &str,
    ) -> ProcessorConnection {
        self.engine
            .register_connection(NewConnection {
                barber_id: barber_id.into(),
                processor_type: processor,
                account_id: account_id.into(),
                webhook_secret: secret_for(account_id),
                capabilities: vec!["card_payments".into(), "refunds".into()],
            })
            .unwrap()
    }

    pub fn stripe_request(&self, payload: &Value) -> WebhookRequest {
        let account = payload["account"].as_str().unwrap();
        stripe_request(&secret_for(account), self.clock.now(), payload)
    }

    pub fn square_request(&self, payload: &Value) -> WebhookRequest {
        let account = payload["merchant_id"].as_str().unwrap();
        square_request(
            &secret_for(account),
            &self.engine.config().verification.square_notification_url,
            payload,
        )
    }

    pub fn paypal_request(&self, payload: &Value, account: &str) -> WebhookRequest {
        paypal_request(&secret_for(account), self.clock.now(), payload)
    }

    /// Deliver a signed Stripe event through the ingest boundary.
    pub fn deliver_stripe(&self, payload: &Value) -> u16 {
        self.engine
            .ingest()
            .handle(&self.stripe_request(payload))
            .status
    }
}

// ── Signed webhook builders ───────────────────────────────────────

pub fn stripe_request(secret: &str, now: DateTime<Utc>, payload: &Value) -> WebhookRequest {
    let body = serde_json::to_vec(payload).unwrap();
    let signature = StripeProtocol::sign(secret, now.timestamp(), &body).unwrap();
    WebhookRequest::new(
        ProcessorType::Stripe,
        [("Stripe-Signature", signature)],
        body,
    )
}

pub fn square_request(secret: &str, notification_url: &str, payload: &Value) -> WebhookRequest {
    let body = serde_json::to_vec(payload).unwrap();
    let signature = SquareProtocol::sign(secret, notification_url, &body).unwrap();
    WebhookRequest::new(
        ProcessorType::Square,
        [("X-Square-HmacSha256-Signature", signature)],
        body,
    )
}

pub fn paypal_request(secret: &str, now: DateTime<Utc>, payload: &Value) -> WebhookRequest {
    let body = serde_json::to_vec(payload).unwrap();
    let id = format!("tx-{}", uuid::Uuid::new_v4());
    let time = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let signature = PaypalProtocol::sign(secret, &id, &time, &body).unwrap();
    WebhookRequest::new(
        ProcessorType::Paypal,
        [
            ("PAYPAL-TRANSMISSION-ID", id),
            ("PAYPAL-TRANSMISSION-TIME", time),
            ("PAYPAL-TRANSMISSION-SIG", signature),
        ],
        body,
    )
}

/// A Stripe event about PaymentIntent `intent`. `payment_intent.*` types
/// carry the intent itself; `charge.*` types carry a charge pointing at it.
pub fn stripe_event(event_type: &str, account: &str, intent: &str, amount_minor: i64) -> Value {
    let object = if event_type.starts_with("payment_intent.") {
        json!({
            "id": intent,
            "amount": amount_minor,
            "amount_received": amount_minor,
            "currency": "usd",
        })
    } else {
        json!({
            "id": format!("ch_{intent}"),
            "payment_intent": intent,
            "amount": amount_minor,
            "currency": "usd",
        })
    };
    json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": event_type,
        "account": account,
        "created": t0().timestamp(),
        "data": { "object": object },
    })
}

pub fn square_payment_event(merchant: &str, payment_id: &str, status: &str, amount_minor: i64) -> Value {
    json!({
        "merchant_id": merchant,
        "type": "payment.updated",
        "event_id": format!("sq-evt-{}", uuid::Uuid::new_v4()),
        "created_at": "2026-03-02T15:00:00Z",
        "data": { "object": { "payment": {
            "id": payment_id,
            "status": status,
            "amount_money": { "amount": amount_minor, "currency": "USD" },
        }}},
    })
}

pub fn paypal_capture_event(merchant: &str, capture_id: &str, value: &str) -> Value {
    json!({
        "id": format!("WH-{}", uuid::Uuid::new_v4()),
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "create_time": "2026-03-02T15:00:00Z",
        "resource": {
            "id": capture_id,
            "status": "COMPLETED",
            "amount": { "value": value, "currency_code": "USD" },
            "payee": { "merchant_id": merchant },
        },
    })
}

pub fn square_refund_event(merchant: &str, payment_id: &str, status: &str, amount_minor: i64) -> Value {
    json!({
        "merchant_id": merchant,
        "type": "refund.updated",
        "event_id": format!("sq-evt-{}", uuid::Uuid::new_v4()),
        "created_at": "2026-03-02T16:00:00Z",
        "data": { "object": { "refund": {
            "id": format!("rf_{payment_id}"),
            "payment_id": payment_id,
            "status": status,
            "amount_money": { "amount": amount_minor, "currency": "USD" },
        }}},
    })
}

pub fn square_dispute_event(merchant: &str, payment_id: &str, amount_minor: i64) -> Value {
    json!({
        "merchant_id": merchant,
        "type": "dispute.created",
        "event_id": format!("sq-evt-{}", uuid::Uuid::new_v4()),
        "created_at": "2026-03-02T16:00:00Z",
        "data": { "object": { "dispute": {
            "id": format!("dp_{payment_id}"),
            "state": "EVIDENCE_REQUIRED",
            "disputed_payment": { "payment_id": payment_id },
            "amount_money": { "amount": amount_minor, "currency": "USD" },
        }}},
    })
}

/// A refund or reversal of `capture_id`; the resource is the refund, the
/// capture is reached through its `up` link.
pub fn paypal_refund_event(event_type: &str, merchant: &str, capture_id: &str, value: &str) -> Value {
    json!({
        "id": format!("WH-{}", uuid::Uuid::new_v4()),
        "event_type": event_type,
        "create_time": "2026-03-02T16:00:00Z",
        "resource": {
            "id": format!("REF-{capture_id}"),
            "status": "COMPLETED",
            "amount": { "value": value, "currency_code": "USD" },
            "payee": { "merchant_id": merchant },
            "links": [
                { "rel": "self", "href": format!("https://api.paypal.test/v2/payments/refunds/REF-{capture_id}") },
                { "rel": "up", "href": format!("https://api.paypal.test/v2/payments/captures/{capture_id}") },
            ],
        },
    })
}

pub fn paypal_dispute_event(merchant: &str, capture_id: &str, value: &str) -> Value {
    json!({
        "id": format!("WH-{}", uuid::Uuid::new_v4()),
        "event_type": "CUSTOMER.DISPUTE.CREATED",
        "create_time": "2026-03-02T16:00:00Z",
        "resource": {
            "dispute_id": format!("PP-D-{capture_id}"),
            "reason": "MERCHANDISE_OR_SERVICE_NOT_RECEIVED",
            "dispute_amount": { "value": value, "currency_code": "USD" },
            "disputed_transactions": [
                { "seller_transaction_id": capture_id, "seller": { "merchant_id": merchant } },
            ],
        },
    })
}

pub fn gateway_txn(id: &str, status: TransactionStatus, amount: &str, at: DateTime<Utc>) -> GatewayTransaction {
    GatewayTransaction {
        external_transaction_id: id.into(),
        status,
        amount: dec(amount),
        currency: "USD".into(),
        updated_at: at,
        metadata: BTreeMap::new(),
    }
}

// ── Fakes ─────────────────────────────────────────────────────────

/// Per-account scripted processor. `list_recent_transactions` fails while
/// the account has failures queued.
#[derive(Default)]
pub struct FakeGateway {
    transactions: Mutex<HashMap<String, Vec<GatewayTransaction>>>,
    failures: Mutex<HashMap<String, u32>>,
    list_calls: AtomicUsize,
    payments: AtomicUsize,
}

impl FakeGateway {
    pub fn script(&self, account_id: &str, txns: Vec<GatewayTransaction>) {
        self.transactions
            .lock()
            .unwrap()
            .insert(account_id.to_string(), txns);
    }

    pub fn fail_next(&self, account_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(account_id.to_string(), times);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn recorded(&self, account_id: &str) -> Vec<GatewayTransaction> {
        self.transactions
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl GatewayAdapter for FakeGateway {
    fn create_external_payment(
        &self,
        _connection: &ProcessorConnection,
        _request: &ExternalPaymentRequest,
    ) -> Result<ExternalPayment, GatewayError> {
        let n = self.payments.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExternalPayment {
            external_transaction_id: format!("ext-pay-{n}"),
            status: TransactionStatus::Pending,
        })
    }

    fn refund(
        &self,
        connection: &ProcessorConnection,
        external_transaction_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<GatewayTransaction, GatewayError> {
        let mut txn = self
            .recorded(&connection.account_id)
            .into_iter()
            .find(|t| t.external_transaction_id == external_transaction_id)
            .unwrap_or_else(|| gateway_txn(external_transaction_id, TransactionStatus::Succeeded, "0", t0()));
        txn.status = TransactionStatus::Refunded;
        Ok(txn)
    }

    fn get_transaction(
        &self,
        connection: &ProcessorConnection,
        external_transaction_id: &str,
    ) -> Result<GatewayTransaction, GatewayError> {
        self.recorded(&connection.account_id)
            .into_iter()
            .find(|t| t.external_transaction_id == external_transaction_id)
            .ok_or_else(|| GatewayError::NotFound(external_transaction_id.into()))
    }

    fn list_recent_transactions(
        &self,
        connection: &ProcessorConnection,
        since: DateTime<Utc>,
        _timeout: std::time::Duration,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&connection.account_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(GatewayError::Unavailable("processor API down".into()));
                }
            }
        }
        Ok(self
            .recorded(&connection.account_id)
            .into_iter()
            .filter(|t| t.updated_at >= since)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingCall {
    pub barber_id: BarberId,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_ids: Vec<TransactionId>,
}

/// Records every collection request; refuses them while `failing` is set.
#[derive(Default)]
pub struct FakeBilling {
    calls: Mutex<Vec<BillingCall>>,
    failing: AtomicBool,
}

impl FakeBilling {
    pub fn calls(&self) -> Vec<BillingCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CollectionBilling for FakeBilling {
    fn create_collection(
        &self,
        barber_id: &BarberId,
        amount: Decimal,
        currency: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<String, BillingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Unavailable("billing offline".into()));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(BillingCall {
            barber_id: barber_id.clone(),
            amount,
            currency: currency.to_string(),
            transaction_ids: transaction_ids.to_vec(),
        });
        Ok(format!("bill-{}", calls.len()))
    }
}
