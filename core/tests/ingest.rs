//! The webhook endpoint boundary: status codes and what each one leaves
//! behind.

mod common;

use barberpay_core::{
    config::PaymentsConfig,
    event::AuditEvent,
    ingest::{WebhookRequest, WebhookResponse},
    reconciler::ReconcileOutcome,
    settings::PaymentSettings,
    store::PaymentStore,
    types::{PaymentMode, ProcessorType},
};
use common::{build, build_with, build_with_config, stripe_event, temp_db_path, Harness};

fn onboarded() -> Harness {
    let h = build();
    h.configure("barber-g", PaymentMode::Decentralized, |_| {});
    h.connect("barber-g", ProcessorType::Stripe, "acct_g");
    h
}

#[test]
fn header_names_are_lowercased() {
    let req = WebhookRequest::new(
        ProcessorType::Stripe,
        [("Stripe-Signature", "t=1,v1=ab"), ("Content-TYPE", "application/json")],
        b"{}".to_vec(),
    );
    assert_eq!(req.headers.get("stripe-signature").map(String::as_str), Some("t=1,v1=ab"));
    assert!(req.headers.contains_key("content-type"));
    assert!(!req.headers.contains_key("Stripe-Signature"));
}

#[test]
fn accepted_delivery_returns_ok_with_the_outcome() {
    let h = onboarded();
    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_g1", 2_500));
    let (response, outcome) = h.engine.ingest().handle_with_outcome(&req);
    assert_eq!(response, WebhookResponse::OK);
    assert!(response.is_success());
    assert!(matches!(outcome, Some(ReconcileOutcome::Created { .. })));

    // A duplicate is still a success for the vendor.
    let (again, outcome) = h.engine.ingest().handle_with_outcome(&req);
    assert_eq!(again.status, 200);
    assert!(matches!(outcome, Some(ReconcileOutcome::Unchanged { .. })));
}

#[test]
fn unknown_event_types_are_acknowledged() {
    let h = onboarded();
    let req = h.stripe_request(&stripe_event("customer.created", "acct_g", "pi_g2", 0));
    let (response, outcome) = h.engine.ingest().handle_with_outcome(&req);
    assert_eq!(response.status, 200);
    assert!(matches!(outcome, Some(ReconcileOutcome::Ignored { .. })));
    assert!(h.engine.store().transactions_for_barber("barber-g").unwrap().is_empty());
}

#[test]
fn bad_signature_is_unauthorized_with_a_fixed_body() {
    let h = onboarded();
    let mut req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_g3", 2_500));
    req.body.push(b' ');
    let response = h.engine.ingest().handle(&req);
    assert_eq!(response, WebhookResponse::REJECTED);
    assert!(!response.is_success());
    assert_eq!(response.body, "rejected");
}

#[test]
fn authentic_but_malformed_payload_is_bad_request() {
    let h = onboarded();
    let mut payload = stripe_event("payment_intent.succeeded", "acct_g", "pi_g4", 2_500);
    payload["data"]["object"]
        .as_object_mut()
        .unwrap()
        .remove("currency");
    let response = h.engine.ingest().handle(&h.stripe_request(&payload));
    assert_eq!(response, WebhookResponse::BAD_REQUEST);

    let unparseable = h.engine.store().audit_events("webhook.unparseable").unwrap();
    assert_eq!(unparseable.len(), 1);
    assert!(matches!(
        &unparseable[0],
        AuditEvent::WebhookUnparseable { processor: ProcessorType::Stripe, .. }
    ));
    assert!(h.engine.store().transactions_for_barber("barber-g").unwrap().is_empty());
}

#[test]
fn storage_failure_asks_the_vendor_to_retry() {
    let path = temp_db_path("ingest-retry");
    let h = build_with(PaymentsConfig::default_test(), PaymentStore::open(&path).unwrap());
    h.configure("barber-g", PaymentMode::Decentralized, |_| {});
    h.connect("barber-g", ProcessorType::Stripe, "acct_g");

    let saboteur = rusqlite::Connection::open(&path).unwrap();
    saboteur
        .execute_batch("DROP TABLE commission_collection_item; DROP TABLE external_transaction;")
        .unwrap();

    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_g5", 2_500));
    let (response, outcome) = h.engine.ingest().handle_with_outcome(&req);
    assert_eq!(response, WebhookResponse::RETRY);
    assert_eq!(outcome, None);

    drop(saboteur);
    drop(h);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}

#[test]
fn concurrent_duplicate_deliveries_record_one_transaction() {
    let path = temp_db_path("ingest-race");
    let h = build_with(PaymentsConfig::default_test(), PaymentStore::open(&path).unwrap());
    h.configure("barber-g", PaymentMode::Decentralized, |_| {});
    let conn = h.connect("barber-g", ProcessorType::Stripe, "acct_g");

    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_race", 4_000));
    let forks: Vec<_> = (0..6).map(|_| h.engine.fork().unwrap()).collect();
    let statuses: Vec<u16> = std::thread::scope(|s| {
        let handles: Vec<_> = forks
            .into_iter()
            .map(|fork| {
                let req = req.clone();
                s.spawn(move || fork.ingest().handle(&req).status)
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(statuses.iter().all(|&status| status == 200), "statuses: {statuses:?}");
    assert_eq!(h.engine.store().count_transactions(&conn.connection_id).unwrap(), 1);
    assert_eq!(h.engine.store().audit_events("transaction.created").unwrap().len(), 1);
    let conn = h.engine.store().connection(&conn.connection_id).unwrap().unwrap();
    assert_eq!(conn.total_transactions, 1, "stats count the payment once");

    drop(h);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}

#[test]
fn deliveries_over_the_verification_budget_are_audited() {
    let mut config = PaymentsConfig::default_test();
    config.verification.budget_ms = 0;
    let h = build_with_config(config);
    h.configure("barber-g", PaymentMode::Decentralized, |_| {});
    let conn = h.connect("barber-g", ProcessorType::Stripe, "acct_g");

    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_slow", 2_500));
    assert_eq!(h.engine.ingest().handle(&req), WebhookResponse::OK);
    let mut forged = req.clone();
    forged.body.push(b' ');
    assert_eq!(h.engine.ingest().handle(&forged), WebhookResponse::REJECTED);

    let slow = h.engine.store().audit_events("webhook.slow").unwrap();
    assert_eq!(slow.len(), 2);
    assert!(matches!(
        &slow[0],
        AuditEvent::WebhookSlow { connection_id: Some(id), budget_ms: 0, stage, .. }
            if *id == conn.connection_id && stage == "accepted"
    ));
    assert!(matches!(
        &slow[1],
        AuditEvent::WebhookSlow { connection_id: None, stage, .. } if stage == "rejected"
    ));
}

#[test]
fn deliveries_within_budget_leave_no_slow_audit() {
    let h = onboarded();
    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_g", "pi_fast", 2_500));
    assert_eq!(h.engine.ingest().handle(&req), WebhookResponse::OK);
    assert!(h.engine.store().audit_events("webhook.slow").unwrap().is_empty());
}
