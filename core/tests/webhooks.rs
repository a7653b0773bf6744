//! Webhook verification: signatures per processor, connection resolution,
//! and the fail-open policy.

mod common;

use barberpay_core::{
    clock::Clock,
    config::{PaymentsConfig, VerificationPolicy},
    error::{PayError, VerificationError},
    event::AuditEvent,
    ingest::WebhookRequest,
    settings::{NewConnection, PaymentSettings},
    types::{ConnectionStatus, PaymentMode, ProcessorType},
};
use chrono::Duration;
use common::{
    build, build_with_config, paypal_capture_event, paypal_request, square_payment_event,
    stripe_event, stripe_request, Harness,
};

fn verify_error(h: &Harness, req: &WebhookRequest) -> VerificationError {
    match h.engine.verifier().verify(req.processor, &req.headers, &req.body) {
        Err(PayError::Verification(e)) => e,
        Err(other) => panic!("expected a verification error, got {other:?}"),
        Ok(v) => panic!("expected rejection, payload for {} was accepted", v.connection.connection_id),
    }
}

fn onboard_all(h: &Harness) {
    h.configure("barber-w", PaymentMode::Decentralized, |_| {});
    h.connect("barber-w", ProcessorType::Stripe, "acct_w");
    h.connect("barber-w", ProcessorType::Square, "SQ-W");
    h.connect("barber-w", ProcessorType::Paypal, "PP-W");
}

#[test]
fn correctly_signed_payloads_verify_for_every_processor() {
    let h = build();
    onboard_all(&h);
    let requests = [
        h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w1", 5_000)),
        h.square_request(&square_payment_event("SQ-W", "sq_w1", "COMPLETED", 5_000)),
        h.paypal_request(&paypal_capture_event("PP-W", "CAP-W1", "50.00"), "PP-W"),
    ];
    for req in &requests {
        let verified = h
            .engine
            .verifier()
            .verify(req.processor, &req.headers, &req.body)
            .unwrap();
        assert_eq!(verified.processor, req.processor);
        assert_eq!(verified.connection.barber_id, "barber-w");
        assert!(!verified.bypassed);
    }
}

#[test]
fn tampered_bodies_are_rejected_for_every_processor() {
    let h = build();
    onboard_all(&h);
    let mut requests = [
        (
            h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w2", 5_000)),
            stripe_event("payment_intent.succeeded", "acct_w", "pi_w2", 500_000),
        ),
        (
            h.square_request(&square_payment_event("SQ-W", "sq_w2", "COMPLETED", 5_000)),
            square_payment_event("SQ-W", "sq_w2", "COMPLETED", 500_000),
        ),
        (
            h.paypal_request(&paypal_capture_event("PP-W", "CAP-W2", "50.00"), "PP-W"),
            paypal_capture_event("PP-W", "CAP-W2", "5000.00"),
        ),
    ];
    for (req, forged) in requests.iter_mut() {
        req.body = serde_json::to_vec(forged).unwrap();
        assert_eq!(
            verify_error(&h, req),
            VerificationError::SignatureMismatch,
            "{} accepted a modified body",
            req.processor
        );
        assert_eq!(h.engine.ingest().handle(req).status, 401);
    }
    assert!(
        h.engine.store().transactions_for_barber("barber-w").unwrap().is_empty(),
        "nothing may be recorded from a rejected webhook"
    );
    let rejected = h.engine.store().audit_events("webhook.rejected").unwrap();
    assert_eq!(rejected.len(), 6, "each rejection is audited");
}

#[test]
fn wrong_secret_is_rejected() {
    let h = build();
    onboard_all(&h);
    let payload = paypal_capture_event("PP-W", "CAP-W3", "10.00");
    let req = paypal_request("not-the-secret", h.engine.clock().now(), &payload);
    assert_eq!(verify_error(&h, &req), VerificationError::SignatureMismatch);
}

#[test]
fn stale_stripe_signature_is_rejected() {
    let h = build();
    onboard_all(&h);
    let payload = stripe_event("payment_intent.succeeded", "acct_w", "pi_w4", 1_000);
    let signed_long_ago = h.engine.clock().now() - Duration::minutes(10);
    let req = stripe_request(&common::secret_for("acct_w"), signed_long_ago, &payload);
    assert!(matches!(
        verify_error(&h, &req),
        VerificationError::StaleTimestamp { .. }
    ));
}

#[test]
fn missing_signature_header_is_rejected() {
    let h = build();
    onboard_all(&h);
    let body =
        serde_json::to_vec(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w5", 1_000)).unwrap();
    let req = WebhookRequest::new(ProcessorType::Stripe, Vec::<(String, String)>::new(), body);
    assert!(matches!(verify_error(&h, &req), VerificationError::MissingHeader(_)));
}

#[test]
fn unknown_account_and_revoked_connection_are_rejected() {
    let h = build();
    onboard_all(&h);

    let stranger = stripe_request(
        "whsec_anything",
        h.engine.clock().now(),
        &stripe_event("payment_intent.succeeded", "acct_stranger", "pi_x", 1_000),
    );
    assert!(matches!(
        verify_error(&h, &stranger),
        VerificationError::UnknownConnection { .. }
    ));

    let conn = h
        .engine
        .store()
        .connection_for_account(ProcessorType::Stripe, "acct_w")
        .unwrap()
        .expect("stripe connection");
    h.engine.revoke_connection(&conn.connection_id).unwrap();
    let after_revoke =
        h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w6", 1_000));
    assert!(matches!(
        verify_error(&h, &after_revoke),
        VerificationError::InactiveConnection { .. }
    ));
    let revoked = h.engine.store().connection(&conn.connection_id).unwrap().unwrap();
    assert_eq!(revoked.webhook_secret, None, "revocation drops the secret");
    assert!(revoked.revoked_at.is_some());
}

#[test]
fn fail_open_bypasses_bad_signatures_but_audits_them() {
    let mut config = PaymentsConfig::default_test();
    config.verification.policy = VerificationPolicy::FailOpen;
    let h = build_with_config(config);
    onboard_all(&h);

    let mut req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w7", 2_000));
    req.headers.insert("stripe-signature".into(), "t=1,v1=00".into());
    let verified = h
        .engine
        .verifier()
        .verify(req.processor, &req.headers, &req.body)
        .unwrap();
    assert!(verified.bypassed);

    let bypassed = h.engine.store().audit_events("verification.bypassed").unwrap();
    assert_eq!(bypassed.len(), 1);
    assert!(matches!(
        &bypassed[0],
        AuditEvent::VerificationBypassed { connection_id: Some(id), .. }
            if *id == verified.connection.connection_id
    ));

    // Resolution failures are never bypassed.
    let stranger = stripe_request(
        "whsec_anything",
        h.engine.clock().now(),
        &stripe_event("payment_intent.succeeded", "acct_stranger", "pi_y", 1_000),
    );
    assert!(matches!(
        verify_error(&h, &stranger),
        VerificationError::UnknownConnection { .. }
    ));
}

#[test]
fn revoked_account_can_be_relinked_by_the_same_barber() {
    let h = build();
    onboard_all(&h);
    let original = h
        .engine
        .store()
        .connection_for_account(ProcessorType::Stripe, "acct_w")
        .unwrap()
        .unwrap();
    let req = h.stripe_request(&stripe_event("payment_intent.succeeded", "acct_w", "pi_w8", 3_000));
    assert_eq!(h.engine.ingest().handle(&req).status, 200);
    h.engine.revoke_connection(&original.connection_id).unwrap();

    let relinked = h
        .engine
        .register_connection(NewConnection {
            barber_id: "barber-w".into(),
            processor_type: ProcessorType::Stripe,
            account_id: "acct_w".into(),
            webhook_secret: "whsec_rotated".into(),
            capabilities: vec!["card_payments".into()],
        })
        .unwrap();
    assert_eq!(relinked.connection_id, original.connection_id, "history stays on the same link");
    assert_eq!(relinked.status, ConnectionStatus::Connected);
    assert_eq!(relinked.webhook_secret.as_deref(), Some("whsec_rotated"));
    assert_eq!(relinked.revoked_at, None);
    assert_eq!(relinked.total_transactions, 1);

    let fresh = stripe_request(
        "whsec_rotated",
        h.engine.clock().now(),
        &stripe_event("payment_intent.succeeded", "acct_w", "pi_w9", 4_000),
    );
    let verified = h
        .engine
        .verifier()
        .verify(fresh.processor, &fresh.headers, &fresh.body)
        .unwrap();
    assert_eq!(verified.connection.connection_id, original.connection_id);

    let changes = h.engine.store().audit_events("connection.status_changed").unwrap();
    assert!(changes.iter().any(|e| matches!(
        e,
        AuditEvent::ConnectionStatusChanged { reason, to, .. } if reason == "relinked" && to == "connected"
    )));
}

#[test]
fn live_account_cannot_be_linked_twice() {
    let h = build();
    onboard_all(&h);
    let err = h
        .engine
        .register_connection(NewConnection {
            barber_id: "barber-other".into(),
            processor_type: ProcessorType::Square,
            account_id: "SQ-W".into(),
            webhook_secret: "sq-secret".into(),
            capabilities: vec![],
        })
        .unwrap_err();
    assert!(matches!(err, PayError::InvalidState { entity: "processor_connection", .. }));
}

#[test]
fn another_barber_linking_a_revoked_account_gets_a_new_connection() {
    let h = build();
    onboard_all(&h);
    let original = h
        .engine
        .store()
        .connection_for_account(ProcessorType::Paypal, "PP-W")
        .unwrap()
        .unwrap();
    h.engine.revoke_connection(&original.connection_id).unwrap();

    h.configure("barber-v", PaymentMode::Decentralized, |_| {});
    let taken_over = h.connect("barber-v", ProcessorType::Paypal, "PP-W");
    assert_ne!(taken_over.connection_id, original.connection_id);
    assert_eq!(taken_over.barber_id, "barber-v");

    let resolved = h
        .engine
        .store()
        .connection_for_account(ProcessorType::Paypal, "PP-W")
        .unwrap()
        .unwrap();
    assert_eq!(resolved.connection_id, taken_over.connection_id, "the live link wins");
    let old = h.engine.store().connection(&original.connection_id).unwrap().unwrap();
    assert_eq!(old.status, ConnectionStatus::Disconnected);
}
