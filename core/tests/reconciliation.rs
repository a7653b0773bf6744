//! Transaction reconciliation: idempotent webhook application, ordering,
//! disputes and pull repair.

mod common;

use barberpay_core::{
    error::PayError,
    event::AuditEvent,
    gateway::ExternalPaymentRequest,
    reconciler::ReconcileOutcome,
    router::{PaymentRequest, RoutingReason},
    settings::{PaymentSettings, ProcessorConnection},
    types::{PaymentMode, ProcessorType, TransactionStatus},
};
use chrono::Duration;
use common::{
    build, dec, gateway_txn, paypal_capture_event, paypal_dispute_event, paypal_refund_event,
    square_dispute_event, square_payment_event, square_refund_event, stripe_event, t0, Harness,
};
use std::collections::BTreeMap;

fn stripe_barber(h: &Harness) -> barberpay_core::settings::ProcessorConnection {
    h.configure("barber-x", PaymentMode::Decentralized, |_| {});
    h.connect("barber-x", ProcessorType::Stripe, "acct_x")
}

fn process(h: &Harness, payload: &serde_json::Value) -> ReconcileOutcome {
    h.engine.ingest().process(&h.stripe_request(payload)).unwrap()
}

/// One SUCCEEDED event for `tx_1` delivered four times.
#[test]
fn redelivered_success_creates_one_row_with_commission_once() {
    let h = build();
    let conn = stripe_barber(&h);
    let event = stripe_event("payment_intent.succeeded", "acct_x", "tx_1", 10_000);

    let first = process(&h, &event);
    assert!(matches!(
        first,
        ReconcileOutcome::Created { status: TransactionStatus::Succeeded, .. }
    ));
    for _ in 0..3 {
        assert!(matches!(process(&h, &event), ReconcileOutcome::Unchanged { .. }));
    }

    assert_eq!(h.engine.store().count_transactions(&conn.connection_id).unwrap(), 1);
    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "tx_1")
        .unwrap()
        .unwrap();
    assert_eq!(row.amount, dec("100.00"));
    assert_eq!(row.commission_rate, dec("0.15"));
    assert_eq!(row.commission_amount, dec("15.00"));
    assert_eq!(row.metadata["source"], "webhook");

    let created = h.engine.store().audit_events("transaction.created").unwrap();
    assert_eq!(created.len(), 1, "commission is computed exactly once");

    let conn = h.engine.store().connection(&conn.connection_id).unwrap().unwrap();
    assert_eq!(conn.total_transactions, 1);
    assert_eq!(conn.total_volume, dec("100.00"));
}

#[test]
fn pending_after_success_does_not_revert() {
    let h = build();
    let conn = stripe_barber(&h);
    process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_late", 4_000));

    let outcome = process(&h, &stripe_event("payment_intent.processing", "acct_x", "pi_late", 4_000));
    match outcome {
        ReconcileOutcome::Conflict(c) => {
            assert_eq!(c.current, TransactionStatus::Succeeded);
            assert_eq!(c.incoming, TransactionStatus::Pending);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "pi_late")
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Succeeded);
    assert_eq!(
        h.engine.store().audit_events("reconciliation.conflict").unwrap().len(),
        1
    );
}

#[test]
fn refund_moves_a_succeeded_transaction() {
    let h = build();
    let conn = stripe_barber(&h);
    process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_r", 6_000));
    let outcome = process(&h, &stripe_event("charge.refunded", "acct_x", "pi_r", 6_000));
    assert!(matches!(
        outcome,
        ReconcileOutcome::Transitioned {
            from: TransactionStatus::Succeeded,
            to: TransactionStatus::Refunded,
            ..
        }
    ));
    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "pi_r")
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Refunded);
    let transitions = h.engine.store().audit_events("transaction.transitioned").unwrap();
    assert!(matches!(
        &transitions[..],
        [AuditEvent::TransactionTransitioned { source, .. }] if source == "webhook"
    ));
}

#[test]
fn refund_before_success_creates_terminal_row_and_late_success_conflicts() {
    let h = build();
    let conn = stripe_barber(&h);
    let outcome = process(&h, &stripe_event("charge.refunded", "acct_x", "pi_ooo", 2_500));
    assert!(matches!(
        outcome,
        ReconcileOutcome::Created { status: TransactionStatus::Refunded, .. }
    ));

    let late = process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_ooo", 2_500));
    assert!(matches!(late, ReconcileOutcome::Conflict(_)));

    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "pi_ooo")
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Refunded);
    assert_eq!(
        h.engine.store().outstanding_commission("barber-x").unwrap(),
        dec("0"),
        "a refunded transaction owes no commission"
    );
}

#[test]
fn events_without_a_record_or_type_are_ignored() {
    let h = build();
    let conn = stripe_barber(&h);
    assert_eq!(
        process(&h, &stripe_event("payment_intent.processing", "acct_x", "pi_new", 1_000)),
        ReconcileOutcome::Ignored {
            reason: "no_record_for_event"
        }
    );
    assert_eq!(
        process(&h, &stripe_event("customer.updated", "acct_x", "pi_new", 1_000)),
        ReconcileOutcome::Ignored {
            reason: "unknown_event"
        }
    );
    assert_eq!(h.engine.store().count_transactions(&conn.connection_id).unwrap(), 0);
}

#[test]
fn dispute_is_terminal_until_reopened() {
    let h = build();
    let conn = stripe_barber(&h);
    process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_d", 8_000));
    let disputed = process(&h, &stripe_event("charge.dispute.created", "acct_x", "pi_d", 8_000));
    let ReconcileOutcome::Transitioned { transaction_id, to, .. } = disputed else {
        panic!("expected a transition, got {disputed:?}");
    };
    assert_eq!(to, TransactionStatus::Disputed);

    // No event can bring it back.
    assert!(matches!(
        process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_d", 8_000)),
        ReconcileOutcome::Conflict(_)
    ));

    let row = h
        .engine
        .reconciler()
        .reopen_dispute(&transaction_id, "ops@barberpay", "won the chargeback")
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Succeeded);
    assert_eq!(row.connection_id, conn.connection_id);

    let reopened = h.engine.store().audit_events("dispute.reopened").unwrap();
    assert!(matches!(
        &reopened[..],
        [AuditEvent::DisputeReopened { actor, .. }] if actor == "ops@barberpay"
    ));

    let again = h
        .engine
        .reconciler()
        .reopen_dispute(&transaction_id, "ops@barberpay", "twice");
    assert!(matches!(again, Err(PayError::InvalidState { .. })));
}

#[test]
fn square_and_paypal_events_reconcile() {
    let h = build();
    h.configure("barber-y", PaymentMode::Decentralized, |_| {});
    let square = h.connect("barber-y", ProcessorType::Square, "SQ-Y");
    let paypal = h.connect("barber-y", ProcessorType::Paypal, "PP-Y");

    let sq = h.square_request(&square_payment_event("SQ-Y", "sq_pay_9", "COMPLETED", 4_550));
    assert_eq!(h.engine.ingest().handle(&sq).status, 200);
    let pp = h.paypal_request(&paypal_capture_event("PP-Y", "CAP-9", "50.00"), "PP-Y");
    assert_eq!(h.engine.ingest().handle(&pp).status, 200);

    let sq_row = h
        .engine
        .store()
        .find_transaction(&square.connection_id, "sq_pay_9")
        .unwrap()
        .unwrap();
    assert_eq!(sq_row.amount, dec("45.50"));
    assert_eq!(sq_row.commission_amount, dec("6.82"), "15% of 45.50 rounds half-even");

    let pp_row = h
        .engine
        .store()
        .find_transaction(&paypal.connection_id, "CAP-9")
        .unwrap()
        .unwrap();
    assert_eq!(pp_row.status, TransactionStatus::Succeeded);
    assert_eq!(pp_row.commission_amount, dec("7.50"));
}

#[test]
fn gateway_refund_makes_the_later_webhook_a_duplicate() {
    let h = build();
    let conn = stripe_barber(&h);
    let created = process(&h, &stripe_event("payment_intent.succeeded", "acct_x", "pi_gr", 3_000));
    let ReconcileOutcome::Created { transaction_id, .. } = created else {
        panic!("expected a new row, got {created:?}");
    };

    let refunded = h.engine.refund(&transaction_id, None).unwrap();
    assert!(matches!(
        refunded,
        ReconcileOutcome::Transitioned { to: TransactionStatus::Refunded, .. }
    ));
    assert!(matches!(
        process(&h, &stripe_event("charge.refunded", "acct_x", "pi_gr", 3_000)),
        ReconcileOutcome::Unchanged { .. }
    ));
    let row = h.engine.store().get_transaction(&transaction_id).unwrap().unwrap();
    assert_eq!(row.connection_id, conn.connection_id);
    assert_eq!(row.status, TransactionStatus::Refunded);
}

#[test]
fn pull_repair_recovers_a_lost_webhook_once() {
    let h = build();
    let conn = stripe_barber(&h);
    h.gateway.script(
        "acct_x",
        vec![
            gateway_txn("pi_lost", TransactionStatus::Succeeded, "120.00", t0() - Duration::hours(2)),
            gateway_txn("pi_stale", TransactionStatus::Succeeded, "50.00", t0() - Duration::days(3)),
        ],
    );
    let repair = &h.engine.config().repair;

    let report = h
        .engine
        .reconciler()
        .repair_connection(&conn, h.engine.gateway(), repair)
        .unwrap();
    assert_eq!(report.fetched, 1, "only activity inside the lookback window is pulled");
    assert_eq!(report.created, 1);

    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "pi_lost")
        .unwrap()
        .unwrap();
    assert_eq!(row.commission_amount, dec("18.00"));
    assert_eq!(row.metadata["source"], "pull_repair");

    let again = h
        .engine
        .reconciler()
        .repair_connection(&conn, h.engine.gateway(), repair)
        .unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.unchanged, 1);
    assert_eq!(h.engine.store().count_transactions(&conn.connection_id).unwrap(), 1);
}

#[test]
fn pull_repair_refreshes_initiated_payments_left_pending() {
    let h = build();
    let conn = stripe_barber(&h);
    let decision = h
        .engine
        .router()
        .route(&PaymentRequest {
            barber_id: "barber-x".into(),
            appointment_id: Some("appt-9".into()),
            amount: dec("90"),
            currency: "USD".into(),
            client_preference: None,
            service_type: None,
            metadata: BTreeMap::new(),
        })
        .unwrap();
    assert_eq!(decision.reason, RoutingReason::DecentralizedMode);

    let outcome = h
        .engine
        .execute_external_payment(
            &decision,
            &ExternalPaymentRequest {
                amount: dec("90"),
                currency: "USD".into(),
                payment_method: "pm_card".into(),
                idempotency_key: "appt-9".into(),
            },
        )
        .unwrap()
        .expect("external decision executes");
    assert!(matches!(
        outcome,
        ReconcileOutcome::Created { status: TransactionStatus::Pending, .. }
    ));

    // The processor settled it long ago, outside the lookback window.
    h.gateway.script(
        "acct_x",
        vec![gateway_txn("ext-pay-1", TransactionStatus::Succeeded, "90.00", t0() - Duration::days(2))],
    );
    let report = h
        .engine
        .reconciler()
        .repair_connection(&conn, h.engine.gateway(), &h.engine.config().repair)
        .unwrap();
    assert_eq!(report.transitioned, 1);

    let row = h
        .engine
        .store()
        .find_transaction(&conn.connection_id, "ext-pay-1")
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Succeeded);
    assert_eq!(row.metadata["idempotency_key"], "appt-9");
}

fn square_and_paypal_barber(h: &Harness) -> (ProcessorConnection, ProcessorConnection) {
    h.configure("barber-z", PaymentMode::Decentralized, |_| {});
    (
        h.connect("barber-z", ProcessorType::Square, "SQ-Z"),
        h.connect("barber-z", ProcessorType::Paypal, "PP-Z"),
    )
}

fn status_of(h: &Harness, conn: &ProcessorConnection, external_id: &str) -> TransactionStatus {
    h.engine
        .store()
        .find_transaction(&conn.connection_id, external_id)
        .unwrap()
        .unwrap_or_else(|| panic!("no row for {external_id}"))
        .status
}

#[test]
fn square_refund_and_dispute_land_on_the_payment() {
    let h = build();
    let (square, _) = square_and_paypal_barber(&h);
    for payment in ["sq_rf", "sq_dp"] {
        let completed = h.square_request(&square_payment_event("SQ-Z", payment, "COMPLETED", 6_000));
        assert_eq!(h.engine.ingest().handle(&completed).status, 200);
    }

    // A refund still in flight moves nothing.
    let pending = h.square_request(&square_refund_event("SQ-Z", "sq_rf", "PENDING", 6_000));
    let (response, outcome) = h.engine.ingest().handle_with_outcome(&pending);
    assert_eq!(response.status, 200);
    assert!(matches!(outcome, Some(ReconcileOutcome::Ignored { .. })));
    assert_eq!(status_of(&h, &square, "sq_rf"), TransactionStatus::Succeeded);

    let refunded = h.square_request(&square_refund_event("SQ-Z", "sq_rf", "COMPLETED", 6_000));
    assert_eq!(h.engine.ingest().handle(&refunded).status, 200);
    assert_eq!(status_of(&h, &square, "sq_rf"), TransactionStatus::Refunded);

    let disputed = h.square_request(&square_dispute_event("SQ-Z", "sq_dp", 6_000));
    assert_eq!(h.engine.ingest().handle(&disputed).status, 200);
    assert_eq!(status_of(&h, &square, "sq_dp"), TransactionStatus::Disputed);

    assert_eq!(h.engine.store().count_transactions(&square.connection_id).unwrap(), 2);
    assert_eq!(
        h.engine.store().audit_events("transaction.transitioned").unwrap().len(),
        2
    );
}

#[test]
fn paypal_reversal_and_dispute_land_on_the_capture() {
    let h = build();
    let (_, paypal) = square_and_paypal_barber(&h);
    for capture in ["CAP-RV", "CAP-DP", "CAP-RF"] {
        let completed = h.paypal_request(&paypal_capture_event("PP-Z", capture, "80.00"), "PP-Z");
        assert_eq!(h.engine.ingest().handle(&completed).status, 200);
    }

    let reversed = h.paypal_request(
        &paypal_refund_event("PAYMENT.CAPTURE.REVERSED", "PP-Z", "CAP-RV", "80.00"),
        "PP-Z",
    );
    assert_eq!(h.engine.ingest().handle(&reversed).status, 200);
    assert_eq!(status_of(&h, &paypal, "CAP-RV"), TransactionStatus::Refunded);

    let refunded = h.paypal_request(
        &paypal_refund_event("PAYMENT.CAPTURE.REFUNDED", "PP-Z", "CAP-RF", "80.00"),
        "PP-Z",
    );
    assert_eq!(h.engine.ingest().handle(&refunded).status, 200);
    assert_eq!(status_of(&h, &paypal, "CAP-RF"), TransactionStatus::Refunded);

    let disputed = h.paypal_request(&paypal_dispute_event("PP-Z", "CAP-DP", "80.00"), "PP-Z");
    assert_eq!(h.engine.ingest().handle(&disputed).status, 200);
    assert_eq!(status_of(&h, &paypal, "CAP-DP"), TransactionStatus::Disputed);

    assert_eq!(
        h.engine.store().count_transactions(&paypal.connection_id).unwrap(),
        3,
        "no row is keyed on a refund or dispute id"
    );
    assert!(h
        .engine
        .store()
        .find_transaction(&paypal.connection_id, "REF-CAP-RV")
        .unwrap()
        .is_none());
}
