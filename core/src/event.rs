//! Audit events — the durable trail of every money-affecting decision.
//!
//! RULE: Components record what they decided, never why they were allowed to.
//! Variants are only ever added. The serialized `type` tag is what lands in
//! `audit_log.payload`.

use crate::{
    error::PayResult,
    types::{BarberId, CollectionId, ConnectionId, ProcessorType, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // ── Routing ────────────────────────────────────
    RoutingDecided {
        barber_id: BarberId,
        appointment_id: Option<String>,
        decision: String,
        processor: String,
        connection_id: Option<ConnectionId>,
        reason: String,
        amount: Decimal,
        currency: String,
    },
    RoutingFailed {
        barber_id: BarberId,
        appointment_id: Option<String>,
        error: String,
        amount: Decimal,
        currency: String,
    },

    // ── Webhook intake ─────────────────────────────
    WebhookRejected {
        processor: ProcessorType,
        reason: String,
    },
    VerificationBypassed {
        processor: ProcessorType,
        connection_id: Option<ConnectionId>,
        reason: String,
    },
    WebhookUnparseable {
        processor: ProcessorType,
        connection_id: ConnectionId,
        detail: String,
    },
    /// Verification and normalization ran over the configured budget.
    WebhookSlow {
        processor: ProcessorType,
        connection_id: Option<ConnectionId>,
        elapsed_ms: u64,
        budget_ms: u64,
        /// `rejected`, `unparseable` or `accepted`.
        stage: String,
    },

    // ── Reconciliation ─────────────────────────────
    TransactionCreated {
        transaction_id: TransactionId,
        connection_id: ConnectionId,
        barber_id: BarberId,
        external_transaction_id: String,
        status: TransactionStatus,
        amount: Decimal,
        commission_amount: Decimal,
        source: String,
    },
    TransactionTransitioned {
        transaction_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        source: String,
    },
    ReconciliationConflict {
        transaction_id: TransactionId,
        connection_id: ConnectionId,
        external_transaction_id: String,
        current: TransactionStatus,
        incoming: TransactionStatus,
        source: String,
    },
    DisputeReopened {
        transaction_id: TransactionId,
        barber_id: BarberId,
        actor: String,
        reason: String,
    },

    // ── Commission collection ──────────────────────
    CollectionCreated {
        collection_id: CollectionId,
        barber_id: BarberId,
        amount: Decimal,
        currency: String,
        transaction_count: usize,
    },
    CollectionSubmitted {
        collection_id: CollectionId,
        external_collection_id: String,
    },
    CollectionSucceeded {
        collection_id: CollectionId,
        barber_id: BarberId,
        amount: Decimal,
    },
    CollectionFailed {
        collection_id: CollectionId,
        barber_id: BarberId,
        reason: String,
    },
    /// A claimed transaction was refunded or disputed before billing
    /// resolved the collection; `amount` is what the collection now covers.
    CollectionAdjusted {
        collection_id: CollectionId,
        barber_id: BarberId,
        transaction_id: TransactionId,
        removed: Decimal,
        amount: Decimal,
    },

    // ── Settings and connections ───────────────────
    ConfigurationSaved {
        barber_id: BarberId,
        version: i64,
        mode: String,
    },
    ConnectionRegistered {
        connection_id: ConnectionId,
        barber_id: BarberId,
        processor: ProcessorType,
        account_id: String,
    },
    ConnectionStatusChanged {
        connection_id: ConnectionId,
        from: String,
        to: String,
        reason: String,
    },

    // ── Pull repair ────────────────────────────────
    RepairCompleted {
        connection_id: ConnectionId,
        fetched: usize,
        applied: usize,
        conflicts: usize,
    },
    RepairFailed {
        connection_id: ConnectionId,
        error: String,
        consecutive_failures: u32,
    },
}

impl AuditEvent {
    pub fn category(&self) -> &'static str {
        match self {
            Self::RoutingDecided { .. } | Self::RoutingFailed { .. } => "routing",
            Self::WebhookRejected { .. }
            | Self::VerificationBypassed { .. }
            | Self::WebhookUnparseable { .. }
            | Self::WebhookSlow { .. } => "webhook",
            Self::TransactionCreated { .. }
            | Self::TransactionTransitioned { .. }
            | Self::ReconciliationConflict { .. }
            | Self::DisputeReopened { .. } => "reconciliation",
            Self::CollectionCreated { .. }
            | Self::CollectionSubmitted { .. }
            | Self::CollectionSucceeded { .. }
            | Self::CollectionFailed { .. }
            | Self::CollectionAdjusted { .. } => "commission",
            Self::ConfigurationSaved { .. }
            | Self::ConnectionRegistered { .. }
            | Self::ConnectionStatusChanged { .. } => "settings",
            Self::RepairCompleted { .. } | Self::RepairFailed { .. } => "repair",
        }
    }

    /// Dotted name stored in `audit_log.event_type`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoutingDecided { .. } => "routing.decided",
            Self::RoutingFailed { .. } => "routing.failed",
            Self::WebhookRejected { .. } => "webhook.rejected",
            Self::VerificationBypassed { .. } => "verification.bypassed",
            Self::WebhookUnparseable { .. } => "webhook.unparseable",
            Self::WebhookSlow { .. } => "webhook.slow",
            Self::TransactionCreated { .. } => "transaction.created",
            Self::TransactionTransitioned { .. } => "transaction.transitioned",
            Self::ReconciliationConflict { .. } => "reconciliation.conflict",
            Self::DisputeReopened { .. } => "dispute.reopened",
            Self::CollectionCreated { .. } => "collection.created",
            Self::CollectionSubmitted { .. } => "collection.submitted",
            Self::CollectionSucceeded { .. } => "collection.succeeded",
            Self::CollectionFailed { .. } => "collection.failed",
            Self::CollectionAdjusted { .. } => "collection.adjusted",
            Self::ConfigurationSaved { .. } => "configuration.saved",
            Self::ConnectionRegistered { .. } => "connection.registered",
            Self::ConnectionStatusChanged { .. } => "connection.status_changed",
            Self::RepairCompleted { .. } => "repair.completed",
            Self::RepairFailed { .. } => "repair.failed",
        }
    }

    /// The entity the event is about, for indexed lookup.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::RoutingDecided { barber_id, .. }
            | Self::RoutingFailed { barber_id, .. }
            | Self::ConfigurationSaved { barber_id, .. } => Some(barber_id),
            Self::WebhookRejected { .. } => None,
            Self::VerificationBypassed { connection_id, .. }
            | Self::WebhookSlow { connection_id, .. } => connection_id.as_deref(),
            Self::WebhookUnparseable { connection_id, .. }
            | Self::ConnectionRegistered { connection_id, .. }
            | Self::ConnectionStatusChanged { connection_id, .. }
            | Self::RepairCompleted { connection_id, .. }
            | Self::RepairFailed { connection_id, .. } => Some(connection_id),
            Self::TransactionCreated { transaction_id, .. }
            | Self::TransactionTransitioned { transaction_id, .. }
            | Self::ReconciliationConflict { transaction_id, .. }
            | Self::DisputeReopened { transaction_id, .. } => Some(transaction_id),
            Self::CollectionCreated { collection_id, .. }
            | Self::CollectionSubmitted { collection_id, .. }
            | Self::CollectionSucceeded { collection_id, .. }
            | Self::CollectionFailed { collection_id, .. }
            | Self::CollectionAdjusted { collection_id, .. } => Some(collection_id),
        }
    }
}

/// Destination for audit events. The store implements it; a failed write is
/// the caller's error, since an unaudited decision must not go unnoticed.
pub trait AuditSink {
    fn record(&self, at: DateTime<Utc>, event: &AuditEvent) -> PayResult<()>;
}
