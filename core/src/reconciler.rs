//! Transaction reconciler — applies canonical events to the ledger.
//!
//! RULE: (connection_id, external_transaction_id) is the idempotency key.
//! Look-up, insert-or-transition and stats run inside one `BEGIN IMMEDIATE`
//! transaction; the commission generator runs after commit.
//!
//! Creation policy for an unseen transaction:
//!   SUCCEEDED            → create, commission frozen at the current rate
//!   REFUNDED / DISPUTED  → create directly in that terminal state
//!   anything else        → ignored (nothing to attach it to yet)

use crate::{
    clock::Clock,
    commission::CommissionGenerator,
    config::{CollectionConfig, RepairConfig},
    error::{GatewayError, PayError, PayResult},
    event::{AuditEvent, AuditSink},
    fees::FeeCalculator,
    gateway::{CollectionBilling, GatewayAdapter, GatewayTransaction},
    normalizer::{CanonicalEvent, CanonicalEventType},
    settings::{PaymentSettings, ProcessorConnection},
    store::{ExternalTransactionRow, NewExternalTransaction, PaymentStore, UpsertOutcome},
    types::{ConnectionId, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Where an event came from, recorded on the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Webhook,
    PullRepair,
    Gateway,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::PullRepair => "pull_repair",
            Self::Gateway => "gateway",
        }
    }
}

/// A stale or out-of-order event that would have moved a transaction
/// backwards. Dropped, logged and audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationConflict {
    pub transaction_id:          TransactionId,
    pub connection_id:           ConnectionId,
    pub external_transaction_id: String,
    pub current:                 TransactionStatus,
    pub incoming:                TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created {
        transaction_id: TransactionId,
        status: TransactionStatus,
    },
    Transitioned {
        transaction_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    Unchanged {
        transaction_id: TransactionId,
    },
    Conflict(ReconciliationConflict),
    Ignored {
        reason: &'static str,
    },
}

impl ReconcileOutcome {
    /// Whether this outcome moved the transaction into `succeeded`.
    fn entered_succeeded(&self) -> bool {
        matches!(
            self,
            Self::Created {
                status: TransactionStatus::Succeeded,
                ..
            } | Self::Transitioned {
                to: TransactionStatus::Succeeded,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub connection_id: ConnectionId,
    pub fetched:       usize,
    pub created:       usize,
    pub transitioned:  usize,
    pub unchanged:     usize,
    pub conflicts:     usize,
    pub ignored:       usize,
}

impl RepairReport {
    fn tally(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created { .. } => self.created += 1,
            ReconcileOutcome::Transitioned { .. } => self.transitioned += 1,
            ReconcileOutcome::Unchanged { .. } => self.unchanged += 1,
            ReconcileOutcome::Conflict(_) => self.conflicts += 1,
            ReconcileOutcome::Ignored { .. } => self.ignored += 1,
        }
    }

    pub fn applied(&self) -> usize {
        self.created + self.transitioned
    }
}

pub struct TransactionReconciler<'a> {
    store:      &'a PaymentStore,
    fees:       &'a FeeCalculator,
    clock:      &'a dyn Clock,
    billing:    &'a dyn CollectionBilling,
    collection: &'a CollectionConfig,
}

impl<'a> TransactionReconciler<'a> {
    pub fn new(
        store: &'a PaymentStore,
        fees: &'a FeeCalculator,
        clock: &'a dyn Clock,
        billing: &'a dyn CollectionBilling,
        collection: &'a CollectionConfig,
    ) -> Self {
        Self {
            store,
            fees,
            clock,
            billing,
            collection,
        }
    }

    fn commissions(&self) -> CommissionGenerator<'_> {
        CommissionGenerator::new(self.store, self.billing, self.clock, self.collection)
    }

    /// Apply one canonical event for `connection`.
    pub fn apply(
        &self,
        connection: &ProcessorConnection,
        event: &CanonicalEvent,
        source: EventSource,
    ) -> PayResult<ReconcileOutcome> {
        let Some(status) = event.status() else {
            return Ok(ReconcileOutcome::Ignored {
                reason: "unknown_event",
            });
        };
        let (Some(external_id), Some(amount), Some(currency)) =
            (&event.external_id, event.amount, &event.currency)
        else {
            return Ok(ReconcileOutcome::Ignored {
                reason: "incomplete_event",
            });
        };

        let outcome = self.store.immediate(|| {
            match self.store.find_transaction(&connection.connection_id, external_id)? {
                Some(row) => self.advance(&row, status, &event.metadata, source),
                None => {
                    let creatable = matches!(
                        status,
                        TransactionStatus::Succeeded
                            | TransactionStatus::Refunded
                            | TransactionStatus::Disputed
                    );
                    if !creatable {
                        log::debug!(
                            "connection={} reconcile: no record for {external_id}, ignoring {}",
                            connection.connection_id,
                            status
                        );
                        return Ok(ReconcileOutcome::Ignored {
                            reason: "no_record_for_event",
                        });
                    }
                    self.create(connection, external_id, amount, currency, status, &event.metadata, source)
                }
            }
        })?;

        self.after_commit(&connection.barber_id, &outcome);
        Ok(outcome)
    }

    /// Record a payment the platform itself just started at the processor,
    /// in whatever status the gateway reported (usually `pending`).
    pub fn record_initiated_payment(
        &self,
        connection: &ProcessorConnection,
        external_id: &str,
        amount: Decimal,
        currency: &str,
        status: TransactionStatus,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> PayResult<ReconcileOutcome> {
        let outcome = self.store.immediate(|| {
            match self.store.find_transaction(&connection.connection_id, external_id)? {
                // The webhook beat the API response.
                Some(row) => self.advance(&row, status, metadata, EventSource::Gateway),
                None => self.create(
                    connection,
                    external_id,
                    amount,
                    currency,
                    status,
                    metadata,
                    EventSource::Gateway,
                ),
            }
        })?;
        self.after_commit(&connection.barber_id, &outcome);
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        connection: &ProcessorConnection,
        external_id: &str,
        amount: Decimal,
        currency: &str,
        status: TransactionStatus,
        metadata: &BTreeMap<String, serde_json::Value>,
        source: EventSource,
    ) -> PayResult<ReconcileOutcome> {
        let now = self.clock.now();
        let override_rate = self
            .store
            .payment_configuration(&connection.barber_id)?
            .and_then(|c| c.commission_rate);
        let commission_rate = self.fees.effective_commission_rate(override_rate);
        let commission_amount = self.fees.commission_amount(amount, currency, commission_rate);

        let mut metadata = metadata.clone();
        metadata.insert("source".into(), source.as_str().into());
        let new = NewExternalTransaction {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection.connection_id.clone(),
            barber_id: connection.barber_id.clone(),
            external_transaction_id: external_id.to_string(),
            amount,
            currency: currency.to_string(),
            status,
            commission_rate,
            commission_amount,
            metadata,
        };

        let row = match self.store.insert_transaction_if_absent(&new, now)? {
            UpsertOutcome::Created(row) => row,
            UpsertOutcome::Existing(row) => {
                return self.advance(&row, status, &new.metadata, source);
            }
        };
        if status == TransactionStatus::Succeeded {
            self.store
                .bump_connection_stats(&connection.connection_id, amount, now)?;
        }
        self.store.record(
            now,
            &AuditEvent::TransactionCreated {
                transaction_id: row.transaction_id.clone(),
                connection_id: row.connection_id.clone(),
                barber_id: row.barber_id.clone(),
                external_transaction_id: row.external_transaction_id.clone(),
                status,
                amount,
                commission_amount,
                source: source.as_str().into(),
            },
        )?;
        log::info!(
            "connection={} reconcile: created {} ({external_id}) {status} {amount} {currency}, commission {commission_amount}",
            connection.connection_id,
            row.transaction_id
        );
        Ok(ReconcileOutcome::Created {
            transaction_id: row.transaction_id,
            status,
        })
    }

    fn advance(
        &self,
        row: &ExternalTransactionRow,
        incoming: TransactionStatus,
        metadata: &BTreeMap<String, serde_json::Value>,
        source: EventSource,
    ) -> PayResult<ReconcileOutcome> {
        let now = self.clock.now();
        if row.status == incoming {
            return Ok(ReconcileOutcome::Unchanged {
                transaction_id: row.transaction_id.clone(),
            });
        }
        if !row.status.can_transition_to(incoming)
            || !self
                .store
                .transition_transaction(&row.transaction_id, row.status, incoming, now)?
        {
            return self.conflict(row, incoming, source);
        }

        self.store
            .merge_transaction_metadata(&row.transaction_id, metadata)?;
        if incoming == TransactionStatus::Succeeded {
            self.store
                .bump_connection_stats(&row.connection_id, row.amount, now)?;
        }
        if row.status == TransactionStatus::Succeeded {
            self.release_claim(row, incoming, now)?;
        }
        self.store.record(
            now,
            &AuditEvent::TransactionTransitioned {
                transaction_id: row.transaction_id.clone(),
                from: row.status,
                to: incoming,
                source: source.as_str().into(),
            },
        )?;
        log::info!(
            "connection={} reconcile: {} {} → {incoming}",
            row.connection_id,
            row.transaction_id,
            row.status
        );
        Ok(ReconcileOutcome::Transitioned {
            transaction_id: row.transaction_id.clone(),
            from: row.status,
            to: incoming,
        })
    }

    /// A transaction that stops being `succeeded` while an open collection
    /// claims it leaves that collection, and its commission with it.
    fn release_claim(
        &self,
        row: &ExternalTransactionRow,
        incoming: TransactionStatus,
        now: DateTime<Utc>,
    ) -> PayResult<()> {
        let Some((collection_id, amount)) = self
            .store
            .release_open_claim(&row.transaction_id, row.commission_amount)?
        else {
            return Ok(());
        };
        log::warn!(
            "barber={} reconcile: {} went {incoming} inside open collection {collection_id}; collection now {amount}",
            row.barber_id,
            row.transaction_id
        );
        self.store.record(
            now,
            &AuditEvent::CollectionAdjusted {
                collection_id,
                barber_id: row.barber_id.clone(),
                transaction_id: row.transaction_id.clone(),
                removed: row.commission_amount,
                amount,
            },
        )
    }

    fn conflict(
        &self,
        row: &ExternalTransactionRow,
        incoming: TransactionStatus,
        source: EventSource,
    ) -> PayResult<ReconcileOutcome> {
        let conflict = ReconciliationConflict {
            transaction_id: row.transaction_id.clone(),
            connection_id: row.connection_id.clone(),
            external_transaction_id: row.external_transaction_id.clone(),
            current: row.status,
            incoming,
        };
        log::warn!(
            "connection={} reconcile: conflict on {}: {} → {incoming} discarded ({})",
            conflict.connection_id,
            conflict.external_transaction_id,
            conflict.current,
            source.as_str()
        );
        self.store.record(
            self.clock.now(),
            &AuditEvent::ReconciliationConflict {
                transaction_id: conflict.transaction_id.clone(),
                connection_id: conflict.connection_id.clone(),
                external_transaction_id: conflict.external_transaction_id.clone(),
                current: conflict.current,
                incoming,
                source: source.as_str().into(),
            },
        )?;
        Ok(ReconcileOutcome::Conflict(conflict))
    }

    /// Commission generation failures never undo an applied event; the next
    /// run picks the transaction up again.
    fn after_commit(&self, barber_id: &str, outcome: &ReconcileOutcome) {
        if !outcome.entered_succeeded() {
            return;
        }
        if let Err(e) = self.commissions().generate(barber_id) {
            log::error!("barber={barber_id} reconcile: commission generation failed: {e}");
        }
    }

    /// Move a disputed transaction back to `succeeded` after the dispute was
    /// resolved in the barber's favour. Never reachable from an event.
    pub fn reopen_dispute(
        &self,
        transaction_id: &str,
        actor: &str,
        reason: &str,
    ) -> PayResult<ExternalTransactionRow> {
        let now = self.clock.now();
        let row = self.store.immediate(|| {
            let row = self
                .store
                .get_transaction(transaction_id)?
                .ok_or_else(|| PayError::NotFound {
                    entity: "external_transaction",
                    id: transaction_id.to_string(),
                })?;
            if row.status != TransactionStatus::Disputed
                || !self.store.transition_transaction(
                    transaction_id,
                    TransactionStatus::Disputed,
                    TransactionStatus::Succeeded,
                    now,
                )?
            {
                return Err(PayError::InvalidState {
                    entity: "external_transaction",
                    id: transaction_id.to_string(),
                    detail: format!("cannot reopen a {} transaction", row.status),
                });
            }
            self.store.record(
                now,
                &AuditEvent::DisputeReopened {
                    transaction_id: transaction_id.to_string(),
                    barber_id: row.barber_id.clone(),
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                },
            )?;
            Ok(row)
        })?;
        log::info!(
            "connection={} reconcile: dispute on {transaction_id} reopened by {actor}",
            row.connection_id
        );
        self.after_commit(
            &row.barber_id,
            &ReconcileOutcome::Transitioned {
                transaction_id: transaction_id.to_string(),
                from: TransactionStatus::Disputed,
                to: TransactionStatus::Succeeded,
            },
        );
        self.store
            .get_transaction(transaction_id)?
            .ok_or_else(|| PayError::NotFound {
                entity: "external_transaction",
                id: transaction_id.to_string(),
            })
    }

    // ── Pull repair ────────────────────────────────────────────────

    /// Pull recent activity for one connection and feed it through `apply`,
    /// then refresh any rows still `pending`. A gateway error aborts this
    /// connection's pass and is returned as `PayError::Gateway`.
    pub fn repair_connection(
        &self,
        connection: &ProcessorConnection,
        gateway: &dyn GatewayAdapter,
        config: &RepairConfig,
    ) -> PayResult<RepairReport> {
        let since = self.clock.now() - chrono::Duration::minutes(config.lookback_minutes);
        let timeout = Duration::from_millis(config.pull_timeout_ms);
        let mut report = RepairReport {
            connection_id: connection.connection_id.clone(),
            ..RepairReport::default()
        };

        let recent = gateway.list_recent_transactions(connection, since, timeout)?;
        report.fetched = recent.len();
        let mut seen = HashSet::new();
        for txn in &recent {
            seen.insert(txn.external_transaction_id.clone());
            let outcome = self.apply(connection, &pulled_event(connection, txn), EventSource::PullRepair)?;
            report.tally(&outcome);
        }

        for row in self
            .store
            .transactions_in_status(&connection.connection_id, TransactionStatus::Pending)?
        {
            if seen.contains(&row.external_transaction_id) {
                continue;
            }
            let txn = match gateway.get_transaction(connection, &row.external_transaction_id) {
                Ok(txn) => txn,
                Err(GatewayError::NotFound(id)) => {
                    log::warn!(
                        "connection={} repair: pending {id} unknown to processor",
                        connection.connection_id
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            report.fetched += 1;
            let outcome = self.apply(connection, &pulled_event(connection, &txn), EventSource::PullRepair)?;
            report.tally(&outcome);
        }

        log::info!(
            "connection={} repair: fetched {} applied {} conflicts {}",
            connection.connection_id,
            report.fetched,
            report.applied(),
            report.conflicts
        );
        Ok(report)
    }
}

fn pulled_event(connection: &ProcessorConnection, txn: &GatewayTransaction) -> CanonicalEvent {
    CanonicalEvent {
        processor: connection.processor_type,
        event_type: CanonicalEventType::from_status(txn.status),
        vendor_event_id: None,
        vendor_event_type: format!("pull:{}", txn.status),
        external_id: Some(txn.external_transaction_id.clone()),
        amount: Some(crate::money::round(txn.amount, &txn.currency)),
        currency: Some(crate::money::normalize_currency(&txn.currency)),
        occurred_at: Some(txn.updated_at),
        metadata: txn.metadata.clone(),
    }
}
