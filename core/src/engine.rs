//! The payment engine — composition root of the payments core.
//!
//! COMPONENTS (borrowed from the engine per call, never cached):
//!   - PaymentRouter          synchronous routing of new payments
//!   - WebhookVerifier        authenticity + connection resolution
//!   - WebhookNormalizer      vendor payload → canonical event
//!   - TransactionReconciler  idempotent ledger updates, pull repair
//!   - CommissionGenerator    collection of owed commission
//!   - WebhookIngest          endpoint boundary for vendor deliveries
//!   - RepairScheduler        parallel pull repair across connections
//!
//! RULES:
//!   - One engine owns one store handle. Threads get their own via `fork()`.
//!   - Every time-dependent rule reads the injected clock.
//!   - Settings and connection changes go through the engine so they are audited.

use crate::{
    clock::Clock,
    commission::{CollectionOutcome, CommissionGenerator},
    config::PaymentsConfig,
    error::{PayError, PayResult},
    event::{AuditEvent, AuditSink},
    fees::FeeCalculator,
    gateway::{CollectionBilling, ExternalPaymentRequest, GatewayAdapter},
    ingest::WebhookIngest,
    normalizer::{CanonicalEventType, WebhookNormalizer},
    processors::ProcessorTable,
    reconciler::{EventSource, ReconcileOutcome, TransactionReconciler},
    repair::RepairScheduler,
    router::{DecisionKind, PaymentRouter, RoutingDecision},
    settings::{NewConnection, PaymentConfiguration, PaymentSettings, ProcessorConnection},
    store::PaymentStore,
    types::ConnectionStatus,
    verifier::WebhookVerifier,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct PaymentEngine {
    store:      PaymentStore,
    config:     PaymentsConfig,
    fees:       FeeCalculator,
    clock:      Arc<dyn Clock>,
    processors: Arc<ProcessorTable>,
    gateway:    Arc<dyn GatewayAdapter>,
    billing:    Arc<dyn CollectionBilling>,
}

impl PaymentEngine {
    /// Wire an engine over `store`, applying migrations.
    pub fn build(
        store: PaymentStore,
        config: PaymentsConfig,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn GatewayAdapter>,
        billing: Arc<dyn CollectionBilling>,
    ) -> PayResult<Self> {
        store.migrate()?;
        Ok(Self {
            fees: FeeCalculator::new(config.fees.clone()),
            store,
            config,
            clock,
            processors: Arc::new(ProcessorTable::standard()),
            gateway,
            billing,
        })
    }

    /// Replace the processor dispatch table.
    pub fn with_processors(mut self, processors: ProcessorTable) -> Self {
        self.processors = Arc::new(processors);
        self
    }

    /// Same collaborators, fresh store handle. For file databases both
    /// engines see the same data; an in-memory store forks into an empty one.
    pub fn fork(&self) -> PayResult<Self> {
        let store = self.store.reopen()?;
        store.migrate()?;
        Ok(Self {
            store,
            config: self.config.clone(),
            fees: self.fees.clone(),
            clock: Arc::clone(&self.clock),
            processors: Arc::clone(&self.processors),
            gateway: Arc::clone(&self.gateway),
            billing: Arc::clone(&self.billing),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn store(&self) -> &PaymentStore {
        &self.store
    }

    pub fn config(&self) -> &PaymentsConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn fees(&self) -> &FeeCalculator {
        &self.fees
    }

    pub fn gateway(&self) -> &dyn GatewayAdapter {
        self.gateway.as_ref()
    }

    // ── Components ──────────────────────────────────────────────────

    pub fn router(&self) -> PaymentRouter<'_> {
        PaymentRouter::new(&self.store, &self.fees, self.clock(), &self.store)
    }

    pub fn verifier(&self) -> WebhookVerifier<'_> {
        WebhookVerifier::new(
            &self.store,
            &self.store,
            &self.processors,
            &self.config.verification,
            self.clock(),
        )
    }

    pub fn normalizer(&self) -> WebhookNormalizer<'_> {
        WebhookNormalizer::new(&self.processors)
    }

    pub fn reconciler(&self) -> TransactionReconciler<'_> {
        TransactionReconciler::new(
            &self.store,
            &self.fees,
            self.clock(),
            self.billing.as_ref(),
            &self.config.collection,
        )
    }

    pub fn commissions(&self) -> CommissionGenerator<'_> {
        CommissionGenerator::new(
            &self.store,
            self.billing.as_ref(),
            self.clock(),
            &self.config.collection,
        )
    }

    pub fn ingest(&self) -> WebhookIngest<'_> {
        WebhookIngest::new(self)
    }

    pub fn repair_scheduler(&self) -> RepairScheduler<'_> {
        RepairScheduler::new(self)
    }

    // ── Settings ────────────────────────────────────────────────────

    /// Store the barber's onboarding default (centralized) unless they
    /// already have a configuration.
    pub fn onboard_barber(&self, barber_id: &str) -> PayResult<PaymentConfiguration> {
        if let Some(existing) = self.store.payment_configuration(barber_id)? {
            return Ok(existing);
        }
        self.save_configuration(&PaymentConfiguration::onboarding(
            barber_id,
            self.config.collection.default_method,
        ))
    }

    /// Supersede the barber's configuration with a new version.
    pub fn save_configuration(&self, config: &PaymentConfiguration) -> PayResult<PaymentConfiguration> {
        let now = self.clock.now();
        let saved = self.store.save_configuration(config, now)?;
        self.store.record(
            now,
            &AuditEvent::ConfigurationSaved {
                barber_id: saved.barber_id.clone(),
                version: saved.version,
                mode: saved.mode.as_str().into(),
            },
        )?;
        log::info!(
            "barber={} settings: configuration v{} saved ({})",
            saved.barber_id,
            saved.version,
            saved.mode.as_str()
        );
        Ok(saved)
    }

    /// Link a processor account to a barber. A barber re-linking an account
    /// they revoked gets the old connection back, with its history; an
    /// account that is still linked anywhere is refused.
    pub fn register_connection(&self, new: NewConnection) -> PayResult<ProcessorConnection> {
        let now = self.clock.now();
        let connection = self.store.immediate(|| {
            match self
                .store
                .connection_for_account(new.processor_type, &new.account_id)?
            {
                Some(existing) if existing.status != ConnectionStatus::Disconnected => {
                    Err(PayError::InvalidState {
                        entity: "processor_connection",
                        id: existing.connection_id,
                        detail: format!(
                            "{} account {} is already linked",
                            new.processor_type, new.account_id
                        ),
                    })
                }
                Some(existing) if existing.barber_id == new.barber_id => {
                    self.relink(existing, &new, now)
                }
                _ => self.link(&new, now),
            }
        })?;
        log::info!(
            "connection={} settings: {} account {} linked for barber {}",
            connection.connection_id,
            connection.processor_type,
            connection.account_id,
            connection.barber_id
        );
        Ok(connection)
    }

    fn link(&self, new: &NewConnection, now: DateTime<Utc>) -> PayResult<ProcessorConnection> {
        let connection = ProcessorConnection {
            connection_id: uuid::Uuid::new_v4().to_string(),
            barber_id: new.barber_id.clone(),
            processor_type: new.processor_type,
            account_id: new.account_id.clone(),
            status: ConnectionStatus::Connected,
            webhook_secret: Some(new.webhook_secret.clone()),
            capabilities: new.capabilities.clone(),
            total_transactions: 0,
            total_volume: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            revoked_at: None,
        };
        self.store.insert_connection(&connection)?;
        self.store.record(
            now,
            &AuditEvent::ConnectionRegistered {
                connection_id: connection.connection_id.clone(),
                barber_id: connection.barber_id.clone(),
                processor: connection.processor_type,
                account_id: connection.account_id.clone(),
            },
        )?;
        Ok(connection)
    }

    fn relink(
        &self,
        existing: ProcessorConnection,
        new: &NewConnection,
        now: DateTime<Utc>,
    ) -> PayResult<ProcessorConnection> {
        let id = existing.connection_id.as_str();
        if !self
            .store
            .relink_connection(id, &new.webhook_secret, &new.capabilities, now)?
        {
            return Err(PayError::InvalidState {
                entity: "processor_connection",
                id: id.to_string(),
                detail: "no longer disconnected".into(),
            });
        }
        self.store.record(
            now,
            &AuditEvent::ConnectionStatusChanged {
                connection_id: id.to_string(),
                from: ConnectionStatus::Disconnected.as_str().into(),
                to: ConnectionStatus::Connected.as_str().into(),
                reason: "relinked".into(),
            },
        )?;
        self.require_connection(id)
    }

    /// Move a connection between statuses. Returns false if it was no longer
    /// in the status it was read in.
    pub fn set_connection_status(
        &self,
        connection_id: &str,
        to: ConnectionStatus,
        reason: &str,
    ) -> PayResult<bool> {
        let connection = self.require_connection(connection_id)?;
        if connection.status == to {
            return Ok(true);
        }
        let now = self.clock.now();
        let changed = self.store.immediate(|| {
            let changed =
                self.store
                    .update_connection_status(connection_id, connection.status, to, now)?;
            if changed {
                self.store.record(
                    now,
                    &AuditEvent::ConnectionStatusChanged {
                        connection_id: connection_id.to_string(),
                        from: connection.status.as_str().into(),
                        to: to.as_str().into(),
                        reason: reason.to_string(),
                    },
                )?;
            }
            Ok(changed)
        })?;
        if changed {
            log::info!(
                "connection={connection_id} settings: {} → {} ({reason})",
                connection.status.as_str(),
                to.as_str()
            );
        }
        Ok(changed)
    }

    /// Disconnect and drop the webhook secret. Later webhooks for the
    /// account are rejected.
    pub fn revoke_connection(&self, connection_id: &str) -> PayResult<()> {
        self.set_connection_status(connection_id, ConnectionStatus::Disconnected, "revoked")?;
        Ok(())
    }

    fn require_connection(&self, connection_id: &str) -> PayResult<ProcessorConnection> {
        self.store
            .connection(connection_id)?
            .ok_or_else(|| PayError::NotFound {
                entity: "processor_connection",
                id: connection_id.to_string(),
            })
    }

    // ── Payments ────────────────────────────────────────────────────

    /// Start the external part of a routed payment at the barber's processor
    /// and record it. Platform-only decisions have nothing to execute here.
    pub fn execute_external_payment(
        &self,
        decision: &RoutingDecision,
        request: &ExternalPaymentRequest,
    ) -> PayResult<Option<ReconcileOutcome>> {
        if !matches!(decision.decision, DecisionKind::External | DecisionKind::Split) {
            return Ok(None);
        }
        let connection_id = decision
            .target_connection
            .as_deref()
            .ok_or_else(|| PayError::InvalidState {
                entity: "routing_decision",
                id: decision.decision.as_str().into(),
                detail: "external decision without a target connection".into(),
            })?;
        let connection = self.require_connection(connection_id)?;
        let payment = self.gateway.create_external_payment(&connection, request)?;
        let mut metadata = BTreeMap::new();
        metadata.insert("idempotency_key".into(), request.idempotency_key.clone().into());
        let outcome = self.reconciler().record_initiated_payment(
            &connection,
            &payment.external_transaction_id,
            request.amount,
            &request.currency,
            payment.status,
            &metadata,
        )?;
        Ok(Some(outcome))
    }

    /// Refund through the processor and apply the processor's answer. The
    /// refund webhook that follows is then a duplicate.
    pub fn refund(&self, transaction_id: &str, amount: Option<Decimal>) -> PayResult<ReconcileOutcome> {
        let row = self
            .store
            .get_transaction(transaction_id)?
            .ok_or_else(|| PayError::NotFound {
                entity: "external_transaction",
                id: transaction_id.to_string(),
            })?;
        let connection = self.require_connection(&row.connection_id)?;
        let txn = self
            .gateway
            .refund(&connection, &row.external_transaction_id, amount)?;
        let event = crate::normalizer::CanonicalEvent {
            processor: connection.processor_type,
            event_type: CanonicalEventType::from_status(txn.status),
            vendor_event_id: None,
            vendor_event_type: "api:refund".into(),
            external_id: Some(row.external_transaction_id.clone()),
            amount: Some(row.amount),
            currency: Some(row.currency.clone()),
            occurred_at: Some(txn.updated_at),
            metadata: txn.metadata,
        };
        self.reconciler()
            .apply(&connection, &event, EventSource::Gateway)
    }

    pub fn record_collection_outcome(
        &self,
        collection_id: &str,
        outcome: &CollectionOutcome,
    ) -> PayResult<bool> {
        self.commissions()
            .record_collection_outcome(collection_id, outcome)
    }
}
