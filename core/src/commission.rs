//! Commission generator — turns owed commission into collection requests.
//!
//! INVARIANT: a transaction is claimed by at most one open collection, and
//! `commission_collected` flips only on billing's success report. Selection
//! and claiming share one `BEGIN IMMEDIATE` transaction; the partial unique
//! index on `commission_collection_item` backs that up.
//!
//! A collection is committed `pending` before billing is called. One left
//! `pending` with no billing reference past `collection.resubmit_after_secs`
//! is handed to billing again by the next `generate` for that barber.

use crate::{
    clock::Clock,
    config::CollectionConfig,
    error::{PayError, PayResult},
    event::{AuditEvent, AuditSink},
    gateway::CollectionBilling,
    settings::{PaymentConfiguration, PaymentSettings},
    store::{CommissionCollectionRow, NewCollection, PaymentStore},
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Billing's asynchronous verdict on a submitted collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CollectionOutcome {
    Succeeded,
    Failed { reason: String },
}

pub struct CommissionGenerator<'a> {
    store:   &'a PaymentStore,
    billing: &'a dyn CollectionBilling,
    clock:   &'a dyn Clock,
    config:  &'a CollectionConfig,
}

impl<'a> CommissionGenerator<'a> {
    pub fn new(
        store: &'a PaymentStore,
        billing: &'a dyn CollectionBilling,
        clock: &'a dyn Clock,
        config: &'a CollectionConfig,
    ) -> Self {
        Self {
            store,
            billing,
            clock,
            config,
        }
    }

    /// Resubmit the barber's stranded collections, then create a collection
    /// for each currency whose uncollected, unclaimed commission meets the
    /// barber's minimum and submit it to billing. Returns the collections
    /// resubmitted or created by this call, in their final state.
    pub fn generate(&self, barber_id: &str) -> PayResult<Vec<CommissionCollectionRow>> {
        let mut out = self.resubmit_stranded(barber_id)?;

        let config = self
            .store
            .payment_configuration(barber_id)?
            .unwrap_or_else(|| PaymentConfiguration::onboarding(barber_id, self.config.default_method));
        let now = self.clock.now();

        let created = self.store.immediate(|| {
            let mut by_currency: BTreeMap<String, (Decimal, Vec<String>)> = BTreeMap::new();
            for txn in self.store.collectible_transactions(barber_id)? {
                let entry = by_currency.entry(txn.currency.clone()).or_default();
                entry.0 += txn.commission_amount;
                entry.1.push(txn.transaction_id);
            }

            let mut created = Vec::new();
            for (currency, (total, transaction_ids)) in by_currency {
                if total <= Decimal::ZERO || total < config.minimum_collection_amount {
                    log::debug!(
                        "barber={barber_id} commission: {total} {currency} below minimum {}",
                        config.minimum_collection_amount
                    );
                    continue;
                }
                let collection = NewCollection {
                    collection_id: uuid::Uuid::new_v4().to_string(),
                    barber_id: barber_id.to_string(),
                    amount: total,
                    currency,
                    collection_method: config.collection_method,
                    transaction_ids,
                };
                self.store.insert_collection(&collection, now)?;
                self.store.record(
                    now,
                    &AuditEvent::CollectionCreated {
                        collection_id: collection.collection_id.clone(),
                        barber_id: collection.barber_id.clone(),
                        amount: collection.amount,
                        currency: collection.currency.clone(),
                        transaction_count: collection.transaction_ids.len(),
                    },
                )?;
                log::info!(
                    "barber={barber_id} commission: collection {} for {} {} over {} transactions",
                    collection.collection_id,
                    collection.amount,
                    collection.currency,
                    collection.transaction_ids.len()
                );
                created.push(collection);
            }
            Ok(created)
        })?;

        for collection in created {
            self.submit(&collection)?;
            if let Some(row) = self.store.get_collection(&collection.collection_id)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn resubmit_stranded(&self, barber_id: &str) -> PayResult<Vec<CommissionCollectionRow>> {
        let now = self.clock.now();
        let before = now - Duration::seconds(self.config.resubmit_after_secs);
        let mut out = Vec::new();
        for collection_id in self.store.stranded_collections(barber_id, before)? {
            if !self
                .store
                .claim_stranded_collection(&collection_id, before, now)?
            {
                continue;
            }
            let Some(row) = self.store.get_collection(&collection_id)? else {
                continue;
            };
            let collection = NewCollection {
                collection_id: row.collection_id,
                barber_id: row.barber_id,
                amount: row.amount,
                currency: row.currency,
                collection_method: row.collection_method,
                transaction_ids: self.store.claimed_transaction_ids(&collection_id)?,
            };
            log::warn!(
                "barber={barber_id} commission: collection {collection_id} stranded in pending since {}, resubmitting",
                row.created_at
            );
            if collection.transaction_ids.is_empty() || collection.amount <= Decimal::ZERO {
                self.fail(&collection, "nothing left to collect", now)?;
            } else {
                self.submit(&collection)?;
            }
            if let Some(row) = self.store.get_collection(&collection_id)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn submit(&self, collection: &NewCollection) -> PayResult<()> {
        let now = self.clock.now();
        match self.billing.create_collection(
            &collection.barber_id,
            collection.amount,
            &collection.currency,
            &collection.transaction_ids,
        ) {
            Ok(external_id) => {
                self.store
                    .mark_collection_submitted(&collection.collection_id, &external_id)?;
                self.store.record(
                    now,
                    &AuditEvent::CollectionSubmitted {
                        collection_id: collection.collection_id.clone(),
                        external_collection_id: external_id,
                    },
                )?;
            }
            Err(e) => {
                log::error!(
                    "barber={} commission: billing refused collection {}: {e}",
                    collection.barber_id,
                    collection.collection_id
                );
                self.fail(collection, &e.to_string(), now)?;
            }
        }
        Ok(())
    }

    fn fail(
        &self,
        collection: &NewCollection,
        reason: &str,
        now: DateTime<Utc>,
    ) -> PayResult<()> {
        self.store.immediate(|| {
            if !self
                .store
                .resolve_collection_failed(&collection.collection_id, reason, now)?
            {
                return Ok(());
            }
            self.store.record(
                now,
                &AuditEvent::CollectionFailed {
                    collection_id: collection.collection_id.clone(),
                    barber_id: collection.barber_id.clone(),
                    reason: reason.to_string(),
                },
            )
        })
    }

    /// Apply billing's verdict. Returns false (and changes nothing) when the
    /// collection was already resolved.
    pub fn record_collection_outcome(
        &self,
        collection_id: &str,
        outcome: &CollectionOutcome,
    ) -> PayResult<bool> {
        let now = self.clock.now();
        self.store.immediate(|| {
            let collection = self
                .store
                .get_collection(collection_id)?
                .ok_or_else(|| PayError::NotFound {
                    entity: "commission_collection",
                    id: collection_id.to_string(),
                })?;
            let applied = match outcome {
                CollectionOutcome::Succeeded => {
                    self.store.resolve_collection_succeeded(collection_id, now)?
                }
                CollectionOutcome::Failed { reason } => {
                    self.store.resolve_collection_failed(collection_id, reason, now)?
                }
            };
            if !applied {
                log::warn!(
                    "collection={collection_id} commission: outcome {outcome:?} ignored, already {}",
                    collection.status.as_str()
                );
                return Ok(false);
            }
            let event = match outcome {
                CollectionOutcome::Succeeded => AuditEvent::CollectionSucceeded {
                    collection_id: collection_id.to_string(),
                    barber_id: collection.barber_id.clone(),
                    amount: collection.amount,
                },
                CollectionOutcome::Failed { reason } => AuditEvent::CollectionFailed {
                    collection_id: collection_id.to_string(),
                    barber_id: collection.barber_id.clone(),
                    reason: reason.clone(),
                },
            };
            self.store.record(now, &event)?;
            Ok(true)
        })
    }

    pub fn outstanding_commission(&self, barber_id: &str) -> PayResult<Decimal> {
        self.store.outstanding_commission(barber_id)
    }
}
