use super::{
    get_decimal, get_enum, get_opt_ts, get_ts, ts,
    transactions::{txn_from_row, TXN_COLUMNS},
    CollectionStatus, CommissionCollectionRow, ExternalTransactionRow, PaymentStore,
};
use crate::{
    error::PayResult,
    types::{BarberId, CollectionId, CollectionMethod, TransactionId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct NewCollection {
    pub collection_id:     CollectionId,
    pub barber_id:         BarberId,
    pub amount:            Decimal,
    pub currency:          String,
    pub collection_method: CollectionMethod,
    pub transaction_ids:   Vec<TransactionId>,
}

impl PaymentStore {
    // ── Commission collection ───────────────────────────────────────

    /// Succeeded, uncollected transactions not already claimed by an open
    /// collection, oldest first.
    pub fn collectible_transactions(&self, barber_id: &str) -> PayResult<Vec<ExternalTransactionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM external_transaction t
             WHERE barber_id = ?1 AND status = 'succeeded' AND commission_collected = 0
               AND NOT EXISTS (
                   SELECT 1 FROM commission_collection_item i
                   WHERE i.transaction_id = t.transaction_id AND i.released = 0
               )
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![barber_id], txn_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Commission owed on succeeded transactions that has not been collected,
    /// whether or not a collection is in flight for it.
    pub fn uncollected_commission(&self, barber_id: &str) -> PayResult<Decimal> {
        let mut stmt = self.conn.prepare(
            "SELECT commission_amount FROM external_transaction
             WHERE barber_id = ?1 AND status = 'succeeded' AND commission_collected = 0",
        )?;
        let amounts = stmt
            .query_map(params![barber_id], |row| get_decimal(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(amounts.into_iter().sum())
    }

    /// Create a pending collection and claim its transactions. Fails with a
    /// constraint error if any transaction is already in an open collection.
    pub fn insert_collection(
        &self,
        collection: &NewCollection,
        at: DateTime<Utc>,
    ) -> PayResult<()> {
        self.conn.execute(
            "INSERT INTO commission_collection (
                collection_id, barber_id, amount, currency, status, collection_method,
                created_at, last_submit_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
            params![
                collection.collection_id,
                collection.barber_id,
                collection.amount.to_string(),
                collection.currency,
                collection.collection_method.as_str(),
                ts(at),
            ],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO commission_collection_item (collection_id, transaction_id) VALUES (?1, ?2)",
        )?;
        for transaction_id in &collection.transaction_ids {
            stmt.execute(params![collection.collection_id, transaction_id])?;
        }
        Ok(())
    }

    pub fn get_collection(&self, collection_id: &str) -> PayResult<Option<CommissionCollectionRow>> {
        let header = self
            .conn
            .query_row(
                "SELECT collection_id, barber_id, amount, currency, status, collection_method,
                        external_collection_id, failure_reason, created_at, resolved_at
                 FROM commission_collection WHERE collection_id = ?1",
                params![collection_id],
                |row| {
                    Ok(CommissionCollectionRow {
                        collection_id: row.get(0)?,
                        barber_id: row.get(1)?,
                        amount: get_decimal(row, 2)?,
                        currency: row.get(3)?,
                        status: get_enum(row, 4)?,
                        collection_method: get_enum(row, 5)?,
                        external_collection_id: row.get(6)?,
                        failure_reason: row.get(7)?,
                        related_transaction_ids: Vec::new(),
                        created_at: get_ts(row, 8)?,
                        resolved_at: get_opt_ts(row, 9)?,
                    })
                },
            )
            .optional()?;
        let Some(mut collection) = header else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id FROM commission_collection_item
             WHERE collection_id = ?1 ORDER BY rowid",
        )?;
        collection.related_transaction_ids = stmt
            .query_map(params![collection_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(collection))
    }

    pub fn collections_for_barber(&self, barber_id: &str) -> PayResult<Vec<CommissionCollectionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection_id FROM commission_collection
             WHERE barber_id = ?1 ORDER BY created_at, rowid",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![barber_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = self.get_collection(&id)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Transactions a collection still claims, in claim order.
    pub fn claimed_transaction_ids(&self, collection_id: &str) -> PayResult<Vec<TransactionId>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id FROM commission_collection_item
             WHERE collection_id = ?1 AND released = 0 ORDER BY rowid",
        )?;
        let ids = stmt
            .query_map(params![collection_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Pending collections that never got a billing reference and were last
    /// handed to billing at or before `before`, oldest first.
    pub fn stranded_collections(
        &self,
        barber_id: &str,
        before: DateTime<Utc>,
    ) -> PayResult<Vec<CollectionId>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection_id FROM commission_collection
             WHERE barber_id = ?1 AND status = 'pending' AND external_collection_id IS NULL
               AND last_submit_at <= ?2
             ORDER BY created_at, rowid",
        )?;
        let ids = stmt
            .query_map(params![barber_id, ts(before)], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Take a stranded collection for resubmission by stamping
    /// `last_submit_at`. Returns false when another worker took it first or
    /// it is no longer stranded.
    pub fn claim_stranded_collection(
        &self,
        collection_id: &str,
        before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE commission_collection SET last_submit_at = ?1
             WHERE collection_id = ?2 AND status = 'pending' AND external_collection_id IS NULL
               AND last_submit_at <= ?3",
            params![ts(at), collection_id, ts(before)],
        )?;
        Ok(changed == 1)
    }

    /// Drop a transaction from the open collection claiming it and take its
    /// commission off that collection's amount. Returns the collection and
    /// its new amount, or None when no open collection held it.
    /// Must run inside the caller's `immediate` block.
    pub(crate) fn release_open_claim(
        &self,
        transaction_id: &str,
        commission: Decimal,
    ) -> PayResult<Option<(CollectionId, Decimal)>> {
        let open = self
            .conn
            .query_row(
                "SELECT c.collection_id, c.amount
                 FROM commission_collection_item i
                 JOIN commission_collection c ON c.collection_id = i.collection_id
                 WHERE i.transaction_id = ?1 AND i.released = 0
                   AND c.status IN ('pending', 'submitted')",
                params![transaction_id],
                |row| Ok((row.get::<_, String>(0)?, get_decimal(row, 1)?)),
            )
            .optional()?;
        let Some((collection_id, amount)) = open else {
            return Ok(None);
        };
        let remaining = (amount - commission).max(Decimal::ZERO);
        self.conn.execute(
            "UPDATE commission_collection_item SET released = 1
             WHERE collection_id = ?1 AND transaction_id = ?2",
            params![collection_id, transaction_id],
        )?;
        self.conn.execute(
            "UPDATE commission_collection SET amount = ?1 WHERE collection_id = ?2",
            params![remaining.to_string(), collection_id],
        )?;
        Ok(Some((collection_id, remaining)))
    }

    /// pending → submitted, recording billing's reference.
    pub fn mark_collection_submitted(
        &self,
        collection_id: &str,
        external_collection_id: &str,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE commission_collection SET status = 'submitted', external_collection_id = ?1
             WHERE collection_id = ?2 AND status = 'pending'",
            params![external_collection_id, collection_id],
        )?;
        Ok(changed == 1)
    }

    /// Open → succeeded, then flag every still-claimed, still-succeeded
    /// transaction collected.
    /// Returns false when the collection was already resolved.
    pub fn resolve_collection_succeeded(
        &self,
        collection_id: &str,
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE commission_collection SET status = ?1, resolved_at = ?2
             WHERE collection_id = ?3 AND status IN ('pending', 'submitted')",
            params![CollectionStatus::Succeeded.as_str(), ts(at), collection_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE external_transaction SET commission_collected = 1, updated_at = ?1
             WHERE commission_collected = 0 AND status = 'succeeded' AND transaction_id IN (
                 SELECT transaction_id FROM commission_collection_item
                 WHERE collection_id = ?2 AND released = 0
             )",
            params![ts(at), collection_id],
        )?;
        Ok(true)
    }

    /// Open → failed, releasing its transactions for a later collection.
    /// Returns false when the collection was already resolved.
    pub fn resolve_collection_failed(
        &self,
        collection_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE commission_collection SET status = ?1, failure_reason = ?2, resolved_at = ?3
             WHERE collection_id = ?4 AND status IN ('pending', 'submitted')",
            params![CollectionStatus::Failed.as_str(), reason, ts(at), collection_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE commission_collection_item SET released = 1 WHERE collection_id = ?1",
            params![collection_id],
        )?;
        Ok(true)
    }
}
