use super::{get_decimal, get_enum, get_json, get_ts, ts, ExternalTransactionRow, PaymentStore};
use crate::{
    error::PayResult,
    types::{BarberId, ConnectionId, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub(super) const TXN_COLUMNS: &str = "transaction_id, connection_id, barber_id, external_transaction_id,
    amount, currency, status, commission_rate, commission_amount, commission_collected,
    metadata, created_at, updated_at";

/// A transaction as first observed. Commission fields are frozen from here on.
#[derive(Debug, Clone)]
pub struct NewExternalTransaction {
    pub transaction_id:          TransactionId,
    pub connection_id:           ConnectionId,
    pub barber_id:               BarberId,
    pub external_transaction_id: String,
    pub amount:                  Decimal,
    pub currency:                String,
    pub status:                  TransactionStatus,
    pub commission_rate:         Decimal,
    pub commission_amount:       Decimal,
    pub metadata:                BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(ExternalTransactionRow),
    /// Another writer got there first; this is the row it left.
    Existing(ExternalTransactionRow),
}

pub(super) fn txn_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalTransactionRow> {
    Ok(ExternalTransactionRow {
        transaction_id: row.get(0)?,
        connection_id: row.get(1)?,
        barber_id: row.get(2)?,
        external_transaction_id: row.get(3)?,
        amount: get_decimal(row, 4)?,
        currency: row.get(5)?,
        status: get_enum(row, 6)?,
        commission_rate: get_decimal(row, 7)?,
        commission_amount: get_decimal(row, 8)?,
        commission_collected: row.get(9)?,
        metadata: get_json(row, 10)?,
        created_at: get_ts(row, 11)?,
        updated_at: get_ts(row, 12)?,
    })
}

impl PaymentStore {
    // ── External transactions ───────────────────────────────────────

    pub fn find_transaction(
        &self,
        connection_id: &str,
        external_transaction_id: &str,
    ) -> PayResult<Option<ExternalTransactionRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TXN_COLUMNS} FROM external_transaction
                     WHERE connection_id = ?1 AND external_transaction_id = ?2"
                ),
                params![connection_id, external_transaction_id],
                txn_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> PayResult<Option<ExternalTransactionRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {TXN_COLUMNS} FROM external_transaction WHERE transaction_id = ?1"),
                params![transaction_id],
                txn_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert unless (connection_id, external_transaction_id) already exists.
    /// The unique key decides the race; the loser reads the winner's row.
    pub fn insert_transaction_if_absent(
        &self,
        txn: &NewExternalTransaction,
        at: DateTime<Utc>,
    ) -> PayResult<UpsertOutcome> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO external_transaction ({TXN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?11)
                 ON CONFLICT (connection_id, external_transaction_id) DO NOTHING"
            ),
            params![
                txn.transaction_id,
                txn.connection_id,
                txn.barber_id,
                txn.external_transaction_id,
                txn.amount.to_string(),
                txn.currency,
                txn.status.as_str(),
                txn.commission_rate.to_string(),
                txn.commission_amount.to_string(),
                serde_json::to_string(&txn.metadata)?,
                ts(at),
            ],
        )?;
        let row = self
            .find_transaction(&txn.connection_id, &txn.external_transaction_id)?
            .ok_or_else(|| super::not_found("external_transaction", &txn.external_transaction_id))?;
        Ok(if inserted == 1 {
            UpsertOutcome::Created(row)
        } else {
            UpsertOutcome::Existing(row)
        })
    }

    /// Compare-and-set: only moves the row if it is still in `from`.
    pub fn transition_transaction(
        &self,
        transaction_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE external_transaction SET status = ?1, updated_at = ?2
             WHERE transaction_id = ?3 AND status = ?4",
            params![to.as_str(), ts(at), transaction_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Merge keys into the metadata bag; existing keys are overwritten.
    pub fn merge_transaction_metadata(
        &self,
        transaction_id: &str,
        extra: &BTreeMap<String, serde_json::Value>,
    ) -> PayResult<()> {
        if extra.is_empty() {
            return Ok(());
        }
        let current: Option<BTreeMap<String, serde_json::Value>> = self
            .conn
            .query_row(
                "SELECT metadata FROM external_transaction WHERE transaction_id = ?1",
                params![transaction_id],
                |row| get_json(row, 0),
            )
            .optional()?;
        let mut merged = current.ok_or_else(|| super::not_found("external_transaction", transaction_id))?;
        merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.conn.execute(
            "UPDATE external_transaction SET metadata = ?1 WHERE transaction_id = ?2",
            params![serde_json::to_string(&merged)?, transaction_id],
        )?;
        Ok(())
    }

    pub fn transactions_in_status(
        &self,
        connection_id: &str,
        status: TransactionStatus,
    ) -> PayResult<Vec<ExternalTransactionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM external_transaction
             WHERE connection_id = ?1 AND status = ?2
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![connection_id, status.as_str()], txn_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn transactions_for_barber(&self, barber_id: &str) -> PayResult<Vec<ExternalTransactionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM external_transaction
             WHERE barber_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![barber_id], txn_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_transactions(&self, connection_id: &str) -> PayResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM external_transaction WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
