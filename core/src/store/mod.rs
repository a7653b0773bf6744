//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods and never execute SQL directly.
//!
//! Money is stored as decimal TEXT, timestamps as RFC 3339 UTC TEXT with a
//! fixed width so that string comparison orders them correctly.

use crate::error::{PayError, PayResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

mod audit;
mod collections;
mod repair;
mod settings;
mod transactions;

pub use collections::NewCollection;
pub use transactions::{NewExternalTransaction, UpsertOutcome};

pub struct PaymentStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl PaymentStore {
    pub fn open(path: &str) -> PayResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PayResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> PayResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to call on every open.
    pub fn migrate(&self) -> PayResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_settings.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_external_transactions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_commission.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_repair.sql"))?;
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
    /// up front, so read-then-write sequences inside `f` cannot interleave with
    /// another connection's. Any error rolls back.
    pub fn immediate<T>(&self, f: impl FnOnce() -> PayResult<T>) -> PayResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f()?;
        tx.commit()?;
        Ok(out)
    }
}

// ── Column codecs ──────────────────────────────────────────────────

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
}

pub(crate) fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        Decimal::from_str(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Parse an enum column stored via `as_str()`.
pub(crate) fn get_enum<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn not_found(entity: &'static str, id: &str) -> PayError {
    PayError::NotFound {
        entity,
        id: id.to_string(),
    }
}

// ── Row types ──────────────────────────────────────────────────────

use crate::types::{
    BarberId, CollectionId, CollectionMethod, ConnectionId, TransactionId, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalTransactionRow {
    pub transaction_id:          TransactionId,
    pub connection_id:           ConnectionId,
    pub barber_id:               BarberId,
    pub external_transaction_id: String,
    pub amount:                  Decimal,
    pub currency:                String,
    pub status:                  TransactionStatus,
    pub commission_rate:         Decimal,
    pub commission_amount:       Decimal,
    pub commission_collected:    bool,
    pub metadata:                BTreeMap<String, serde_json::Value>,
    pub created_at:              DateTime<Utc>,
    pub updated_at:              DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Submitted)
    }
}

impl FromStr for CollectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown collection status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionCollectionRow {
    pub collection_id:           CollectionId,
    pub barber_id:               BarberId,
    pub amount:                  Decimal,
    pub currency:                String,
    pub status:                  CollectionStatus,
    pub collection_method:       CollectionMethod,
    pub external_collection_id:  Option<String>,
    pub failure_reason:          Option<String>,
    pub related_transaction_ids: Vec<TransactionId>,
    pub created_at:              DateTime<Utc>,
    pub resolved_at:             Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairStateRow {
    pub connection_id:        ConnectionId,
    pub consecutive_failures: u32,
    pub next_attempt_at:      Option<DateTime<Utc>>,
    pub last_success_at:      Option<DateTime<Utc>>,
    pub last_error:           Option<String>,
}

/// The audit log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id:          Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub category:    String,
    pub event_type:  String,
    pub subject:     Option<String>,
    pub payload:     String, // JSON-serialized AuditEvent
}
