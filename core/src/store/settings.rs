use super::{
    get_decimal, get_enum, get_json, get_opt_decimal, get_opt_ts, get_ts, not_found, ts,
    PaymentStore,
};
use crate::{
    error::PayResult,
    settings::{PaymentConfiguration, PaymentSettings, ProcessorConnection},
    types::{ConnectionStatus, ProcessorType},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

const CONFIG_COLUMNS: &str = "barber_id, version, mode, primary_processor, fallback_to_platform,
    commission_rate, hybrid_rules, minimum_collection_amount, maximum_outstanding,
    collection_method, created_at";

const CONNECTION_COLUMNS: &str = "connection_id, barber_id, processor_type, account_id, status,
    webhook_secret, capabilities, total_transactions, total_volume, created_at, updated_at,
    revoked_at";

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentConfiguration> {
    let primary: Option<String> = row.get(3)?;
    let primary_processor = primary
        .map(|p| {
            p.parse::<ProcessorType>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
            })
        })
        .transpose()?;
    Ok(PaymentConfiguration {
        barber_id: row.get(0)?,
        version: row.get(1)?,
        mode: get_enum(row, 2)?,
        primary_processor,
        fallback_to_platform: row.get(4)?,
        commission_rate: get_opt_decimal(row, 5)?,
        hybrid_rules: get_json(row, 6)?,
        minimum_collection_amount: get_decimal(row, 7)?,
        maximum_outstanding: get_opt_decimal(row, 8)?,
        collection_method: get_enum(row, 9)?,
        created_at: get_ts(row, 10)?,
    })
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessorConnection> {
    Ok(ProcessorConnection {
        connection_id: row.get(0)?,
        barber_id: row.get(1)?,
        processor_type: get_enum(row, 2)?,
        account_id: row.get(3)?,
        status: get_enum(row, 4)?,
        webhook_secret: row.get(5)?,
        capabilities: get_json(row, 6)?,
        total_transactions: row.get(7)?,
        total_volume: get_decimal(row, 8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
        revoked_at: get_opt_ts(row, 11)?,
    })
}

impl PaymentStore {
    // ── Payment configuration (versioned, insert-only) ──────────────

    /// Persist `config` as the barber's next version. The passed `version` is
    /// ignored; the stored row gets `max(version) + 1`.
    pub fn save_configuration(
        &self,
        config: &PaymentConfiguration,
        at: DateTime<Utc>,
    ) -> PayResult<PaymentConfiguration> {
        self.immediate(|| {
            let current: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM payment_configuration WHERE barber_id = ?1",
                params![config.barber_id],
                |row| row.get(0),
            )?;
            let mut saved = config.clone();
            saved.version = current + 1;
            saved.created_at = at;
            self.conn.execute(
                &format!(
                    "INSERT INTO payment_configuration ({CONFIG_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    saved.barber_id,
                    saved.version,
                    saved.mode.as_str(),
                    saved.primary_processor.map(|p| p.as_str()),
                    saved.fallback_to_platform,
                    saved.commission_rate.map(|r| r.to_string()),
                    serde_json::to_string(&saved.hybrid_rules)?,
                    saved.minimum_collection_amount.to_string(),
                    saved.maximum_outstanding.map(|m| m.to_string()),
                    saved.collection_method.as_str(),
                    ts(saved.created_at),
                ],
            )?;
            Ok(saved)
        })
    }

    /// Every version, oldest first.
    pub fn configuration_history(&self, barber_id: &str) -> PayResult<Vec<PaymentConfiguration>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM payment_configuration
             WHERE barber_id = ?1 ORDER BY version"
        ))?;
        let rows = stmt
            .query_map(params![barber_id], config_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Processor connections ───────────────────────────────────────

    pub fn insert_connection(&self, conn: &ProcessorConnection) -> PayResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO processor_connection ({CONNECTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                conn.connection_id,
                conn.barber_id,
                conn.processor_type.as_str(),
                conn.account_id,
                conn.status.as_str(),
                conn.webhook_secret,
                serde_json::to_string(&conn.capabilities)?,
                conn.total_transactions,
                conn.total_volume.to_string(),
                ts(conn.created_at),
                ts(conn.updated_at),
                conn.revoked_at.map(ts),
            ],
        )?;
        Ok(())
    }

    /// Compare-and-set on status. Returns false when the connection was not
    /// in `from` (or does not exist). Moving to `disconnected` is a revocation:
    /// it stamps `revoked_at` and drops the webhook secret.
    pub fn update_connection_status(
        &self,
        connection_id: &str,
        from: ConnectionStatus,
        to: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let revoking = to == ConnectionStatus::Disconnected;
        let changed = self.conn.execute(
            "UPDATE processor_connection
             SET status = ?1,
                 updated_at = ?2,
                 revoked_at = CASE WHEN ?3 THEN ?2 ELSE revoked_at END,
                 webhook_secret = CASE WHEN ?3 THEN NULL ELSE webhook_secret END
             WHERE connection_id = ?4 AND status = ?5",
            params![to.as_str(), ts(at), revoking, connection_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// disconnected → connected for a barber re-linking the same account:
    /// a fresh secret and capabilities, `revoked_at` cleared. Returns false
    /// when the connection was not disconnected.
    pub fn relink_connection(
        &self,
        connection_id: &str,
        secret: &str,
        capabilities: &[String],
        at: DateTime<Utc>,
    ) -> PayResult<bool> {
        let changed = self.conn.execute(
            "UPDATE processor_connection
             SET status = 'connected', webhook_secret = ?1, capabilities = ?2,
                 revoked_at = NULL, updated_at = ?3
             WHERE connection_id = ?4 AND status = 'disconnected'",
            params![secret, serde_json::to_string(capabilities)?, ts(at), connection_id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_webhook_secret(
        &self,
        connection_id: &str,
        secret: &str,
        at: DateTime<Utc>,
    ) -> PayResult<()> {
        let changed = self.conn.execute(
            "UPDATE processor_connection SET webhook_secret = ?1, updated_at = ?2
             WHERE connection_id = ?3",
            params![secret, ts(at), connection_id],
        )?;
        if changed == 0 {
            return Err(not_found("processor_connection", connection_id));
        }
        Ok(())
    }

    /// Add one succeeded transaction to the connection's running totals.
    /// Must run inside the caller's `immediate` block.
    pub(crate) fn bump_connection_stats(
        &self,
        connection_id: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PayResult<()> {
        let volume = self
            .conn
            .query_row(
                "SELECT total_volume FROM processor_connection WHERE connection_id = ?1",
                params![connection_id],
                |row| get_decimal(row, 0),
            )
            .optional()?
            .ok_or_else(|| not_found("processor_connection", connection_id))?;
        self.conn.execute(
            "UPDATE processor_connection
             SET total_transactions = total_transactions + 1, total_volume = ?1, updated_at = ?2
             WHERE connection_id = ?3",
            params![(volume + amount).to_string(), ts(at), connection_id],
        )?;
        Ok(())
    }

    pub fn connections_for_barber(&self, barber_id: &str) -> PayResult<Vec<ProcessorConnection>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM processor_connection
             WHERE barber_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![barber_id], connection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every connection the repair scheduler may visit, oldest first.
    pub fn repairable_connections(&self) -> PayResult<Vec<ProcessorConnection>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM processor_connection
             WHERE status IN ('connected', 'error') ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map([], connection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl PaymentSettings for PaymentStore {
    fn payment_configuration(&self, barber_id: &str) -> PayResult<Option<PaymentConfiguration>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFIG_COLUMNS} FROM payment_configuration
                     WHERE barber_id = ?1 ORDER BY version DESC LIMIT 1"
                ),
                params![barber_id],
                config_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn active_connections(&self, barber_id: &str) -> PayResult<Vec<ProcessorConnection>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM processor_connection
             WHERE barber_id = ?1 AND status = 'connected'
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![barber_id], connection_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn connection(&self, connection_id: &str) -> PayResult<Option<ProcessorConnection>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM processor_connection WHERE connection_id = ?1"
                ),
                params![connection_id],
                connection_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn connection_for_account(
        &self,
        processor: ProcessorType,
        account_id: &str,
    ) -> PayResult<Option<ProcessorConnection>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM processor_connection
                     WHERE processor_type = ?1 AND account_id = ?2
                     ORDER BY status = 'disconnected', created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![processor.as_str(), account_id],
                connection_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn outstanding_commission(&self, barber_id: &str) -> PayResult<Decimal> {
        self.uncollected_commission(barber_id)
    }
}
