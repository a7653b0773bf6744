//! Repair scheduler — pull repair across every connection, in parallel.
//!
//! RULES:
//!   - Each connection runs on its own scoped thread with its own store
//!     handle (`PaymentEngine::fork`), at most `repair.max_parallel` at once.
//!   - A connection is repaired by one holder at a time: the `repair_lease`
//!     row is the lock, not a mutex, so separate processes exclude each other.
//!   - One connection's failure never aborts the batch. Failures back off
//!     exponentially; `error_after_failures` in a row marks the connection
//!     `error`, and the next success restores `connected`.

use crate::{
    config::RepairConfig,
    engine::PaymentEngine,
    error::PayResult,
    event::{AuditEvent, AuditSink},
    reconciler::RepairReport,
    settings::ProcessorConnection,
    types::{ConnectionId, ConnectionStatus},
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectionRepairOutcome {
    Repaired(RepairReport),
    NotDue { next_attempt_at: DateTime<Utc> },
    Leased { holder: Option<String> },
    Failed {
        error: String,
        consecutive_failures: u32,
        marked_error: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairBatchReport {
    pub outcomes: Vec<(ConnectionId, ConnectionRepairOutcome)>,
}

impl RepairBatchReport {
    pub fn outcome(&self, connection_id: &str) -> Option<&ConnectionRepairOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == connection_id)
            .map(|(_, o)| o)
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ConnectionRepairOutcome::Failed { .. }))
            .count()
    }
}

/// Delay before the `failures`-th consecutive retry, without jitter:
/// `min(base · 2^(failures-1), max)`.
pub fn backoff_delay(config: &RepairConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(30);
    let secs = config
        .backoff_base_secs
        .saturating_mul(1i64 << exponent)
        .min(config.backoff_max_secs);
    Duration::seconds(secs)
}

pub struct RepairScheduler<'a> {
    engine: &'a PaymentEngine,
    holder: String,
}

impl<'a> RepairScheduler<'a> {
    pub fn new(engine: &'a PaymentEngine) -> Self {
        Self {
            engine,
            holder: format!("repair-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Repair every connected or errored connection that is due.
    pub fn run(&self) -> PayResult<RepairBatchReport> {
        let connections = self.engine.store().repairable_connections()?;
        let width = self.engine.config().repair.max_parallel.max(1);
        let mut report = RepairBatchReport::default();

        for chunk in connections.chunks(width) {
            let forks = chunk
                .iter()
                .map(|_| self.engine.fork())
                .collect::<PayResult<Vec<_>>>()?;
            let holder = self.holder.as_str();

            let results: Vec<(ConnectionId, ConnectionRepairOutcome)> = std::thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .zip(forks)
                    .map(|(connection, fork)| {
                        let handle = s.spawn(move || repair_isolated(&fork, connection, holder));
                        (connection.connection_id.clone(), handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(id, handle)| {
                        let outcome = handle.join().unwrap_or_else(|_| {
                            log::error!("connection={id} repair: worker panicked");
                            ConnectionRepairOutcome::Failed {
                                error: "repair worker panicked".into(),
                                consecutive_failures: 0,
                                marked_error: false,
                            }
                        });
                        (id, outcome)
                    })
                    .collect()
            });
            report.outcomes.extend(results);
        }
        Ok(report)
    }

    /// Repair one connection on the calling thread.
    pub fn run_one(&self, connection: &ProcessorConnection) -> ConnectionRepairOutcome {
        repair_isolated(self.engine, connection, &self.holder)
    }
}

/// Infrastructure errors (store, lease bookkeeping) become a `Failed`
/// outcome so the rest of the batch proceeds.
fn repair_isolated(
    engine: &PaymentEngine,
    connection: &ProcessorConnection,
    holder: &str,
) -> ConnectionRepairOutcome {
    match repair_connection(engine, connection, holder) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("connection={} repair: {e}", connection.connection_id);
            ConnectionRepairOutcome::Failed {
                error: e.to_string(),
                consecutive_failures: 0,
                marked_error: false,
            }
        }
    }
}

fn repair_connection(
    engine: &PaymentEngine,
    connection: &ProcessorConnection,
    holder: &str,
) -> PayResult<ConnectionRepairOutcome> {
    let store = engine.store();
    let config = &engine.config().repair;
    let id = connection.connection_id.as_str();
    let now = engine.clock().now();

    let state = store.repair_state(id)?;
    if let Some(next) = state.as_ref().and_then(|s| s.next_attempt_at) {
        if next > now {
            log::debug!("connection={id} repair: backing off until {next}");
            return Ok(ConnectionRepairOutcome::NotDue {
                next_attempt_at: next,
            });
        }
    }

    if !store.try_acquire_repair_lease(id, holder, now, Duration::seconds(config.lease_ttl_secs))? {
        let holder = store.repair_lease_holder(id)?;
        log::debug!("connection={id} repair: lease held by {holder:?}, skipping");
        return Ok(ConnectionRepairOutcome::Leased { holder });
    }

    let result = engine
        .reconciler()
        .repair_connection(connection, engine.gateway(), config);
    store.release_repair_lease(id, holder)?;

    match result {
        Ok(report) => {
            store.record_repair_success(id, now)?;
            if connection.status == ConnectionStatus::Error {
                engine.set_connection_status(id, ConnectionStatus::Connected, "pull repair succeeded")?;
            }
            store.record(
                now,
                &AuditEvent::RepairCompleted {
                    connection_id: id.to_string(),
                    fetched: report.fetched,
                    applied: report.applied(),
                    conflicts: report.conflicts,
                },
            )?;
            Ok(ConnectionRepairOutcome::Repaired(report))
        }
        Err(e) => {
            let failures = state.map(|s| s.consecutive_failures).unwrap_or(0) + 1;
            let jitter = if config.backoff_jitter_secs > 0 {
                rand::thread_rng().gen_range(0..=config.backoff_jitter_secs)
            } else {
                0
            };
            let next_attempt_at = now + backoff_delay(config, failures) + Duration::seconds(jitter);
            let failures = store.record_repair_failure(id, &e.to_string(), next_attempt_at)?;
            log::warn!(
                "connection={id} repair: attempt {failures} failed: {e}; next attempt at {next_attempt_at}"
            );

            let marked_error = failures >= config.error_after_failures
                && connection.status == ConnectionStatus::Connected
                && engine.set_connection_status(
                    id,
                    ConnectionStatus::Error,
                    &format!("{failures} consecutive repair failures"),
                )?;
            store.record(
                now,
                &AuditEvent::RepairFailed {
                    connection_id: id.to_string(),
                    error: e.to_string(),
                    consecutive_failures: failures,
                },
            )?;
            Ok(ConnectionRepairOutcome::Failed {
                error: e.to_string(),
                consecutive_failures: failures,
                marked_error,
            })
        }
    }
}
