//! pay-runner: headless operator runner for the barbershop payments core.
//!
//! Usage:
//!   pay-runner --db pay.db --seed-fixtures fixtures.json
//!   pay-runner --db pay.db --replay stripe event.json --header stripe-signature=t=..,v1=..
//!   pay-runner --db pay.db --repair ./gateway
//!   pay-runner --db pay.db --commission barber-1
//!
//! Steps run in the order above; any combination may be given.

use anyhow::{anyhow, Context, Result};
use barberpay_core::{
    clock::SystemClock,
    config::PaymentsConfig,
    engine::PaymentEngine,
    error::{BillingError, GatewayError},
    gateway::{
        CollectionBilling, ExternalPayment, ExternalPaymentRequest, GatewayAdapter,
        GatewayTransaction,
    },
    ingest::WebhookRequest,
    settings::{HybridRules, NewConnection, PaymentConfiguration, ProcessorConnection},
    store::PaymentStore,
    types::{BarberId, CollectionMethod, PaymentMode, ProcessorType, TransactionId},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Deserialize)]
struct Fixtures {
    #[serde(default)]
    configurations: Vec<FixtureConfiguration>,
    #[serde(default)]
    connections: Vec<FixtureConnection>,
}

#[derive(Deserialize)]
struct FixtureConfiguration {
    barber_id:                 String,
    mode:                      PaymentMode,
    #[serde(default)]
    primary_processor:         Option<ProcessorType>,
    #[serde(default = "default_true")]
    fallback_to_platform:      bool,
    #[serde(default)]
    commission_rate:           Option<Decimal>,
    #[serde(default)]
    hybrid_rules:              HybridRules,
    #[serde(default)]
    minimum_collection_amount: Option<Decimal>,
    #[serde(default)]
    maximum_outstanding:       Option<Decimal>,
    #[serde(default)]
    collection_method:         Option<CollectionMethod>,
}

#[derive(Deserialize)]
struct FixtureConnection {
    barber_id:      String,
    processor_type: ProcessorType,
    account_id:     String,
    webhook_secret: String,
    #[serde(default)]
    capabilities:   Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Default)]
struct RunSummary {
    db:                    String,
    seeded_configurations: usize,
    seeded_connections:    Vec<ProcessorConnection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay:                Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair:                Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commission:            Option<serde_json::Value>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");

    let config = if Path::new(data_dir).join("payments.json").exists() {
        PaymentsConfig::load(data_dir)?
    } else {
        log::info!("runner: no payments.json in {data_dir}, using defaults");
        PaymentsConfig::default()
    };

    // For :memory: use a shared-memory URI so forked store handles (repair
    // workers) see the same database.
    let db_effective: String = if db == ":memory:" {
        format!("file:payrun_{}?mode=memory&cache=shared", unix_secs())
    } else {
        db.to_string()
    };
    let store = PaymentStore::open(&db_effective)?;

    let gateway_dir = flag_value(&args, "--repair").map(PathBuf::from);
    let gateway = FileGateway {
        root: gateway_dir.clone().unwrap_or_else(|| PathBuf::from("./gateway")),
    };
    let engine = PaymentEngine::build(
        store,
        config,
        Arc::new(SystemClock),
        Arc::new(gateway),
        Arc::new(ManualBilling),
    )?;

    let mut summary = RunSummary {
        db: db.to_string(),
        ..RunSummary::default()
    };

    if let Some(path) = flag_value(&args, "--seed-fixtures") {
        seed_fixtures(&engine, path, &mut summary)?;
    }

    if let Some(pos) = args.iter().position(|a| a == "--replay") {
        let processor: ProcessorType = args
            .get(pos + 1)
            .ok_or_else(|| anyhow!("--replay needs <processor> <payload-file>"))?
            .parse()
            .map_err(|e| anyhow!("--replay: {e}"))?;
        let payload_path = args
            .get(pos + 2)
            .ok_or_else(|| anyhow!("--replay needs <processor> <payload-file>"))?;
        let body = std::fs::read(payload_path)
            .with_context(|| format!("Cannot read {payload_path}"))?;
        let request = WebhookRequest::new(processor, header_args(&args)?, body);
        let (response, outcome) = engine.ingest().handle_with_outcome(&request);
        summary.replay = Some(serde_json::json!({
            "processor": processor,
            "status": response.status,
            "body": response.body,
            "outcome": outcome,
        }));
    }

    if gateway_dir.is_some() {
        let report = engine.repair_scheduler().run()?;
        summary.repair = Some(serde_json::to_value(&report)?);
    }

    if let Some(barber_id) = flag_value(&args, "--commission") {
        let collections = engine.commissions().generate(barber_id)?;
        let outstanding = engine.commissions().outstanding_commission(barber_id)?;
        summary.commission = Some(serde_json::json!({
            "barber_id": barber_id,
            "collections": collections,
            "outstanding": outstanding,
        }));
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn seed_fixtures(engine: &PaymentEngine, path: &str, summary: &mut RunSummary) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
    let fixtures: Fixtures =
        serde_json::from_str(&content).with_context(|| format!("Cannot parse {path}"))?;
    let default_method = engine.config().collection.default_method;

    for f in fixtures.configurations {
        let mut config = PaymentConfiguration::onboarding(f.barber_id, default_method);
        config.mode = f.mode;
        config.primary_processor = f.primary_processor;
        config.fallback_to_platform = f.fallback_to_platform;
        config.commission_rate = f.commission_rate;
        config.hybrid_rules = f.hybrid_rules;
        if let Some(min) = f.minimum_collection_amount {
            config.minimum_collection_amount = min;
        }
        config.maximum_outstanding = f.maximum_outstanding;
        if let Some(method) = f.collection_method {
            config.collection_method = method;
        }
        engine.save_configuration(&config)?;
        summary.seeded_configurations += 1;
    }

    for c in fixtures.connections {
        let connection = engine.register_connection(NewConnection {
            barber_id: c.barber_id,
            processor_type: c.processor_type,
            account_id: c.account_id,
            webhook_secret: c.webhook_secret,
            capabilities: c.capabilities,
        })?;
        summary.seeded_connections.push(connection);
    }
    Ok(())
}

/// Every `--header name=value` pair on the command line.
fn header_args(args: &[String]) -> Result<Vec<(String, String)>> {
    args.windows(2)
        .filter(|w| w[0] == "--header")
        .map(|w| {
            w[1].split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("--header expects name=value, got {}", w[1]))
        })
        .collect()
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Offline collaborators ─────────────────────────────────────────

/// Reads what the processor "reports" from `{root}/{account_id}.json`, a
/// JSON array of `GatewayTransaction`s. Read-only: payments and refunds are
/// rejected.
struct FileGateway {
    root: PathBuf,
}

impl FileGateway {
    fn load(&self, connection: &ProcessorConnection) -> Result<Vec<GatewayTransaction>, GatewayError> {
        let path = self.root.join(format!("{}.json", connection.account_id));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GatewayError::Unavailable(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Unavailable(format!("{}: {e}", path.display())))
    }
}

impl GatewayAdapter for FileGateway {
    fn create_external_payment(
        &self,
        _connection: &ProcessorConnection,
        _request: &ExternalPaymentRequest,
    ) -> Result<ExternalPayment, GatewayError> {
        Err(GatewayError::Rejected("file gateway is read-only".into()))
    }

    fn refund(
        &self,
        _connection: &ProcessorConnection,
        _external_transaction_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<GatewayTransaction, GatewayError> {
        Err(GatewayError::Rejected("file gateway is read-only".into()))
    }

    fn get_transaction(
        &self,
        connection: &ProcessorConnection,
        external_transaction_id: &str,
    ) -> Result<GatewayTransaction, GatewayError> {
        self.load(connection)?
            .into_iter()
            .find(|t| t.external_transaction_id == external_transaction_id)
            .ok_or_else(|| GatewayError::NotFound(external_transaction_id.to_string()))
    }

    fn list_recent_transactions(
        &self,
        connection: &ProcessorConnection,
        since: DateTime<Utc>,
        _timeout: std::time::Duration,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        Ok(self
            .load(connection)?
            .into_iter()
            .filter(|t| t.updated_at >= since)
            .collect())
    }
}

/// Collections are logged for an operator to submit by hand.
struct ManualBilling;

impl CollectionBilling for ManualBilling {
    fn create_collection(
        &self,
        barber_id: &BarberId,
        amount: Decimal,
        currency: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<String, BillingError> {
        let reference = format!("manual-{barber_id}-{}", unix_secs());
        log::info!(
            "barber={barber_id} billing: collect {amount} {currency} over {} transactions as {reference}",
            transaction_ids.len()
        );
        Ok(reference)
    }
}
