//! Payment router — decides, per attempt, who executes a new payment.
//!
//! Reads configuration, never writes it. Every attempt ends in either a
//! `RoutingDecision` or a `RoutingError`, and both are audited.
//!
//! Hybrid rule order (first match wins):
//!   1. client preference
//!   2. amount below `minimum_external_amount` → platform
//!   3. service type on the external override list → external
//!   4. business hours, only when no primary processor is set
//!   5. primary processor if set, else platform
//!
//! Anything that lands on "external" then needs a connected connection and
//! must clear the outstanding-commission guard, else it falls back to the
//! platform (when allowed) or fails.

use crate::{
    clock::Clock,
    error::{PayError, PayResult, RoutingError, RoutingErrorKind},
    event::{AuditEvent, AuditSink},
    fees::{FeeBreakdown, FeeCalculator},
    money,
    settings::{BusinessHours, PaymentConfiguration, PaymentSettings, ProcessorConnection},
    types::{BarberId, ConnectionId, PaymentMode, PaymentProcessor},
};
use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPreference {
    Platform,
    External,
    /// Deposit through the platform, balance through the barber's processor.
    Split,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub barber_id:         BarberId,
    pub appointment_id:    Option<String>,
    pub amount:            Decimal,
    pub currency:          String,
    #[serde(default)]
    pub client_preference: Option<ClientPreference>,
    #[serde(default)]
    pub service_type:      Option<String>,
    #[serde(default)]
    pub metadata:          BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Centralized,
    External,
    FallbackToPlatform,
    Split,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "CENTRALIZED",
            Self::External => "EXTERNAL",
            Self::FallbackToPlatform => "FALLBACK_TO_PLATFORM",
            Self::Split => "SPLIT",
        }
    }
}

/// Which rule produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    CentralizedMode,
    DecentralizedMode,
    ClientPreference,
    BelowMinimumExternalAmount,
    ServiceTypeOverride,
    BusinessHours,
    OutsideBusinessHours,
    PrimaryProcessor,
    HybridDefault,
    NoActiveConnection,
    OutstandingLimit,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CentralizedMode => "centralized_mode",
            Self::DecentralizedMode => "decentralized_mode",
            Self::ClientPreference => "client_preference",
            Self::BelowMinimumExternalAmount => "below_minimum_external_amount",
            Self::ServiceTypeOverride => "service_type_override",
            Self::BusinessHours => "business_hours",
            Self::OutsideBusinessHours => "outside_business_hours",
            Self::PrimaryProcessor => "primary_processor",
            Self::HybridDefault => "hybrid_default",
            Self::NoActiveConnection => "no_active_connection",
            Self::OutstandingLimit => "outstanding_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAmounts {
    pub platform_amount: Decimal,
    pub external_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub decision:          DecisionKind,
    /// Executes the payment (for a split, the external balance).
    pub processor:         PaymentProcessor,
    pub target_connection: Option<ConnectionId>,
    pub fee_breakdown:     FeeBreakdown,
    pub split:             Option<SplitAmounts>,
    pub reason:            RoutingReason,
}

enum Intent {
    Platform(RoutingReason),
    External(RoutingReason),
    Split(RoutingReason),
}

pub struct PaymentRouter<'a> {
    settings: &'a dyn PaymentSettings,
    fees:     &'a FeeCalculator,
    clock:    &'a dyn Clock,
    audit:    &'a dyn AuditSink,
}

impl<'a> PaymentRouter<'a> {
    pub fn new(
        settings: &'a dyn PaymentSettings,
        fees: &'a FeeCalculator,
        clock: &'a dyn Clock,
        audit: &'a dyn AuditSink,
    ) -> Self {
        Self {
            settings,
            fees,
            clock,
            audit,
        }
    }

    pub fn route(&self, request: &PaymentRequest) -> PayResult<RoutingDecision> {
        let now = self.clock.now();
        match self.decide(request, now) {
            Ok(decision) => {
                self.audit.record(
                    now,
                    &AuditEvent::RoutingDecided {
                        barber_id: request.barber_id.clone(),
                        appointment_id: request.appointment_id.clone(),
                        decision: decision.decision.as_str().into(),
                        processor: decision.processor.fee_key().into(),
                        connection_id: decision.target_connection.clone(),
                        reason: decision.reason.as_str().into(),
                        amount: request.amount,
                        currency: request.currency.clone(),
                    },
                )?;
                log::debug!(
                    "barber={} route: {} via {} ({})",
                    request.barber_id,
                    decision.decision.as_str(),
                    decision.processor.fee_key(),
                    decision.reason.as_str()
                );
                Ok(decision)
            }
            Err(PayError::Routing(e)) => {
                log::warn!("barber={} route: {e}", request.barber_id);
                self.audit.record(
                    now,
                    &AuditEvent::RoutingFailed {
                        barber_id: request.barber_id.clone(),
                        appointment_id: request.appointment_id.clone(),
                        error: e.kind.to_string(),
                        amount: request.amount,
                        currency: request.currency.clone(),
                    },
                )?;
                Err(PayError::Routing(e))
            }
            Err(other) => Err(other),
        }
    }

    fn decide(&self, request: &PaymentRequest, now: DateTime<Utc>) -> PayResult<RoutingDecision> {
        let fail = |kind: RoutingErrorKind, mode: Option<PaymentMode>| RoutingError {
            kind,
            barber_id: request.barber_id.clone(),
            appointment_id: request.appointment_id.clone(),
            mode: mode.map(|m| m.as_str().to_string()),
            amount: request.amount,
            currency: request.currency.clone(),
        };

        if request.amount <= Decimal::ZERO {
            return Err(fail(
                RoutingErrorKind::InvalidAmount(format!("amount {} is not positive", request.amount)),
                None,
            )
            .into());
        }
        if !money::is_valid_currency(&request.currency) {
            return Err(fail(
                RoutingErrorKind::InvalidAmount(format!("unknown currency '{}'", request.currency)),
                None,
            )
            .into());
        }
        let currency = money::normalize_currency(&request.currency);
        let amount = money::round(request.amount, &currency);

        let config = self
            .settings
            .payment_configuration(&request.barber_id)?
            .ok_or_else(|| fail(RoutingErrorKind::NoConfiguration, None))?;
        let rate = self.fees.effective_commission_rate(config.commission_rate);

        let intent = match config.mode {
            PaymentMode::Centralized => Intent::Platform(RoutingReason::CentralizedMode),
            PaymentMode::Decentralized => Intent::External(RoutingReason::DecentralizedMode),
            PaymentMode::Hybrid => hybrid_intent(&config, request, amount, now),
        };

        let platform = |decision, reason| RoutingDecision {
            decision,
            processor: PaymentProcessor::Platform,
            target_connection: None,
            fee_breakdown: self
                .fees
                .calculate(amount, &currency, PaymentProcessor::Platform, rate),
            split: None,
            reason,
        };

        let (split, reason) = match intent {
            Intent::Platform(reason) => return Ok(platform(DecisionKind::Centralized, reason)),
            Intent::External(reason) => (false, reason),
            Intent::Split(reason) => (true, reason),
        };

        if let Some(limit) = config.maximum_outstanding {
            let outstanding = self.settings.outstanding_commission(&request.barber_id)?;
            if outstanding >= limit {
                log::info!(
                    "barber={} route: outstanding commission {outstanding} ≥ limit {limit}",
                    request.barber_id
                );
                return if config.fallback_to_platform {
                    Ok(platform(DecisionKind::FallbackToPlatform, RoutingReason::OutstandingLimit))
                } else {
                    Err(fail(RoutingErrorKind::OutstandingLimit, Some(config.mode)).into())
                };
            }
        }

        let connections = self.settings.active_connections(&request.barber_id)?;
        let Some(target) = pick_connection(&config, &connections) else {
            return if config.fallback_to_platform {
                Ok(platform(DecisionKind::FallbackToPlatform, RoutingReason::NoActiveConnection))
            } else {
                Err(fail(RoutingErrorKind::NoActiveConnection, Some(config.mode)).into())
            };
        };
        let external = PaymentProcessor::External(target.processor_type);

        if !split {
            return Ok(RoutingDecision {
                decision: DecisionKind::External,
                processor: external,
                target_connection: Some(target.connection_id.clone()),
                fee_breakdown: self.fees.calculate(amount, &currency, external, rate),
                split: None,
                reason,
            });
        }

        let platform_amount = money::round(amount * self.fees.split_platform_share(), &currency);
        let external_amount = amount - platform_amount;
        let deposit = self
            .fees
            .calculate(platform_amount, &currency, PaymentProcessor::Platform, rate);
        let balance = self.fees.calculate(external_amount, &currency, external, rate);
        Ok(RoutingDecision {
            decision: DecisionKind::Split,
            processor: external,
            target_connection: Some(target.connection_id.clone()),
            fee_breakdown: FeeBreakdown {
                amount,
                processing_fee: deposit.processing_fee + balance.processing_fee,
                commission_rate: deposit.commission_rate,
                commission_fee: deposit.commission_fee + balance.commission_fee,
                net_amount: deposit.net_amount + balance.net_amount,
            },
            split: Some(SplitAmounts {
                platform_amount,
                external_amount,
            }),
            reason,
        })
    }
}

fn hybrid_intent(
    config: &PaymentConfiguration,
    request: &PaymentRequest,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Intent {
    let rules = &config.hybrid_rules;
    match request.client_preference {
        Some(ClientPreference::Platform) => return Intent::Platform(RoutingReason::ClientPreference),
        Some(ClientPreference::External) => return Intent::External(RoutingReason::ClientPreference),
        Some(ClientPreference::Split) => return Intent::Split(RoutingReason::ClientPreference),
        None => {}
    }
    if let Some(minimum) = rules.minimum_external_amount {
        if amount < minimum {
            return Intent::Platform(RoutingReason::BelowMinimumExternalAmount);
        }
    }
    if let Some(service) = &request.service_type {
        if rules.external_service_types.iter().any(|s| s == service) {
            return Intent::External(RoutingReason::ServiceTypeOverride);
        }
    }
    if config.primary_processor.is_none() {
        if let Some(hours) = &rules.business_hours {
            return if within_business_hours(hours, now) {
                Intent::External(RoutingReason::BusinessHours)
            } else {
                Intent::Platform(RoutingReason::OutsideBusinessHours)
            };
        }
    }
    match config.primary_processor {
        Some(_) => Intent::External(RoutingReason::PrimaryProcessor),
        None => Intent::Platform(RoutingReason::HybridDefault),
    }
}

/// `[start_hour, end_hour)` in the configured local offset; a window with
/// `start > end` wraps past midnight.
pub fn within_business_hours(hours: &BusinessHours, now: DateTime<Utc>) -> bool {
    let local = now + Duration::minutes(i64::from(hours.utc_offset_minutes));
    let h = local.hour();
    match hours.start_hour.cmp(&hours.end_hour) {
        std::cmp::Ordering::Less => h >= hours.start_hour && h < hours.end_hour,
        std::cmp::Ordering::Greater => h >= hours.start_hour || h < hours.end_hour,
        std::cmp::Ordering::Equal => false,
    }
}

/// The connected connection on the primary processor, else the oldest one.
fn pick_connection<'c>(
    config: &PaymentConfiguration,
    connections: &'c [ProcessorConnection],
) -> Option<&'c ProcessorConnection> {
    let connected = || connections.iter().filter(|c| c.is_active());
    config
        .primary_processor
        .and_then(|primary| connected().find(|c| c.processor_type == primary))
        .or_else(|| connected().next())
}
