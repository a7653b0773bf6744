//! Fee calculator — processing fee and platform commission for an amount.
//!
//! INVARIANT: `net_amount + processing_fee + commission_fee == amount`.
//! Both fees are rounded to the currency's minor unit and the net is the
//! exact remainder, so conservation holds to the cent.
//!
//! Bad fee configuration never blocks a payment: a missing or invalid
//! schedule logs a `FeeCalculationError` and the default schedule is used.

use crate::{
    config::{FeeConfig, FeeSchedule},
    error::FeeCalculationError,
    money,
    types::PaymentProcessor,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub amount:          Decimal,
    pub processing_fee:  Decimal,
    pub commission_rate: Decimal,
    pub commission_fee:  Decimal,
    pub net_amount:      Decimal,
}

#[derive(Debug, Clone)]
pub struct FeeCalculator {
    config: FeeConfig,
}

impl FeeCalculator {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    /// Platform default commission rate.
    pub fn default_commission_rate(&self) -> Decimal {
        self.config.default_commission_rate
    }

    pub fn split_platform_share(&self) -> Decimal {
        self.config.split_platform_share
    }

    /// Resolve the commission rate a barber pays: their override if valid,
    /// else the platform default.
    pub fn effective_commission_rate(&self, override_rate: Option<Decimal>) -> Decimal {
        match override_rate {
            Some(rate) if valid_rate(rate) => rate,
            Some(rate) => {
                log::warn!(
                    "fees: {}; using default {}",
                    FeeCalculationError::InvalidCommissionRate(rate),
                    self.config.default_commission_rate
                );
                self.config.default_commission_rate
            }
            None => self.config.default_commission_rate,
        }
    }

    /// Compute the breakdown for `amount` executed by `processor`.
    pub fn calculate(
        &self,
        amount: Decimal,
        currency: &str,
        processor: PaymentProcessor,
        commission_rate: Decimal,
    ) -> FeeBreakdown {
        let schedule = self.schedule_for(processor);
        let commission_rate = if valid_rate(commission_rate) {
            commission_rate
        } else {
            log::warn!(
                "fees: {}; using default {}",
                FeeCalculationError::InvalidCommissionRate(commission_rate),
                self.config.default_commission_rate
            );
            self.config.default_commission_rate
        };

        let processing_fee = money::round(amount * schedule.percentage + schedule.fixed, currency)
            .min(amount)
            .max(Decimal::ZERO);
        let commission_fee = self.commission_amount(amount, currency, commission_rate);
        let net_amount = amount - processing_fee - commission_fee;

        FeeBreakdown {
            amount,
            processing_fee,
            commission_rate,
            commission_fee,
            net_amount,
        }
    }

    /// Commission owed on `amount` at `rate`, rounded to the currency's minor unit.
    pub fn commission_amount(&self, amount: Decimal, currency: &str, rate: Decimal) -> Decimal {
        money::round(amount * rate, currency)
    }

    fn schedule_for(&self, processor: PaymentProcessor) -> FeeSchedule {
        let key = processor.fee_key();
        match self.lookup(key) {
            Ok(schedule) => schedule,
            Err(e) => {
                log::warn!("fees: {e}; falling back to default processing rates");
                self.config.default_processing
            }
        }
    }

    fn lookup(&self, key: &str) -> Result<FeeSchedule, FeeCalculationError> {
        let schedule = self
            .config
            .processors
            .get(key)
            .copied()
            .ok_or_else(|| FeeCalculationError::MissingSchedule(key.to_string()))?;
        if schedule.percentage.is_sign_negative() || schedule.percentage >= Decimal::ONE {
            return Err(FeeCalculationError::InvalidSchedule {
                key: key.to_string(),
                detail: format!("percentage {} outside [0, 1)", schedule.percentage),
            });
        }
        if schedule.fixed.is_sign_negative() {
            return Err(FeeCalculationError::InvalidSchedule {
                key: key.to_string(),
                detail: format!("negative fixed fee {}", schedule.fixed),
            });
        }
        Ok(schedule)
    }
}

fn valid_rate(rate: Decimal) -> bool {
    !rate.is_sign_negative() && rate < Decimal::ONE
}
