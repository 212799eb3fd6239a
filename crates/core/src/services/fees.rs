//! Fee calculator.
//!
//! Splits a gross voter payment into the processor's fee, the platform's
//! fee and the creator's net earnings. Pure integer arithmetic on cents.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::models::{BPS_SCALE, FeeBreakdown, Gateway, Money};

/// Processor pricing: a percentage plus a fixed amount per payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRate {
    pub percent_bps: u32,
    pub fixed: Money,
}

impl GatewayRate {
    pub const fn new(percent_bps: u32, fixed_cents: i64) -> Self {
        Self {
            percent_bps,
            fixed: Money::from_cents(fixed_cents),
        }
    }

    /// Processor fee on `gross`.
    pub fn fee(&self, gross: Money) -> Money {
        gross.percent_bps(self.percent_bps) + self.fixed
    }
}

/// Configured fee rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    stripe: GatewayRate,
    paddle: GatewayRate,
    sandbox: GatewayRate,
    platform_bps: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            stripe: GatewayRate::new(290, 30),
            paddle: GatewayRate::new(500, 50),
            sandbox: GatewayRate::new(0, 0),
            platform_bps: 500,
        }
    }
}

impl FeeSchedule {
    /// Build a validated schedule.
    ///
    /// Percentages above 100% or negative fixed fees are configuration errors.
    pub fn new(
        stripe: GatewayRate,
        paddle: GatewayRate,
        sandbox: GatewayRate,
        platform_bps: u32,
    ) -> LedgerResult<Self> {
        for (name, rate) in [("stripe", stripe), ("paddle", paddle), ("sandbox", sandbox)] {
            if rate.percent_bps as i64 > BPS_SCALE {
                return Err(LedgerError::Configuration(format!(
                    "{name} fee of {} bps exceeds 100%",
                    rate.percent_bps
                )));
            }
            if rate.fixed.is_negative() {
                return Err(LedgerError::Configuration(format!(
                    "{name} fixed fee is negative"
                )));
            }
        }
        if platform_bps as i64 > BPS_SCALE {
            return Err(LedgerError::Configuration(format!(
                "platform fee of {platform_bps} bps exceeds 100%"
            )));
        }
        Ok(Self {
            stripe,
            paddle,
            sandbox,
            platform_bps,
        })
    }

    pub fn rate(&self, gateway: Gateway) -> GatewayRate {
        match gateway {
            Gateway::Stripe => self.stripe,
            Gateway::Paddle => self.paddle,
            Gateway::Sandbox => self.sandbox,
        }
    }

    pub fn platform_bps(&self) -> u32 {
        self.platform_bps
    }

    /// Fee split of `gross` paid through `gateway` with the given platform fee.
    ///
    /// Fails with [`LedgerError::FeeExceedsGross`] when the fees would leave
    /// a negative net amount.
    pub fn compute_settlement(
        &self,
        gross: Money,
        gateway: Gateway,
        platform_bps: u32,
    ) -> LedgerResult<FeeBreakdown> {
        if !gross.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "gross amount must be positive, got {gross}"
            )));
        }
        let gateway_fee = self.rate(gateway).fee(gross);
        let platform_fee = gross.percent_bps(platform_bps);
        let fees = gateway_fee + platform_fee;
        if fees > gross {
            return Err(LedgerError::FeeExceedsGross { gross, fees });
        }
        Ok(FeeBreakdown {
            gross_amount: gross,
            gateway_fee,
            platform_fee,
            net_amount: gross - fees,
        })
    }

    /// [`Self::compute_settlement`] with the configured platform fee.
    pub fn settle(&self, gross: Money, gateway: Gateway) -> LedgerResult<FeeBreakdown> {
        self.compute_settlement(gross, gateway, self.platform_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: scénario de référence 5.00$ via Stripe
    #[test]
    fn test_five_dollar_stripe_payment() {
        let schedule = FeeSchedule::default();
        let fees = schedule.settle(Money::from_cents(500), Gateway::Stripe).unwrap();

        // 2.9% de 5.00$ = 0.145 -> 0.15, + 0.30 = 0.45
        assert_eq!(fees.gateway_fee, Money::from_cents(45));
        assert_eq!(fees.platform_fee, Money::from_cents(25));
        assert_eq!(fees.net_amount, Money::from_cents(430));
        assert!(fees.is_balanced());
    }

    #[test]
    fn test_breakdown_is_exact_for_every_cent_amount() {
        let schedule = FeeSchedule::default();
        for cents in 100..2_000 {
            for gateway in [Gateway::Stripe, Gateway::Paddle, Gateway::Sandbox] {
                let fees = schedule.settle(Money::from_cents(cents), gateway).unwrap();
                assert!(fees.is_balanced(), "unbalanced at {cents} via {gateway}");
                assert!(!fees.net_amount.is_negative());
            }
        }
    }

    #[test]
    fn test_fees_exceeding_gross_are_rejected() {
        let schedule = FeeSchedule::default();
        // 0.50$ via Paddle: 0.03 + 0.50 + 0.03 > 0.50
        let err = schedule.settle(Money::from_cents(50), Gateway::Paddle).unwrap_err();
        assert!(matches!(err, LedgerError::FeeExceedsGross { .. }));

        let err = schedule.settle(Money::ZERO, Gateway::Stripe).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[test]
    fn test_schedule_validation() {
        let ok = GatewayRate::new(290, 30);
        assert!(FeeSchedule::new(ok, ok, ok, 500).is_ok());
        assert!(matches!(
            FeeSchedule::new(GatewayRate::new(10_001, 0), ok, ok, 500),
            Err(LedgerError::Configuration(_))
        ));
        assert!(matches!(
            FeeSchedule::new(ok, GatewayRate::new(100, -1), ok, 500),
            Err(LedgerError::Configuration(_))
        ));
        assert!(FeeSchedule::new(ok, ok, ok, 20_000).is_err());
    }
}
