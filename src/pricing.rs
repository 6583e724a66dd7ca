//! Pricing waterfall
//!
//! Computes the monetary cost of a metered quantity from the winning
//! grant's pricing configuration. Usage records embed the cost *delta*
//! between the meter before and after the report, so the waterfall only
//! ever prices absolute quantities.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the pricing configuration is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    Tier,
    Unit,
    Package,
}

/// One tier of a graduated price. `up_to = None` marks the open-ended
/// final tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<Decimal>,
    pub unit_price: Decimal,
    pub flat_price: Decimal,
}

/// Package pricing: blocks of units sold as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePricing {
    pub units_per_package: Decimal,
    pub price_per_package: Decimal,
}

/// Pricing configuration carried by a feature plan version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PricingConfig {
    pub currency: String,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub package: Option<PackagePricing>,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

/// Price `quantity` units under the given mode
///
/// Quantities at or below zero price to zero; refunds are handled by the
/// caller as a cost delta between two absolute quantities.
#[must_use]
pub fn compute_cost(pricing: &PricingConfig, mode: UsageMode, quantity: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match mode {
        UsageMode::Tier => tiered_cost(&pricing.tiers, quantity),
        UsageMode::Package => pricing.package.as_ref().map_or(Decimal::ZERO, |p| {
            if p.units_per_package <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            let packages = (quantity / p.units_per_package).ceil();
            packages * p.price_per_package
        }),
        UsageMode::Unit => quantity * pricing.unit_price.unwrap_or(Decimal::ZERO),
    }
}

/// Unit price of the tier the quantity lands in (the "last tier" rate
/// embedded in usage-record metadata)
#[must_use]
pub fn unit_rate(pricing: &PricingConfig, mode: UsageMode, quantity: Decimal) -> Decimal {
    match mode {
        UsageMode::Tier => {
            let mut rate = Decimal::ZERO;
            for tier in &pricing.tiers {
                rate = tier.unit_price;
                match tier.up_to {
                    Some(bound) if quantity > bound => {}
                    _ => break,
                }
            }
            rate
        }
        UsageMode::Package => pricing.package.as_ref().map_or(Decimal::ZERO, |p| {
            if p.units_per_package <= Decimal::ZERO {
                Decimal::ZERO
            } else {
                p.price_per_package / p.units_per_package
            }
        }),
        UsageMode::Unit => pricing.unit_price.unwrap_or(Decimal::ZERO),
    }
}

/// Graduated tier walk: each tier charges its flat price plus the units
/// that fall inside it.
fn tiered_cost(tiers: &[PriceTier], quantity: Decimal) -> Decimal {
    let mut cost = Decimal::ZERO;
    let mut covered = Decimal::ZERO;
    for tier in tiers {
        if covered >= quantity {
            break;
        }
        let tier_top = tier.up_to.unwrap_or(quantity).min(quantity);
        let units = tier_top - covered;
        if units <= Decimal::ZERO {
            continue;
        }
        cost += tier.flat_price + units * tier.unit_price;
        covered = tier_top;
    }
    cost
}
