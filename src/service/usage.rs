//! Current-usage summary
//!
//! Human-facing rollup of every metered feature for one customer. Hot
//! features (meters that have touched analytics) report their live
//! counter; idle ones fall back to billing-period aggregates pulled in
//! one batch.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::analytics::BillingUsageQuery;
use crate::cache::with_retries;
use crate::context::RequestContext;
use crate::grant::{FeatureType, GrantType};
use crate::pricing::{compute_cost, UsageMode};
use crate::Result;

use super::EntitlementService;

/// One feature's usage line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsageSummary {
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub usage: Decimal,
    pub limit: Option<Decimal>,
    pub remaining: Option<Decimal>,
    pub cost: Decimal,
    /// True when the line reflects the live meter rather than an
    /// analytics estimate
    pub live: bool,
}

/// Features grouped by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsageGroup {
    pub name: String,
    pub features: Vec<FeatureUsageSummary>,
}

/// Cost rollup across pricing shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriceSummary {
    pub total_price: Decimal,
    pub flat_total: Decimal,
    pub tiered_total: Decimal,
    pub package_total: Decimal,
    pub usage_total: Decimal,
}

/// The customer-facing usage summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub plan_name: String,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    pub renewal_date: Option<i64>,
    pub days_remaining: Option<i64>,
    pub currency: String,
    pub groups: Vec<FeatureUsageGroup>,
    pub price_summary: PriceSummary,
}

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

impl EntitlementService {
    /// Assemble the usage summary for one customer, served stale-while-
    /// revalidate from its namespace
    ///
    /// # Errors
    ///
    /// Returns error when storage or analytics fail past their retries
    pub async fn get_current_usage(&self, ctx: &RequestContext) -> Result<CurrentUsage> {
        let customer_key = format!("{}:{}", ctx.project_id, ctx.customer_id);
        let service = self.clone();
        let loader_ctx = ctx.clone();
        let summary = self
            .cache
            .current_usage
            .swr(&customer_key, ctx.now, move || async move {
                service.compute_current_usage(&loader_ctx).await.map(Some)
            })
            .await?;
        match summary {
            Some(summary) => Ok(summary),
            None => self.compute_current_usage(ctx).await,
        }
    }

    async fn compute_current_usage(&self, ctx: &RequestContext) -> Result<CurrentUsage> {
        let now = ctx.now;

        let states = self
            .storage
            .list_for_customer(&ctx.project_id, &ctx.customer_id)?;

        // billing period and plan name come from the subscription grant
        let mut plan_name = "custom".to_string();
        let mut period = None;
        for state in &states {
            if state
                .entitlement
                .grants
                .iter()
                .any(|g| g.grant_type == GrantType::Subscription)
            {
                plan_name = state.entitlement.reset.name.clone();
                period = state.entitlement.cycle_at(now);
                break;
            }
        }
        if period.is_none() {
            period = states.first().and_then(|s| s.entitlement.cycle_at(now));
        }

        // idle features (never reconciled) estimate from analytics
        let idle_slugs: Vec<String> = states
            .iter()
            .filter(|s| {
                s.meter
                    .as_ref()
                    .map_or(true, |m| m.last_reconciled_id.is_empty())
            })
            .map(|s| s.entitlement.feature_slug.clone())
            .collect();

        let mut estimates = std::collections::HashMap::new();
        if let (Some(window), false) = (period, idle_slugs.is_empty()) {
            let query = BillingUsageQuery {
                customer_id: ctx.customer_id.clone(),
                project_id: ctx.project_id.clone(),
                feature_slugs: idle_slugs,
                start: window.start,
                end: window.end.min(now),
            };
            let analytics = self.analytics.clone();
            let rows = with_retries(
                "analytics.billing_usage",
                self.config.retry_attempts,
                std::time::Duration::from_millis(self.config.retry_base_delay_ms),
                || {
                    let analytics = analytics.clone();
                    let query = query.clone();
                    async move { analytics.billing_usage(query).await }
                },
            )
            .await?;
            for row in rows {
                estimates.insert(row.feature_slug.clone(), row);
            }
        }

        let mut currency = String::new();
        let mut price_summary = PriceSummary::default();
        let mut groups: std::collections::BTreeMap<&'static str, Vec<FeatureUsageSummary>> =
            std::collections::BTreeMap::new();

        for state in &states {
            let entitlement = &state.entitlement;
            if entitlement.metadata.hidden {
                continue;
            }

            let live = state
                .meter
                .as_ref()
                .map_or(false, |m| !m.last_reconciled_id.is_empty());
            let usage = if live {
                state.meter.as_ref().map_or(Decimal::ZERO, |m| m.usage)
            } else {
                estimates
                    .get(&entitlement.feature_slug)
                    .map_or(Decimal::ZERO, |row| {
                        row.value_for(entitlement.aggregation_method)
                    })
            };

            let cost = match entitlement.feature_type {
                // flat features price their gate, not their usage
                FeatureType::Flat => {
                    compute_cost(&entitlement.pricing, UsageMode::Unit, Decimal::ONE)
                }
                _ => compute_cost(&entitlement.pricing, entitlement.usage_mode, usage),
            };

            if currency.is_empty() && !entitlement.pricing.currency.is_empty() {
                currency = entitlement.pricing.currency.clone();
            }

            let (group, bucket) = match entitlement.feature_type {
                FeatureType::Flat => ("flat", &mut price_summary.flat_total),
                FeatureType::Tier => ("tiered", &mut price_summary.tiered_total),
                FeatureType::Package => ("package", &mut price_summary.package_total),
                FeatureType::Usage => ("usage", &mut price_summary.usage_total),
            };
            *bucket += cost;
            price_summary.total_price += cost;

            groups.entry(group).or_default().push(FeatureUsageSummary {
                feature_slug: entitlement.feature_slug.clone(),
                feature_type: entitlement.feature_type,
                usage,
                limit: entitlement.limit,
                remaining: entitlement.limit.map(|l| l - usage),
                cost,
                live,
            });
        }

        Ok(CurrentUsage {
            plan_name,
            period_start: period.map(|w| w.start),
            period_end: period.map(|w| w.end),
            renewal_date: period.map(|w| w.end),
            days_remaining: period.map(|w| ((w.end - now).max(0)) / MS_PER_DAY),
            currency,
            groups: groups
                .into_iter()
                .map(|(name, features)| FeatureUsageGroup {
                    name: name.to_string(),
                    features,
                })
                .collect(),
            price_summary,
        })
    }
}
