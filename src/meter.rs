//! Usage meter
//!
//! The in-memory counter behind `verify` and `consume`. A meter is built
//! from an entitlement plus its persisted `MeterState`, folds deltas
//! according to the aggregation behavior, applies the overage strategy at
//! the limit and hands back a `MeterState` for persistence.
//!
//! Reconciliation corrections enter through [`UsageMeter::apply_reconcile`]
//! only; that path never participates in an allow/deny decision.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregation::AggregationBehavior;
use crate::error::DeniedReason;
use crate::grant::{FeatureType, OverageStrategy};
use crate::grant::resolver::Entitlement;

/// Persistable runtime state of one meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterState {
    pub usage: Decimal,
    /// Usage observed at the last reconciliation
    pub snapshot_usage: Decimal,
    /// Ordered record id cursor; empty string means never initialized
    pub last_reconciled_id: String,
    pub last_updated: i64,
    pub last_cycle_start: Option<i64>,
}

impl MeterState {
    /// Fresh state seeded from an analytics read
    #[must_use]
    pub fn initialized(
        usage: Decimal,
        last_reconciled_id: String,
        now: i64,
        cycle_start: Option<i64>,
    ) -> Self {
        Self {
            usage,
            snapshot_usage: usage,
            last_reconciled_id,
            last_updated: now,
            last_cycle_start: cycle_start,
        }
    }

    /// Zeroed state for meters that have never touched analytics
    #[must_use]
    pub fn empty(now: i64) -> Self {
        Self {
            usage: Decimal::ZERO,
            snapshot_usage: Decimal::ZERO,
            last_reconciled_id: String::new(),
            last_updated: now,
            last_cycle_start: None,
        }
    }
}

/// Outcome of a verify or consume call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterDecision {
    pub allowed: bool,
    pub usage: Decimal,
    pub limit: Option<Decimal>,
    pub remaining: Option<Decimal>,
    pub denied_reason: Option<DeniedReason>,
    pub message: Option<String>,
    pub over_threshold: bool,
}

impl MeterDecision {
    fn deny(usage: Decimal, limit: Option<Decimal>, reason: DeniedReason, message: &str) -> Self {
        Self {
            allowed: false,
            usage,
            limit,
            remaining: limit.map(|l| l - usage),
            denied_reason: Some(reason),
            message: Some(message.to_string()),
            over_threshold: false,
        }
    }
}

/// In-memory counter for one entitlement
#[derive(Debug, Clone)]
pub struct UsageMeter {
    behavior: AggregationBehavior,
    counts_events: bool,
    feature_type: FeatureType,
    limit: Option<Decimal>,
    overage: OverageStrategy,
    /// Percent of the limit that flips `over_threshold`
    threshold: u8,
    effective_at: i64,
    expires_at: Option<i64>,
    state: MeterState,
}

impl UsageMeter {
    /// Build a meter from an entitlement and its persisted state
    #[must_use]
    pub fn new(entitlement: &Entitlement, state: MeterState, default_threshold: u8) -> Self {
        Self {
            behavior: entitlement.aggregation_method.config().behavior,
            counts_events: entitlement.aggregation_method.is_count(),
            feature_type: entitlement.feature_type,
            limit: entitlement.limit,
            overage: entitlement.metadata.overage_strategy,
            threshold: entitlement
                .metadata
                .notify_usage_threshold
                .unwrap_or(default_threshold),
            effective_at: entitlement.effective_at,
            expires_at: entitlement.expires_at,
            state,
        }
    }

    /// Check whether `proposed` units would be allowed at `now` without
    /// folding them into the counter
    #[must_use]
    pub fn verify(&self, now: i64, proposed: Option<Decimal>) -> MeterDecision {
        let delta = self.effective_delta(proposed.unwrap_or(Decimal::ONE));
        self.decide(now, delta)
    }

    /// Fold `delta` units into the counter at `now`; the state mutates
    /// only when the decision allows it
    pub fn consume(&mut self, delta: Decimal, now: i64) -> MeterDecision {
        let delta = self.effective_delta(delta);
        let decision = self.decide(now, delta);
        if decision.allowed && self.feature_type != FeatureType::Flat {
            self.state.usage = decision.usage;
            self.state.last_updated = now;
        }
        decision
    }

    /// Reconciliation write path: record the settled aggregate and advance
    /// the cursor atomically. `adopt_usage` replaces the live counter with
    /// the settled value; the snapshot and cursor move either way.
    pub fn apply_reconcile(
        &mut self,
        settled_usage: Decimal,
        adopt_usage: bool,
        last_record_id: String,
        now: i64,
    ) {
        if adopt_usage {
            self.state.usage = settled_usage;
        }
        self.state.snapshot_usage = settled_usage;
        self.state.last_reconciled_id = last_record_id;
        self.state.last_updated = now;
    }

    /// Snapshot for persistence
    #[must_use]
    pub fn to_persist(&self) -> MeterState {
        self.state.clone()
    }

    #[must_use]
    pub const fn state(&self) -> &MeterState {
        &self.state
    }

    /// Count methods meter one unit per event regardless of the payload
    fn effective_delta(&self, delta: Decimal) -> Decimal {
        if self.counts_events {
            Decimal::ONE
        } else {
            delta
        }
    }

    fn decide(&self, now: i64, delta: Decimal) -> MeterDecision {
        if self.feature_type == FeatureType::Flat || self.behavior == AggregationBehavior::None {
            return self.decide_flat(now);
        }

        let usage = self.state.usage;
        let new_usage = match self.behavior {
            AggregationBehavior::Sum => usage + delta,
            AggregationBehavior::Max => usage.max(delta),
            AggregationBehavior::Last => delta,
            AggregationBehavior::None => usage,
        };

        let Some(limit) = self.limit else {
            // unlimited: always allowed, no remaining to report
            return MeterDecision {
                allowed: true,
                usage: new_usage,
                limit: None,
                remaining: None,
                denied_reason: None,
                message: None,
                over_threshold: false,
            };
        };

        let over_threshold = self.crossed_threshold(new_usage, limit);
        if new_usage <= limit {
            return MeterDecision {
                allowed: true,
                usage: new_usage,
                limit: Some(limit),
                remaining: Some(limit - new_usage),
                denied_reason: None,
                message: None,
                over_threshold,
            };
        }

        match self.overage {
            OverageStrategy::None => MeterDecision::deny(
                usage,
                Some(limit),
                DeniedReason::LimitExceeded,
                "usage limit exceeded",
            ),
            OverageStrategy::LastCall => {
                if usage < limit {
                    // the crossing transaction is allowed; the next is not
                    MeterDecision {
                        allowed: true,
                        usage: new_usage,
                        limit: Some(limit),
                        remaining: Some(limit - new_usage),
                        denied_reason: None,
                        message: None,
                        over_threshold,
                    }
                } else {
                    MeterDecision::deny(
                        usage,
                        Some(limit),
                        DeniedReason::LimitExceeded,
                        "usage limit exceeded",
                    )
                }
            }
            OverageStrategy::Always => MeterDecision {
                allowed: true,
                usage: new_usage,
                limit: Some(limit),
                remaining: Some(limit - new_usage),
                denied_reason: None,
                message: None,
                over_threshold,
            },
        }
    }

    /// Flat features gate on a positive limit within the active window
    fn decide_flat(&self, now: i64) -> MeterDecision {
        let in_window =
            now >= self.effective_at && self.expires_at.map_or(true, |e| now < e);
        let enabled = self.limit.map_or(false, |l| l > Decimal::ZERO);
        if in_window && enabled {
            MeterDecision {
                allowed: true,
                usage: self.state.usage,
                limit: self.limit,
                remaining: self.limit,
                denied_reason: None,
                message: None,
                over_threshold: false,
            }
        } else if !in_window {
            MeterDecision::deny(
                self.state.usage,
                self.limit,
                DeniedReason::NotActive,
                "feature is outside its active window",
            )
        } else {
            MeterDecision::deny(
                self.state.usage,
                self.limit,
                DeniedReason::FeatureDisabled,
                "feature is not enabled",
            )
        }
    }

    fn crossed_threshold(&self, new_usage: Decimal, limit: Decimal) -> bool {
        if limit <= Decimal::ZERO {
            return false;
        }
        new_usage * Decimal::from(100) >= limit * Decimal::from(self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationMethod;
    use crate::cycle::{BillingInterval, CycleConfig};
    use crate::grant::resolver::MergingPolicy;
    use crate::grant::FeatureMetadata;
    use crate::pricing::{PricingConfig, UsageMode};

    fn entitlement(
        method: AggregationMethod,
        feature_type: FeatureType,
        limit: Option<i64>,
        overage: OverageStrategy,
    ) -> Entitlement {
        Entitlement {
            id: "e1".to_string(),
            project_id: "proj".to_string(),
            customer_id: "cust".to_string(),
            feature_slug: "api_calls".to_string(),
            feature_type,
            usage_mode: UsageMode::Unit,
            aggregation_method: method,
            merging_policy: MergingPolicy::Sum,
            limit: limit.map(Decimal::from),
            reset: CycleConfig::recurring("monthly", BillingInterval::Month, 1),
            anchor: 0,
            grants: vec![],
            version: "v".to_string(),
            effective_at: 0,
            expires_at: Some(1_000_000),
            next_revalidate_at: 0,
            computed_at: 0,
            updated_at: 0,
            metadata: FeatureMetadata {
                overage_strategy: overage,
                ..FeatureMetadata::default()
            },
            pricing: PricingConfig::default(),
        }
    }

    fn meter(
        method: AggregationMethod,
        feature_type: FeatureType,
        limit: Option<i64>,
        overage: OverageStrategy,
    ) -> UsageMeter {
        UsageMeter::new(
            &entitlement(method, feature_type, limit, overage),
            MeterState::empty(0),
            95,
        )
    }

    #[test]
    fn test_sum_under_limit() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        assert!(m.consume(Decimal::from(10), 1).allowed);
        assert!(m.consume(Decimal::from(5), 2).allowed);

        let check = m.verify(3, Some(Decimal::ZERO));
        assert!(check.allowed);
        assert_eq!(check.usage, Decimal::from(15));
        assert_eq!(check.remaining, Some(Decimal::from(85)));
    }

    #[test]
    fn test_verify_does_not_mutate() {
        let m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        let _ = m.verify(1, Some(Decimal::from(50)));
        assert_eq!(m.state().usage, Decimal::ZERO);
    }

    #[test]
    fn test_overage_none_denies_crossing() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(10),
            OverageStrategy::None,
        );
        assert!(m.consume(Decimal::from(7), 1).allowed);

        let denied = m.consume(Decimal::from(5), 2);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_reason, Some(DeniedReason::LimitExceeded));
        assert_eq!(denied.usage, Decimal::from(7));
        assert_eq!(m.state().usage, Decimal::from(7));
    }

    #[test]
    fn test_last_call_allows_crossing_once() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(10),
            OverageStrategy::LastCall,
        );
        assert!(m.consume(Decimal::from(6), 1).allowed);
        // crossing transaction is allowed
        assert!(m.consume(Decimal::from(6), 2).allowed);
        // but the next one is not
        let denied = m.consume(Decimal::ONE, 3);
        assert!(!denied.allowed);
        assert_eq!(m.state().usage, Decimal::from(12));
    }

    #[test]
    fn test_always_allows_and_flags_threshold() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::Always,
        );
        let ok = m.consume(Decimal::from(90), 1);
        assert!(ok.allowed);
        assert!(!ok.over_threshold);

        let over = m.consume(Decimal::from(10), 2);
        assert!(over.allowed);
        assert!(over.over_threshold);

        let way_over = m.consume(Decimal::from(100), 3);
        assert!(way_over.allowed);
        assert_eq!(way_over.usage, Decimal::from(200));
    }

    #[test]
    fn test_max_behavior() {
        let mut m = meter(
            AggregationMethod::Max,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        assert_eq!(m.consume(Decimal::from(40), 1).usage, Decimal::from(40));
        assert_eq!(m.consume(Decimal::from(20), 2).usage, Decimal::from(40));
        assert_eq!(m.consume(Decimal::from(70), 3).usage, Decimal::from(70));
    }

    #[test]
    fn test_last_behavior() {
        let mut m = meter(
            AggregationMethod::LastDuringPeriod,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        assert_eq!(m.consume(Decimal::from(40), 1).usage, Decimal::from(40));
        assert_eq!(m.consume(Decimal::from(20), 2).usage, Decimal::from(20));
    }

    #[test]
    fn test_count_meters_one_per_event() {
        let mut m = meter(
            AggregationMethod::Count,
            FeatureType::Usage,
            Some(10),
            OverageStrategy::None,
        );
        assert_eq!(m.consume(Decimal::from(500), 1).usage, Decimal::ONE);
        assert_eq!(m.consume(Decimal::from(500), 2).usage, Decimal::from(2));
    }

    #[test]
    fn test_flat_gates_on_limit_and_window() {
        let mut m = meter(
            AggregationMethod::None,
            FeatureType::Flat,
            Some(1),
            OverageStrategy::None,
        );
        assert!(m.verify(5, None).allowed);
        // flat never consumes
        let decision = m.consume(Decimal::from(100), 5);
        assert!(decision.allowed);
        assert_eq!(m.state().usage, Decimal::ZERO);

        // outside the window
        let out = m.verify(2_000_000, None);
        assert!(!out.allowed);
        assert_eq!(out.denied_reason, Some(DeniedReason::NotActive));

        let disabled = meter(
            AggregationMethod::None,
            FeatureType::Flat,
            Some(0),
            OverageStrategy::None,
        );
        let denied = disabled.verify(5, None);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_reason, Some(DeniedReason::FeatureDisabled));
    }

    #[test]
    fn test_unlimited_meter() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            None,
            OverageStrategy::None,
        );
        let d = m.consume(Decimal::from(1_000_000), 1);
        assert!(d.allowed);
        assert_eq!(d.remaining, None);
    }

    #[test]
    fn test_refund_restores_headroom() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(10),
            OverageStrategy::None,
        );
        assert!(m.consume(Decimal::from(9), 1).allowed);
        let refund = m.consume(Decimal::from(-5), 2);
        assert!(refund.allowed);
        assert_eq!(refund.usage, Decimal::from(4));
        assert_eq!(refund.remaining, Some(Decimal::from(6)));
    }

    #[test]
    fn test_apply_reconcile_sets_snapshot_and_cursor() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        m.consume(Decimal::from(10), 1);
        m.apply_reconcile(Decimal::from(13), true, "01ARZ".to_string(), 5);

        let state = m.to_persist();
        assert_eq!(state.usage, Decimal::from(13));
        assert_eq!(state.snapshot_usage, Decimal::from(13));
        assert_eq!(state.last_reconciled_id, "01ARZ");
    }

    #[test]
    fn test_apply_reconcile_can_leave_counter_alone() {
        let mut m = meter(
            AggregationMethod::Sum,
            FeatureType::Usage,
            Some(100),
            OverageStrategy::None,
        );
        m.consume(Decimal::from(10), 1);
        m.apply_reconcile(Decimal::from(10), false, "01ARZ".to_string(), 5);

        let state = m.to_persist();
        assert_eq!(state.usage, Decimal::from(10));
        assert_eq!(state.snapshot_usage, Decimal::from(10));
        assert_eq!(state.last_reconciled_id, "01ARZ");
    }
}
