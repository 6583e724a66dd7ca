//! Reconciliation
//!
//! Aligns a meter's live counter with the settled analytics store. Runs
//! in the background after verify/report traffic, at most once per
//! watermark: the cursor comparison in step one makes repeat runs
//! no-ops. Corrections outside the drift bound are refused and logged,
//! never applied.

use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::aggregation::AggregationBehavior;
use crate::analytics::{boundary_id, Analytics, FeatureRef, UsageCursorQuery};
use crate::cache::with_retries;
use crate::config::CoreConfig;
use crate::context::RequestContext;
use crate::grant::FeatureType;
use crate::meter::UsageMeter;
use crate::storage::EntitlementStorage;
use crate::Result;

/// Why a reconcile pass did or did not change the meter
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Meter unchanged; nothing to align
    Skipped(SkipReason),
    /// Cursor advanced; drift within tolerance left the counter alone
    CursorAdvanced,
    /// Settled aggregate adopted, correcting drift
    Corrected { drift: Decimal },
    /// Drift exceeded the bound; meter untouched, error logged
    Rejected { drift: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Flat features and non-sum behaviors never reconcile
    NotSummable,
    /// The watermark and current cycle windows differ; the cycle reset
    /// path owns the transition
    CycleBoundary,
    /// The cursor already covers the watermark
    AlreadyReconciled,
    /// The cycle started after the watermark
    CycleTooFresh,
    /// The meter has never been initialized from analytics
    NeverInitialized,
    /// No state exists for the key
    StateMissing,
}

/// Background drift-correction protocol over one entitlement
#[derive(Clone)]
pub struct Reconciler {
    analytics: Arc<dyn Analytics>,
    storage: EntitlementStorage,
    config: CoreConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(analytics: Arc<dyn Analytics>, storage: EntitlementStorage, config: CoreConfig) -> Self {
        Self {
            analytics,
            storage,
            config,
        }
    }

    /// Run one reconcile pass for the entitlement stored under `key`
    ///
    /// # Errors
    ///
    /// Returns error when storage or analytics fail past their retries
    pub async fn run(&self, ctx: &RequestContext, key: &str, now: i64) -> Result<ReconcileOutcome> {
        let Some(state) = self.storage.get(key)? else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::StateMissing));
        };
        let entitlement = &state.entitlement;

        if entitlement.feature_type == FeatureType::Flat
            || entitlement.aggregation_method.config().behavior != AggregationBehavior::Sum
        {
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotSummable));
        }

        let watermark = now - self.config.watermark_delay_ms;
        let watermark_cycle = entitlement.cycle_at(watermark);
        let current_cycle = entitlement.cycle_at(now);
        let (Some(watermark_cycle), Some(current_cycle)) = (watermark_cycle, current_cycle) else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::CycleBoundary));
        };
        if watermark_cycle.start != current_cycle.start {
            return Ok(ReconcileOutcome::Skipped(SkipReason::CycleBoundary));
        }

        let effective_at = watermark_cycle.start;
        let Some(meter_state) = &state.meter else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::NeverInitialized));
        };
        let last_reconciled_id = meter_state.last_reconciled_id.clone();
        let before_record_id = boundary_id(watermark);

        if last_reconciled_id.is_empty() {
            tracing::warn!(
                request = %ctx.request_id,
                customer = %ctx.customer_id,
                feature = %entitlement.feature_slug,
                "meter was never initialized from analytics, skipping reconcile"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::NeverInitialized));
        }
        if last_reconciled_id >= before_record_id {
            return Ok(ReconcileOutcome::Skipped(SkipReason::AlreadyReconciled));
        }
        if watermark < effective_at {
            return Ok(ReconcileOutcome::Skipped(SkipReason::CycleTooFresh));
        }

        // settled delta since the cursor, alongside a state refetch that
        // picks up meter writes landing while we were queued
        let query = UsageCursorQuery {
            customer_id: entitlement.customer_id.clone(),
            project_id: entitlement.project_id.clone(),
            feature: FeatureRef {
                feature_slug: entitlement.feature_slug.clone(),
                aggregation_method: entitlement.aggregation_method,
                feature_type: entitlement.feature_type,
            },
            after_record_id: last_reconciled_id.clone(),
            before_record_id: before_record_id.clone(),
            start_at: effective_at,
        };
        let analytics = self.analytics.clone();
        let cursor_call = with_retries(
            "analytics.features_usage_cursor",
            self.config.retry_attempts,
            std::time::Duration::from_millis(self.config.retry_base_delay_ms),
            || {
                let analytics = analytics.clone();
                let query = query.clone();
                async move { analytics.features_usage_cursor(query).await }
            },
        );
        let (cursor, refetched) = tokio::join!(cursor_call, async { self.storage.get(key) });
        let cursor = cursor?;
        let Some(mut state) = refetched? else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::StateMissing));
        };
        let Some(meter_state) = state.meter.clone() else {
            return Ok(ReconcileOutcome::Skipped(SkipReason::NeverInitialized));
        };

        let settled_delta = cursor.usage;
        let metered_delta = meter_state.usage - meter_state.snapshot_usage;
        let drift = settled_delta - metered_delta;

        let max_drift = Decimal::from(self.config.max_drift);
        if drift.abs() > max_drift {
            tracing::error!(
                request = %ctx.request_id,
                customer = %ctx.customer_id,
                feature = %state.entitlement.feature_slug,
                drift = %drift,
                max_drift = %max_drift,
                "drift exceeds bound, refusing correction"
            );
            return Ok(ReconcileOutcome::Rejected { drift });
        }

        // empty string means analytics saw no records; the boundary id
        // still advances the cursor past the watermark
        let next_cursor = if cursor.last_record_id.is_empty() {
            before_record_id
        } else {
            cursor.last_record_id
        };

        let settled_usage = meter_state.snapshot_usage + settled_delta;
        let epsilon = Decimal::from_f64(self.config.drift_epsilon).unwrap_or(Decimal::ZERO);
        let adopt = drift.abs() > epsilon;

        let mut meter = UsageMeter::new(
            &state.entitlement,
            meter_state,
            self.config.notify_usage_threshold,
        );
        meter.apply_reconcile(settled_usage, adopt, next_cursor, now);
        state.meter = Some(meter.to_persist());
        self.storage.set(&state)?;

        if adopt {
            tracing::info!(
                request = %ctx.request_id,
                customer = %ctx.customer_id,
                feature = %state.entitlement.feature_slug,
                drift = %drift,
                settled = %settled_usage,
                "absorbed out-of-band usage"
            );
            Ok(ReconcileOutcome::Corrected { drift })
        } else {
            Ok(ReconcileOutcome::CursorAdvanced)
        }
    }

    /// Run in a detached task, swallowing faults into structured logs
    pub fn spawn(&self, ctx: RequestContext, key: String, now: i64) {
        let reconciler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.run(&ctx, &key, now).await {
                tracing::warn!(
                    request = %ctx.request_id,
                    key = %key,
                    error = %e,
                    "background reconcile failed"
                );
            }
        });
    }
}
