//! Entitlement service
//!
//! The orchestrator behind every actor call: answers `verify` and
//! `report_usage`, keeps entitlement state revalidated against the grant
//! store, seeds meters from analytics, maintains the access-control
//! triple and schedules background reconciliation.

pub mod usage;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::analytics::{
    boundary_id, record_id, Analytics, FeatureRef, UsageCursorQuery, UsageRecord,
    UsageRecordMetadata, Verification, VerificationMetadata,
};
use crate::cache::{with_retries, CacheLayer};
use crate::config::CoreConfig;
use crate::context::RequestContext;
use crate::error::DeniedReason;
use crate::grant::resolver::{self, Entitlement, MinimalEntitlement};
use crate::grant::{FeatureType, Grant, GrantStore, Subject, SubjectKind};
use crate::meter::{MeterDecision, MeterState, UsageMeter};
use crate::pricing::{compute_cost, unit_rate};
use crate::reconcile::Reconciler;
use crate::storage::{make_key, EntitlementState, EntitlementStorage};
use crate::{Error, Result};

/// Customer-level access flags derived from entitlement state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    pub usage_limit_reached: bool,
    pub disabled: bool,
    pub subscription_status: String,
}

impl Default for AccessControlList {
    fn default() -> Self {
        Self {
            usage_limit_reached: false,
            disabled: false,
            subscription_status: "none".to_string(),
        }
    }
}

/// Hook invoked whenever the access-control triple changes
pub type AclListener = Arc<dyn Fn(&RequestContext, &AccessControlList) + Send + Sync>;

/// Verify request arriving from the edge
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub feature_slug: String,
    pub timestamp: i64,
    /// Units the caller is about to spend; defaults to 1
    pub usage: Option<Decimal>,
    pub idempotence_key: Option<String>,
}

/// Verify decision returned to the edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub allowed: bool,
    pub message: String,
    pub denied_reason: Option<DeniedReason>,
    pub usage: Decimal,
    pub limit: Option<Decimal>,
    pub remaining: Option<Decimal>,
    /// Milliseconds from edge ingress to decision
    pub latency: f64,
    pub feature_type: Option<FeatureType>,
}

impl VerifyResult {
    fn denied(reason: DeniedReason, message: &str, latency: f64) -> Self {
        Self {
            allowed: false,
            message: message.to_string(),
            denied_reason: Some(reason),
            usage: Decimal::ZERO,
            limit: None,
            remaining: None,
            latency,
            feature_type: None,
        }
    }

    fn from_decision(decision: &MeterDecision, feature_type: FeatureType, latency: f64) -> Self {
        Self {
            allowed: decision.allowed,
            message: decision
                .message
                .clone()
                .unwrap_or_else(|| "ok".to_string()),
            denied_reason: decision.denied_reason,
            usage: decision.usage,
            limit: decision.limit,
            remaining: decision.remaining,
            latency,
            feature_type: Some(feature_type),
        }
    }
}

/// Usage report arriving from the edge
#[derive(Debug, Clone)]
pub struct ReportUsageRequest {
    pub feature_slug: String,
    /// Signed delta; refunds are negative
    pub usage: Decimal,
    pub timestamp: i64,
    pub idempotence_key: String,
}

/// Usage report outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportUsageResult {
    pub allowed: bool,
    pub remaining: Option<Decimal>,
    pub message: Option<String>,
    pub denied_reason: Option<DeniedReason>,
    pub usage: Decimal,
    pub limit: Option<Decimal>,
    pub cost: Option<Decimal>,
    pub notified_over_limit: bool,
    /// True when the idempotence key short-circuited the report
    pub already_recorded: bool,
}

impl ReportUsageResult {
    fn denied(reason: DeniedReason, message: &str) -> Self {
        Self {
            allowed: false,
            remaining: None,
            message: Some(message.to_string()),
            denied_reason: Some(reason),
            usage: Decimal::ZERO,
            limit: None,
            cost: None,
            notified_over_limit: false,
            already_recorded: false,
        }
    }
}

/// Orchestrator over the grant store, storage, cache and analytics
#[derive(Clone)]
pub struct EntitlementService {
    config: CoreConfig,
    storage: EntitlementStorage,
    grants: GrantStore,
    analytics: Arc<dyn Analytics>,
    cache: Arc<CacheLayer>,
    reconciler: Reconciler,
    acl_listener: Option<AclListener>,
}

impl EntitlementService {
    #[must_use]
    pub fn new(
        config: CoreConfig,
        storage: EntitlementStorage,
        grants: GrantStore,
        analytics: Arc<dyn Analytics>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        let reconciler = Reconciler::new(analytics.clone(), storage.clone(), config.clone());
        Self {
            config,
            storage,
            grants,
            analytics,
            cache,
            reconciler,
            acl_listener: None,
        }
    }

    /// Install a hook observing access-control changes. Consumers that
    /// would otherwise have to call back into the orchestrator take this
    /// read-only seam instead.
    #[must_use]
    pub fn with_acl_listener(mut self, listener: AclListener) -> Self {
        self.acl_listener = Some(listener);
        self
    }

    #[must_use]
    pub const fn storage(&self) -> &EntitlementStorage {
        &self.storage
    }

    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Answer "is this feature allowed for this customer right now?"
    ///
    /// # Errors
    ///
    /// Returns error on invalid input or when state writes fail; denials
    /// are values, not errors
    pub async fn verify(&self, ctx: &RequestContext, req: VerifyRequest) -> Result<VerifyResult> {
        if req.feature_slug.is_empty() {
            return Err(Error::SchemaInvalid("feature_slug is required".to_string()));
        }
        let now = req.timestamp;
        let ctx = &ctx.with_now(now);

        let Some(mut state) = self.get_state_with_revalidation(ctx, &req.feature_slug).await? else {
            let result = VerifyResult::denied(
                DeniedReason::EntitlementNotFound,
                "no entitlement for feature",
                ctx.latency_ms(now),
            );
            self.append_verification(ctx, &req.feature_slug, now, &result);
            return Ok(result);
        };

        if let Some((reason, message)) = self.validate_state(ctx, &mut state, now).await? {
            let result = VerifyResult::denied(reason, &message, ctx.latency_ms(now));
            self.append_verification(ctx, &req.feature_slug, now, &result);
            return Ok(result);
        }

        self.ensure_meter(ctx, &mut state, now).await?;
        let meter_state = state.meter.clone().unwrap_or_else(|| MeterState::empty(now));
        let meter = UsageMeter::new(
            &state.entitlement,
            meter_state,
            self.config.notify_usage_threshold,
        );
        let decision = meter.verify(now, req.usage);

        state.meter = Some(meter.to_persist());
        self.storage.set(&state)?;

        let result =
            VerifyResult::from_decision(&decision, state.entitlement.feature_type, ctx.latency_ms(now));
        self.append_verification(ctx, &req.feature_slug, now, &result);

        if !decision.allowed
            && decision.denied_reason == Some(DeniedReason::LimitExceeded)
            && state.entitlement.metadata.block_customer
        {
            self.set_usage_limit_reached(ctx, true).await;
        }

        self.reconciler.spawn(ctx.clone(), state.key(), now);
        Ok(result)
    }

    /// Record N units of usage for this feature
    ///
    /// # Errors
    ///
    /// Returns error on invalid input or when the meter cannot be
    /// persisted; denials are values, not errors
    pub async fn report_usage(
        &self,
        ctx: &RequestContext,
        req: ReportUsageRequest,
    ) -> Result<ReportUsageResult> {
        if req.feature_slug.is_empty() {
            return Err(Error::SchemaInvalid("feature_slug is required".to_string()));
        }
        if req.idempotence_key.is_empty() {
            return Err(Error::SchemaInvalid("idempotence_key is required".to_string()));
        }
        let now = req.timestamp;
        let ctx = &ctx.with_now(now);

        let Some(mut state) = self.get_state_with_revalidation(ctx, &req.feature_slug).await? else {
            return Ok(ReportUsageResult::denied(
                DeniedReason::EntitlementNotFound,
                "no entitlement for feature",
            ));
        };
        if let Some((reason, message)) = self.validate_state(ctx, &mut state, now).await? {
            return Ok(ReportUsageResult::denied(reason, &message));
        }
        self.ensure_meter(ctx, &mut state, now).await?;

        let cycle_len = state.entitlement.cycle_at(now).map(|c| c.len_ms());
        let seen = self.storage.has_idempotence_key(
            &ctx.project_id,
            &ctx.customer_id,
            &req.feature_slug,
            &req.idempotence_key,
            now,
            cycle_len,
        )?;

        let meter_state = state.meter.clone().unwrap_or_else(|| MeterState::empty(now));
        let mut meter = UsageMeter::new(
            &state.entitlement,
            meter_state,
            self.config.notify_usage_threshold,
        );

        if seen {
            // replayed request: report the current meter, touch nothing
            let current = meter.verify(now, Some(Decimal::ZERO));
            return Ok(ReportUsageResult {
                allowed: true,
                remaining: current.remaining,
                message: Some("usage already recorded".to_string()),
                denied_reason: None,
                usage: current.usage,
                limit: current.limit,
                cost: None,
                notified_over_limit: false,
                already_recorded: true,
            });
        }

        let usage_before = meter.state().usage;
        let decision = meter.consume(req.usage, now);

        let mut cost = None;
        if decision.allowed {
            let pricing = &state.entitlement.pricing;
            let mode = state.entitlement.usage_mode;
            let cost_before = compute_cost(pricing, mode, usage_before);
            let cost_after = compute_cost(pricing, mode, decision.usage);
            let rate = unit_rate(pricing, mode, decision.usage);
            cost = Some(cost_after - cost_before);

            let record = UsageRecord {
                id: record_id(now),
                customer_id: ctx.customer_id.clone(),
                project_id: ctx.project_id.clone(),
                feature_slug: req.feature_slug.clone(),
                usage: req.usage,
                timestamp: now,
                idempotence_key: req.idempotence_key.clone(),
                request_id: ctx.request_id.clone(),
                created_at: now,
                metadata: UsageRecordMetadata {
                    cost,
                    rate: Some(rate),
                    rate_amount: Some(rate),
                    rate_currency: Some(pricing.currency.clone()),
                },
                deleted: false,
            };
            // the append buffer retries in the flush loop; a failure here
            // never overturns the meter decision
            if let Err(e) = self.storage.insert_usage_record(&record) {
                tracing::warn!(
                    request = %ctx.request_id,
                    feature = %req.feature_slug,
                    error = %e,
                    "usage record append failed, left to flush retry"
                );
            }

            state.meter = Some(meter.to_persist());
            self.storage.set(&state)?;

            // a refund that restores headroom lifts the block
            if req.usage < Decimal::ZERO
                && decision.remaining.map_or(false, |r| r > Decimal::ZERO)
            {
                self.set_usage_limit_reached(ctx, false).await;
            }
        } else if decision.denied_reason == Some(DeniedReason::LimitExceeded)
            && state.entitlement.metadata.block_customer
        {
            self.set_usage_limit_reached(ctx, true).await;
        }

        self.reconciler.spawn(ctx.clone(), state.key(), now);

        Ok(ReportUsageResult {
            allowed: decision.allowed,
            remaining: decision.remaining,
            message: decision.message,
            denied_reason: decision.denied_reason,
            usage: decision.usage,
            limit: decision.limit,
            cost,
            notified_over_limit: decision.over_threshold,
            already_recorded: false,
        })
    }

    /// Current entitlement state for a feature, revalidated per the
    /// state machine: miss → lazy compute, expiry → recompute, staleness
    /// → version comparison.
    ///
    /// # Errors
    ///
    /// Returns error when storage, the grant store or analytics fail
    pub async fn get_state_with_revalidation(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
    ) -> Result<Option<EntitlementState>> {
        let now = ctx.now;
        let key = make_key(&ctx.project_id, &ctx.customer_id, feature_slug);

        let Some(mut state) = self.storage.get(&key)? else {
            return self.load_missing(ctx, feature_slug, &key).await;
        };

        // expired: the cycle rolled or the grants ran out
        if state.entitlement.expires_at.map_or(false, |e| now >= e) {
            return match self.compute_entitlement(ctx, feature_slug).await? {
                Some(entitlement) => {
                    state.entitlement = entitlement;
                    state.meter = None; // force-refresh from analytics
                    self.ensure_meter(ctx, &mut state, now).await?;
                    self.persist_state(ctx, &state).await?;
                    Ok(Some(state))
                }
                None => {
                    self.drop_state(ctx, feature_slug, &key).await?;
                    Ok(None)
                }
            };
        }

        // stale: revalidate against the grant store
        if now >= state.entitlement.next_revalidate_at || state.meter.is_none() {
            match self.compute_entitlement(ctx, feature_slug).await? {
                Some(fresh) if fresh.version != state.entitlement.version => {
                    state.entitlement = fresh;
                    state.meter = None;
                    self.ensure_meter(ctx, &mut state, now).await?;
                    self.persist_state(ctx, &state).await?;
                    self.reconciler.spawn(ctx.clone(), key, now);
                }
                Some(_) => {
                    state.entitlement.next_revalidate_at = now + self.config.revalidate_interval_ms;
                    state.entitlement.updated_at = now;
                    self.ensure_meter(ctx, &mut state, now).await?;
                    self.persist_state(ctx, &state).await?;
                    self.reconciler.spawn(ctx.clone(), key, now);
                }
                None => {
                    self.drop_state(ctx, feature_slug, &key).await?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(state))
    }

    /// Miss path: negative cache, then the shared entitlement cache,
    /// then lazy computation from grants
    async fn load_missing(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
        key: &str,
    ) -> Result<Option<EntitlementState>> {
        let now = ctx.now;

        if let Ok(Some(true)) = self.cache.negative.get(key, now).await {
            return Ok(None);
        }

        // a peer may have computed the entitlement already
        let cached = self.cache.entitlement.get(key, now).await.unwrap_or_else(|e| {
            tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "entitlement cache read failed");
            None
        });

        let entitlement = match cached {
            Some(entitlement) => Some(entitlement),
            None => self.compute_entitlement(ctx, feature_slug).await?,
        };

        let Some(entitlement) = entitlement else {
            if let Err(e) = self.cache.negative.set(key, true, now).await {
                tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "negative cache write failed");
            }
            return Ok(None);
        };

        let mut state = EntitlementState {
            entitlement,
            meter: None,
        };
        self.ensure_meter(ctx, &mut state, now).await?;
        self.persist_state(ctx, &state).await?;
        Ok(Some(state))
    }

    /// Merge the customer's active grants for one feature. Auto-renewing
    /// grants whose window lapsed are rolled forward and appended to the
    /// store before merging.
    async fn compute_entitlement(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
    ) -> Result<Option<Entitlement>> {
        let now = ctx.now;
        let subjects = [
            Subject::new(SubjectKind::Customer, &ctx.customer_id),
            Subject::new(SubjectKind::Project, &ctx.project_id),
        ];
        let listed = self
            .grants
            .list_active_for_subjects(&ctx.project_id, &subjects, 0, now)?;

        let mut active: Vec<Grant> = Vec::new();
        for grant in listed {
            if grant.feature.feature_slug != feature_slug {
                continue;
            }
            if grant.is_active(now) {
                active.push(grant);
            } else if let Some(renewed) = grant.renewed(now) {
                self.grants.insert(&renewed)?;
                active.push(renewed);
            }
        }

        if active.is_empty() {
            return Ok(None);
        }

        let entitlement = resolver::resolve(
            &ctx.project_id,
            &ctx.customer_id,
            &active,
            now,
            self.config.revalidate_interval_ms,
        )?;
        Ok(Some(entitlement))
    }

    /// Final guard before metering: the window must contain `now` and at
    /// least one retained grant must still be live. A shrunk grant set
    /// re-merges from the store, since grants can expire between
    /// computation and verification.
    async fn validate_state(
        &self,
        ctx: &RequestContext,
        state: &mut EntitlementState,
        now: i64,
    ) -> Result<Option<(DeniedReason, String)>> {
        if now < state.entitlement.effective_at {
            return Ok(Some((
                DeniedReason::NotActive,
                "entitlement is not active yet".to_string(),
            )));
        }
        if state.entitlement.expires_at.map_or(false, |e| now >= e) {
            return Ok(Some((
                DeniedReason::Expired,
                "entitlement has expired".to_string(),
            )));
        }

        let live = state
            .entitlement
            .grants
            .iter()
            .filter(|g| g.effective_at <= now && g.expires_at.map_or(true, |e| now < e))
            .count();
        if live == 0 {
            return Ok(Some((
                DeniedReason::Expired,
                "no grant is active".to_string(),
            )));
        }
        if live != state.entitlement.grants.len() {
            match self.compute_entitlement(ctx, &state.entitlement.feature_slug).await? {
                Some(fresh) => {
                    if fresh.version != state.entitlement.version {
                        state.meter = None;
                    }
                    state.entitlement = fresh;
                    self.ensure_meter(ctx, state, now).await?;
                    self.persist_state(ctx, state).await?;
                }
                None => {
                    return Ok(Some((
                        DeniedReason::Expired,
                        "no grant is active".to_string(),
                    )));
                }
            }
        }

        Ok(None)
    }

    /// Seed or re-seed the meter when it is missing or its cycle rolled
    async fn ensure_meter(
        &self,
        ctx: &RequestContext,
        state: &mut EntitlementState,
        now: i64,
    ) -> Result<()> {
        let cycle_start = state.entitlement.cycle_at(now).map(|c| c.start);
        let needs_init = match &state.meter {
            None => true,
            Some(meter) => {
                state.entitlement.aggregation_method.config().resets
                    && meter.last_cycle_start != cycle_start
            }
        };
        if needs_init {
            state.meter = Some(
                self.initialize_usage_meter(ctx, &state.entitlement, now)
                    .await?,
            );
        }
        Ok(())
    }

    /// Seed a meter from the settled analytics aggregate over the
    /// current cycle (or the grant range for lifetime scopes)
    ///
    /// # Errors
    ///
    /// Returns error when analytics fails past its retries
    pub async fn initialize_usage_meter(
        &self,
        ctx: &RequestContext,
        entitlement: &Entitlement,
        now: i64,
    ) -> Result<MeterState> {
        let cycle = entitlement.cycle_at(now);
        let cycle_start = cycle.map(|c| c.start);

        // flat features never meter; nothing to pull
        if entitlement.feature_type == FeatureType::Flat {
            let mut meter = MeterState::empty(now);
            meter.last_cycle_start = cycle_start;
            return Ok(meter);
        }

        let start_at = cycle_start.unwrap_or(entitlement.effective_at);
        let watermark = now - self.config.watermark_delay_ms;
        let before_record_id = boundary_id(watermark);

        let query = UsageCursorQuery {
            customer_id: ctx.customer_id.clone(),
            project_id: ctx.project_id.clone(),
            feature: FeatureRef {
                feature_slug: entitlement.feature_slug.clone(),
                aggregation_method: entitlement.aggregation_method,
                feature_type: entitlement.feature_type,
            },
            after_record_id: boundary_id(start_at),
            before_record_id: before_record_id.clone(),
            start_at,
        };
        let analytics = self.analytics.clone();
        let cursor = with_retries(
            "analytics.features_usage_cursor",
            self.config.retry_attempts,
            std::time::Duration::from_millis(self.config.retry_base_delay_ms),
            || {
                let analytics = analytics.clone();
                let query = query.clone();
                async move { analytics.features_usage_cursor(query).await }
            },
        )
        .await?;

        // empty string is "no record observed": fall back to the boundary
        let last_reconciled_id = if cursor.last_record_id.is_empty() {
            before_record_id
        } else {
            cursor.last_record_id
        };
        Ok(MeterState::initialized(
            cursor.usage,
            last_reconciled_id,
            now,
            cycle_start,
        ))
    }

    /// Minimal entitlement listing for one customer, computed from the
    /// grant store on a cache miss or an empty cached list
    ///
    /// # Errors
    ///
    /// Returns error when the grant store fails
    pub async fn get_active_entitlements(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<MinimalEntitlement>> {
        let now = ctx.now;
        let customer_key = format!("{}:{}", ctx.project_id, ctx.customer_id);

        let cached = self
            .cache
            .entitlements
            .get(&customer_key, now)
            .await
            .unwrap_or(None);
        if let Some(list) = cached {
            if !list.is_empty() {
                return Ok(list);
            }
        }

        let subjects = [
            Subject::new(SubjectKind::Customer, &ctx.customer_id),
            Subject::new(SubjectKind::Project, &ctx.project_id),
        ];
        let grants = self
            .grants
            .list_active_for_subjects(&ctx.project_id, &subjects, now, now)?;

        let mut by_feature: std::collections::BTreeMap<String, Vec<Grant>> =
            std::collections::BTreeMap::new();
        for grant in grants {
            by_feature
                .entry(grant.feature.feature_slug.clone())
                .or_default()
                .push(grant);
        }

        let mut list = Vec::new();
        for (_, feature_grants) in by_feature {
            let entitlement = resolver::resolve(
                &ctx.project_id,
                &ctx.customer_id,
                &feature_grants,
                now,
                self.config.revalidate_interval_ms,
            )?;
            list.push(MinimalEntitlement::from(&entitlement));
        }

        if let Err(e) = self.cache.entitlements.set(&customer_key, list.clone(), now).await {
            tracing::warn!(request = %ctx.request_id, error = %e, "entitlements cache write failed");
        }
        Ok(list)
    }

    /// Wipe all cached and durable entitlement state for the customer.
    /// Durable and idempotent.
    ///
    /// # Errors
    ///
    /// Returns error when storage or the cache fail
    pub async fn reset_entitlements(&self, ctx: &RequestContext) -> Result<()> {
        let states = self
            .storage
            .list_for_customer(&ctx.project_id, &ctx.customer_id)?;
        let slugs: Vec<String> = states
            .iter()
            .map(|s| s.entitlement.feature_slug.clone())
            .collect();

        self.cache
            .invalidate_customer(&ctx.project_id, &ctx.customer_id, &slugs)
            .await?;
        self.storage.reset(&ctx.project_id, &ctx.customer_id)?;

        tracing::info!(
            request = %ctx.request_id,
            customer = %ctx.customer_id,
            features = slugs.len(),
            "entitlements reset"
        );
        Ok(())
    }

    /// The customer's access-control triple. Served stale-while-
    /// revalidate from its namespace; recomputed from stored entitlement
    /// state on a miss.
    ///
    /// # Errors
    ///
    /// Returns error when storage fails
    pub async fn get_access_control_list(
        &self,
        ctx: &RequestContext,
    ) -> Result<AccessControlList> {
        let customer_key = format!("{}:{}", ctx.project_id, ctx.customer_id);
        let service = self.clone();
        let loader_ctx = ctx.clone();
        let acl = self
            .cache
            .acl
            .swr(&customer_key, ctx.now, move || async move {
                service.compute_access_control_list(&loader_ctx).map(Some)
            })
            .await?;
        Ok(acl.unwrap_or_default())
    }

    fn compute_access_control_list(&self, ctx: &RequestContext) -> Result<AccessControlList> {
        let states = self
            .storage
            .list_for_customer(&ctx.project_id, &ctx.customer_id)?;

        let mut acl = AccessControlList::default();
        for state in &states {
            let entitlement = &state.entitlement;
            if entitlement
                .grants
                .iter()
                .any(|g| g.grant_type == crate::grant::GrantType::Subscription)
            {
                acl.subscription_status = "active".to_string();
            }
            if entitlement.metadata.block_customer {
                if let (Some(meter), Some(limit)) = (&state.meter, entitlement.limit) {
                    if meter.usage >= limit {
                        acl.usage_limit_reached = true;
                    }
                }
            }
        }
        Ok(acl)
    }

    /// Flip the customer's limit flag; failures are logged, never
    /// propagated into the request path
    async fn set_usage_limit_reached(&self, ctx: &RequestContext, reached: bool) {
        let customer_key = format!("{}:{}", ctx.project_id, ctx.customer_id);
        let mut acl = match self.cache.acl.get(&customer_key, ctx.now).await {
            Ok(Some(acl)) => acl,
            _ => AccessControlList::default(),
        };
        if acl.usage_limit_reached == reached {
            return;
        }
        acl.usage_limit_reached = reached;
        if let Err(e) = self.cache.acl.set(&customer_key, acl.clone(), ctx.now).await {
            tracing::warn!(request = %ctx.request_id, error = %e, "acl update failed");
            return;
        }
        if let Some(listener) = &self.acl_listener {
            listener(ctx, &acl);
        }
    }

    /// Persist state and refresh the shared entitlement cache
    async fn persist_state(&self, ctx: &RequestContext, state: &EntitlementState) -> Result<()> {
        self.storage.set(state)?;
        let key = state.key();
        if let Err(e) = self
            .cache
            .entitlement
            .set(&key, state.entitlement.clone(), ctx.now)
            .await
        {
            tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "entitlement cache write failed");
        }
        if let Err(e) = self.cache.negative.remove(&key).await {
            tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "negative cache clear failed");
        }
        Ok(())
    }

    /// Remove state everywhere and memoize the miss
    async fn drop_state(&self, ctx: &RequestContext, feature_slug: &str, key: &str) -> Result<()> {
        self.storage.delete(key)?;
        if let Err(e) = self.cache.entitlement.remove(key).await {
            tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "entitlement cache removal failed");
        }
        if let Err(e) = self.cache.negative.set(key, true, ctx.now).await {
            tracing::warn!(request = %ctx.request_id, key = %key, error = %e, "negative cache write failed");
        }
        tracing::debug!(
            request = %ctx.request_id,
            customer = %ctx.customer_id,
            feature = %feature_slug,
            "entitlement dropped, no grants remain"
        );
        Ok(())
    }

    /// Append a verification row; the flush loop ships it later. Append
    /// failures never overturn the decision.
    fn append_verification(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
        now: i64,
        result: &VerifyResult,
    ) {
        let verification = Verification {
            customer_id: ctx.customer_id.clone(),
            project_id: ctx.project_id.clone(),
            feature_slug: feature_slug.to_string(),
            timestamp: now,
            allowed: result.allowed,
            denied_reason: result.denied_reason.map(|r| r.as_str().to_string()),
            metadata: VerificationMetadata {
                usage: Some(result.usage),
                remaining: result.remaining,
            },
            latency: result.latency,
            request_id: ctx.request_id.clone(),
            created_at: now,
        };
        if let Err(e) = self.storage.insert_verification(&verification) {
            tracing::warn!(
                request = %ctx.request_id,
                feature = %feature_slug,
                error = %e,
                "verification append failed, left to flush retry"
            );
        }
    }
}
