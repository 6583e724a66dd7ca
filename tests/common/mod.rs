//! Shared test harness: fake analytics backend and service builders

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use rust_decimal::Decimal;
use tollgate::analytics::{record_id, UsageRecordMetadata};
use tollgate::{
    AggregationBehavior, AggregationMethod, Analytics, BillingInterval, BillingUsageQuery,
    BillingUsageRow, CacheLayer, CoreConfig, CycleConfig, DbPool, EntitlementService,
    EntitlementStorage, FeatureMetadata, FeaturePlanVersion, FeatureType, Grant, GrantStore,
    GrantType, MemoryKv, OverageStrategy, PricingConfig, RequestContext, Result, SubjectKind,
    UsageCursor, UsageCursorQuery, UsageMode, UsageRecord, Verification,
};

pub const PROJECT: &str = "proj";
pub const CUSTOMER: &str = "cust";

/// In-memory analytics store aggregating over seeded and ingested records
#[derive(Default)]
pub struct FakeAnalytics {
    records: Mutex<Vec<UsageRecord>>,
    verifications: Mutex<Vec<Verification>>,
}

impl FakeAnalytics {
    /// Insert a settled record directly, as an out-of-band writer would
    pub fn seed_usage(&self, feature_slug: &str, usage: i64, timestamp: i64) -> String {
        let id = record_id(timestamp);
        self.records.lock().unwrap().push(UsageRecord {
            id: id.clone(),
            customer_id: CUSTOMER.to_string(),
            project_id: PROJECT.to_string(),
            feature_slug: feature_slug.to_string(),
            usage: Decimal::from(usage),
            timestamp,
            idempotence_key: format!("seed-{id}"),
            request_id: "seed".to_string(),
            created_at: timestamp,
            metadata: UsageRecordMetadata::default(),
            deleted: false,
        });
        id
    }

    pub fn ingested_records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn ingested_verifications(&self) -> Vec<Verification> {
        self.verifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analytics for FakeAnalytics {
    async fn features_usage_cursor(&self, query: UsageCursorQuery) -> Result<UsageCursor> {
        let records = self.records.lock().unwrap();
        let mut matched: Vec<&UsageRecord> = records
            .iter()
            .filter(|r| {
                r.customer_id == query.customer_id
                    && r.project_id == query.project_id
                    && r.feature_slug == query.feature.feature_slug
                    && !r.deleted
                    && r.timestamp >= query.start_at
                    && (query.after_record_id.is_empty() || r.id > query.after_record_id)
                    && r.id < query.before_record_id
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));

        let method = query.feature.aggregation_method;
        let usage = if method.is_count() {
            Decimal::from(matched.len() as i64)
        } else {
            match method.config().behavior {
                AggregationBehavior::Sum => matched.iter().map(|r| r.usage).sum(),
                AggregationBehavior::Max => matched
                    .iter()
                    .map(|r| r.usage)
                    .max()
                    .unwrap_or(Decimal::ZERO),
                AggregationBehavior::Last => {
                    matched.last().map_or(Decimal::ZERO, |r| r.usage)
                }
                AggregationBehavior::None => Decimal::ZERO,
            }
        };
        let last_record_id = matched.last().map_or(String::new(), |r| r.id.clone());

        Ok(UsageCursor {
            feature_slug: query.feature.feature_slug,
            usage,
            last_record_id,
        })
    }

    async fn billing_usage(&self, query: BillingUsageQuery) -> Result<Vec<BillingUsageRow>> {
        let records = self.records.lock().unwrap();
        let mut rows = Vec::new();
        for slug in &query.feature_slugs {
            let mut matched: Vec<&UsageRecord> = records
                .iter()
                .filter(|r| {
                    r.customer_id == query.customer_id
                        && r.project_id == query.project_id
                        && &r.feature_slug == slug
                        && !r.deleted
                        && r.timestamp >= query.start
                        && r.timestamp < query.end
                })
                .collect();
            matched.sort_by(|a, b| a.id.cmp(&b.id));
            rows.push(BillingUsageRow {
                feature_slug: slug.clone(),
                sum: matched.iter().map(|r| r.usage).sum(),
                max: matched
                    .iter()
                    .map(|r| r.usage)
                    .max()
                    .unwrap_or(Decimal::ZERO),
                count: Decimal::from(matched.len() as i64),
                last_during_period: matched.last().map_or(Decimal::ZERO, |r| r.usage),
            });
        }
        Ok(rows)
    }

    async fn ingest_usage_records(&self, records: Vec<UsageRecord>) -> Result<()> {
        self.records.lock().unwrap().extend(records);
        Ok(())
    }

    async fn ingest_verifications(&self, verifications: Vec<Verification>) -> Result<()> {
        self.verifications.lock().unwrap().extend(verifications);
        Ok(())
    }
}

/// Everything a test needs to drive the core
pub struct Harness {
    pub service: EntitlementService,
    pub analytics: Arc<FakeAnalytics>,
    pub grants: GrantStore,
    pub storage: EntitlementStorage,
    pub config: CoreConfig,
}

pub fn harness() -> Harness {
    harness_with_pool(tollgate::storage::init_memory().unwrap())
}

pub fn harness_with_pool(pool: DbPool) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = CoreConfig::default();
    let analytics = Arc::new(FakeAnalytics::default());
    let storage = EntitlementStorage::new(pool.clone(), analytics.clone());
    let grants = GrantStore::new(pool);
    let cache = Arc::new(CacheLayer::new(Arc::new(MemoryKv::new()), &config));
    let service = EntitlementService::new(
        config.clone(),
        storage.clone(),
        grants.clone(),
        analytics.clone(),
        cache,
    );
    Harness {
        service,
        analytics,
        grants,
        storage,
        config,
    }
}

pub fn ctx(now: i64) -> RequestContext {
    RequestContext::new(PROJECT, CUSTOMER, now)
}

pub fn ts(rfc3339: &str) -> i64 {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .timestamp_millis()
}

pub struct GrantBuilder {
    pub id: String,
    pub grant_type: GrantType,
    pub limit: Option<i64>,
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub aggregation_method: AggregationMethod,
    pub usage_mode: UsageMode,
    pub overage_strategy: OverageStrategy,
    pub effective_at: i64,
    pub expires_at: Option<i64>,
    pub pricing: PricingConfig,
}

impl GrantBuilder {
    pub fn usage(id: &str, limit: i64) -> Self {
        Self {
            id: id.to_string(),
            grant_type: GrantType::Subscription,
            limit: Some(limit),
            feature_slug: "api_calls".to_string(),
            feature_type: FeatureType::Usage,
            aggregation_method: AggregationMethod::Sum,
            usage_mode: UsageMode::Unit,
            overage_strategy: OverageStrategy::None,
            effective_at: 0,
            expires_at: None,
            pricing: PricingConfig::default(),
        }
    }

    pub fn grant_type(mut self, grant_type: GrantType) -> Self {
        self.grant_type = grant_type;
        self
    }

    pub fn overage(mut self, strategy: OverageStrategy) -> Self {
        self.overage_strategy = strategy;
        self
    }

    pub fn method(mut self, method: AggregationMethod) -> Self {
        self.aggregation_method = method;
        self
    }

    pub fn feature_type(mut self, feature_type: FeatureType, mode: UsageMode) -> Self {
        self.feature_type = feature_type;
        self.usage_mode = mode;
        self
    }

    pub fn slug(mut self, slug: &str) -> Self {
        self.feature_slug = slug.to_string();
        self
    }

    pub fn effective(mut self, at: i64) -> Self {
        self.effective_at = at;
        self
    }

    pub fn pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn build(self) -> Grant {
        Grant {
            id: self.id.clone(),
            project_id: PROJECT.to_string(),
            subject_kind: SubjectKind::Customer,
            subject_id: CUSTOMER.to_string(),
            feature_plan_version_id: format!("fpv_{}", self.id),
            grant_type: self.grant_type,
            limit: self.limit.map(Decimal::from),
            anchor: self.effective_at,
            effective_at: self.effective_at,
            expires_at: self.expires_at,
            auto_renew: false,
            deleted: false,
            created_at: self.effective_at,
            updated_at: self.effective_at,
            feature: FeaturePlanVersion {
                feature_slug: self.feature_slug,
                feature_type: self.feature_type,
                aggregation_method: self.aggregation_method,
                usage_mode: self.usage_mode,
                billing: CycleConfig::recurring("monthly", BillingInterval::Month, 1),
                reset: None,
                metadata: FeatureMetadata {
                    overage_strategy: self.overage_strategy,
                    ..FeatureMetadata::default()
                },
                config: self.pricing,
            },
        }
    }
}
