//! Analytics interface
//!
//! The settled source of truth the core consumes but does not own.
//! Aggregation queries run over lexicographically ordered record ids
//! (ULIDs seeded from the event timestamp), which gives the reconciler
//! a cursor it can advance monotonically.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::aggregation::AggregationMethod;
use crate::grant::FeatureType;
use crate::Result;

/// ULID for an event at `timestamp_ms` with random entropy
#[must_use]
pub fn record_id(timestamp_ms: i64) -> String {
    let ts = u64::try_from(timestamp_ms.max(0)).unwrap_or(0);
    Ulid::from_parts(ts, rand::random::<u128>()).to_string()
}

/// Zero-entropy ULID marking the cursor boundary at `timestamp_ms`;
/// every real record at or after that instant sorts above it
#[must_use]
pub fn boundary_id(timestamp_ms: i64) -> String {
    let ts = u64::try_from(timestamp_ms.max(0)).unwrap_or(0);
    Ulid::from_parts(ts, 0).to_string()
}

/// Append-only usage record shipped to the analytics sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Ordered record id (ULID seeded from `timestamp`)
    pub id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    /// Signed delta; refunds are negative
    pub usage: Decimal,
    pub timestamp: i64,
    pub idempotence_key: String,
    pub request_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: UsageRecordMetadata,
    pub deleted: bool,
}

/// Cost metadata embedded in a usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UsageRecordMetadata {
    #[serde(default)]
    pub cost: Option<Decimal>,
    #[serde(default)]
    pub rate: Option<Decimal>,
    #[serde(default)]
    pub rate_amount: Option<Decimal>,
    #[serde(default)]
    pub rate_currency: Option<String>,
}

/// Append-only verification record shipped to the analytics sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub timestamp: i64,
    pub allowed: bool,
    pub denied_reason: Option<String>,
    #[serde(default)]
    pub metadata: VerificationMetadata,
    /// Milliseconds from edge ingress to decision
    pub latency: f64,
    pub request_id: String,
    pub created_at: i64,
}

/// Meter observations attached to a verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VerificationMetadata {
    #[serde(default)]
    pub usage: Option<Decimal>,
    #[serde(default)]
    pub remaining: Option<Decimal>,
}

/// Feature identity for a cursor query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRef {
    pub feature_slug: String,
    pub aggregation_method: AggregationMethod,
    pub feature_type: FeatureType,
}

/// Aggregate-over-cursor-range query
#[derive(Debug, Clone)]
pub struct UsageCursorQuery {
    pub customer_id: String,
    pub project_id: String,
    pub feature: FeatureRef,
    /// Exclusive lower record-id bound; empty means from the beginning
    pub after_record_id: String,
    /// Exclusive upper record-id bound
    pub before_record_id: String,
    /// Window start in epoch milliseconds
    pub start_at: i64,
}

/// Result of a cursor query
#[derive(Debug, Clone, PartialEq)]
pub struct UsageCursor {
    pub feature_slug: String,
    /// Aggregated value (sum/max/last per the method)
    pub usage: Decimal,
    /// Highest record id covered; empty when no records matched
    pub last_record_id: String,
}

/// Billing-period aggregate query
#[derive(Debug, Clone)]
pub struct BillingUsageQuery {
    pub customer_id: String,
    pub project_id: String,
    pub feature_slugs: Vec<String>,
    pub start: i64,
    pub end: i64,
}

/// One row of billing-period aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct BillingUsageRow {
    pub feature_slug: String,
    pub sum: Decimal,
    pub max: Decimal,
    pub count: Decimal,
    pub last_during_period: Decimal,
}

impl BillingUsageRow {
    /// Pick the aggregate matching the feature's method
    #[must_use]
    pub fn value_for(&self, method: AggregationMethod) -> Decimal {
        use crate::aggregation::AggregationBehavior as B;
        if method.is_count() {
            return self.count;
        }
        match method.config().behavior {
            B::Sum => self.sum,
            B::Max => self.max,
            B::Last => self.last_during_period,
            B::None => Decimal::ZERO,
        }
    }
}

/// The analytics backend consumed by the core
#[async_trait]
pub trait Analytics: Send + Sync {
    /// Aggregate usage over a record-id range
    async fn features_usage_cursor(&self, query: UsageCursorQuery) -> Result<UsageCursor>;

    /// Billing-period aggregates for a set of features
    async fn billing_usage(&self, query: BillingUsageQuery) -> Result<Vec<BillingUsageRow>>;

    /// Ingest a batch of usage records
    async fn ingest_usage_records(&self, records: Vec<UsageRecord>) -> Result<()>;

    /// Ingest a batch of verifications
    async fn ingest_verifications(&self, verifications: Vec<Verification>) -> Result<()>;
}
