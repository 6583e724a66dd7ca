//! Tollgate - entitlement and usage-metering core
//!
//! This library answers two low-latency questions for every customer
//! request: *"is this feature allowed for this customer right now?"* and
//! *"record N units of usage for this feature"*, while keeping the
//! per-customer meters consistent with a settled analytics store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Edge                            │
//! │      authn  │  rate limiting  │  routing            │
//! └────────────────────┬────────────────────────────────┘
//!                      │ per-customer RPC
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Meter Actor                         │
//! │  command loop │ alarm flush │ event broadcast       │
//! │  ┌───────────────────────────────────────────────┐  │
//! │  │            Entitlement Service                 │  │
//! │  │  resolver │ meter │ cache │ reconciler        │  │
//! │  └───────────────────┬───────────────────────────┘  │
//! │                      │                               │
//! │        SQLite storage │ shared KV cache              │
//! └──────────────────────┼──────────────────────────────┘
//!                        │ batched ingest / cursor pulls
//! ┌──────────────────────▼──────────────────────────────┐
//! │               Analytics (settled)                    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod actor;
pub mod aggregation;
pub mod analytics;
pub mod cache;
pub mod config;
pub mod context;
pub mod cycle;
pub mod error;
pub mod grant;
pub mod meter;
pub mod pricing;
pub mod reconcile;
pub mod service;
pub mod storage;

pub use actor::{ActorEvent, MeterActor, MeterActorHandle};
pub use aggregation::{AggregationBehavior, AggregationConfig, AggregationMethod, AggregationScope};
pub use analytics::{
    Analytics, BillingUsageQuery, BillingUsageRow, FeatureRef, UsageCursor, UsageCursorQuery,
    UsageRecord, Verification,
};
pub use cache::{CacheLayer, MemoryKv, SharedKv};
pub use config::CoreConfig;
pub use context::RequestContext;
pub use cycle::{cycle_window, BillingInterval, CycleConfig, CycleWindow, PlanType};
pub use error::{DeniedReason, Error, Result};
pub use grant::resolver::{Entitlement, GrantSnapshot, MergingPolicy, MinimalEntitlement};
pub use grant::{
    FeatureMetadata, FeaturePlanVersion, FeatureType, Grant, GrantStore, GrantType,
    OverageStrategy, Subject, SubjectKind,
};
pub use meter::{MeterDecision, MeterState, UsageMeter};
pub use pricing::{PackagePricing, PriceTier, PricingConfig, UsageMode};
pub use reconcile::{ReconcileOutcome, Reconciler, SkipReason};
pub use service::usage::CurrentUsage;
pub use service::{
    AccessControlList, AclListener, EntitlementService, ReportUsageRequest, ReportUsageResult,
    VerifyRequest, VerifyResult,
};
pub use storage::{make_key, DbConn, DbPool, EntitlementState, EntitlementStorage};
