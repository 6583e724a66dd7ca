//! Grant resolution
//!
//! Composes a set of active grants into the single effective entitlement
//! for a (customer, feature) pair. The merging policy is derived from
//! the feature type of the highest-priority grant; the version hash over
//! the retained snapshot drives cache invalidation.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::aggregation::{AggregationMethod, AggregationScope};
use crate::cycle::{cycle_window, CycleConfig};
use crate::grant::{FeatureMetadata, FeatureType, Grant, GrantType, OverageStrategy};
use crate::pricing::{PricingConfig, UsageMode};
use crate::{Error, Result};

/// How multiple grants combine into one limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergingPolicy {
    Sum,
    Max,
    Min,
    Replace,
}

/// Immutable slice of a grant retained in the entitlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSnapshot {
    pub id: String,
    pub grant_type: GrantType,
    pub name: String,
    pub effective_at: i64,
    pub expires_at: Option<i64>,
    pub limit: Option<Decimal>,
    pub priority: u8,
    pub config: PricingConfig,
}

impl GrantSnapshot {
    fn of(grant: &Grant) -> Self {
        Self {
            id: grant.id.clone(),
            grant_type: grant.grant_type,
            name: grant.feature.feature_slug.clone(),
            effective_at: grant.effective_at,
            expires_at: grant.expires_at,
            limit: grant.limit,
            priority: grant.priority(),
            config: grant.feature.config.clone(),
        }
    }
}

/// The merged, per-(customer, feature) view of active grants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    pub project_id: String,
    pub customer_id: String,
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub usage_mode: UsageMode,
    pub aggregation_method: AggregationMethod,
    pub merging_policy: MergingPolicy,
    /// `None` means unlimited
    pub limit: Option<Decimal>,
    /// Reset cadence meters cycle on
    pub reset: CycleConfig,
    /// Cycle alignment anchor of the winning grant, epoch milliseconds
    pub anchor: i64,
    /// Winning grants, priority-descending
    pub grants: Vec<GrantSnapshot>,
    /// SHA-256 over the canonical grants snapshot
    pub version: String,
    pub effective_at: i64,
    pub expires_at: Option<i64>,
    pub next_revalidate_at: i64,
    pub computed_at: i64,
    pub updated_at: i64,
    pub metadata: FeatureMetadata,
    /// Winning grant's pricing configuration
    pub pricing: PricingConfig,
}

impl Entitlement {
    /// The merged validity range of the retained grants, regardless of
    /// aggregation scope
    #[must_use]
    pub fn grant_range(&self) -> (i64, Option<i64>) {
        let start = self
            .grants
            .iter()
            .map(|g| g.effective_at)
            .min()
            .unwrap_or(self.effective_at);
        let end = self.grants.iter().filter_map(|g| g.expires_at).max();
        (start, end)
    }

    /// Current cycle window for period-scoped entitlements; the whole
    /// grant range for lifetime scope
    #[must_use]
    pub fn cycle_at(&self, now: i64) -> Option<crate::cycle::CycleWindow> {
        let (start, end) = self.grant_range();
        match self.aggregation_method.config().scope {
            AggregationScope::Period => cycle_window(start, end, now, &self.reset, None),
            AggregationScope::Lifetime => Some(crate::cycle::CycleWindow {
                start,
                end: end.unwrap_or(i64::MAX),
            }),
        }
    }
}

/// Trimmed entitlement row for customer-level listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalEntitlement {
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub limit: Option<Decimal>,
    pub version: String,
}

impl From<&Entitlement> for MinimalEntitlement {
    fn from(e: &Entitlement) -> Self {
        Self {
            feature_slug: e.feature_slug.clone(),
            feature_type: e.feature_type,
            limit: e.limit,
            version: e.version.clone(),
        }
    }
}

/// Derive the merging policy from the winning grant's feature shape
#[must_use]
pub const fn derive_policy(feature_type: FeatureType, usage_mode: UsageMode) -> MergingPolicy {
    match feature_type {
        FeatureType::Usage => match usage_mode {
            UsageMode::Tier => MergingPolicy::Max,
            UsageMode::Unit | UsageMode::Package => MergingPolicy::Sum,
        },
        FeatureType::Tier | FeatureType::Package => MergingPolicy::Max,
        FeatureType::Flat => MergingPolicy::Replace,
    }
}

/// Merge the overage strategies of the retained grants under the policy
#[must_use]
pub fn merge_overage(policy: MergingPolicy, winner: OverageStrategy, strategies: &[OverageStrategy]) -> OverageStrategy {
    match policy {
        MergingPolicy::Sum | MergingPolicy::Max => {
            if strategies.contains(&OverageStrategy::Always) {
                OverageStrategy::Always
            } else if strategies.contains(&OverageStrategy::LastCall) {
                OverageStrategy::LastCall
            } else {
                winner
            }
        }
        MergingPolicy::Min => {
            if strategies.contains(&OverageStrategy::None) {
                OverageStrategy::None
            } else if strategies.contains(&OverageStrategy::LastCall) {
                OverageStrategy::LastCall
            } else {
                OverageStrategy::Always
            }
        }
        MergingPolicy::Replace => winner,
    }
}

/// Compute the effective entitlement for one feature from its active
/// grants
///
/// # Errors
///
/// `Error::NoGrants` on an empty set; `Error::FeatureMismatch` when the
/// grants span different feature slugs
pub fn resolve(
    project_id: &str,
    customer_id: &str,
    grants: &[Grant],
    now: i64,
    revalidate_interval_ms: i64,
) -> Result<Entitlement> {
    let Some(first) = grants.first() else {
        return Err(Error::NoGrants);
    };
    let feature_slug = &first.feature.feature_slug;
    for grant in grants {
        if &grant.feature.feature_slug != feature_slug {
            return Err(Error::FeatureMismatch {
                expected: feature_slug.clone(),
                got: grant.feature.feature_slug.clone(),
            });
        }
    }

    // priority-descending, stable on effective date for equal priorities
    let mut sorted: Vec<&Grant> = grants.iter().collect();
    sorted.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then(a.effective_at.cmp(&b.effective_at))
    });

    let head = sorted[0];
    let policy = derive_policy(head.feature.feature_type, head.feature.usage_mode);
    let retained = apply_policy(policy, &sorted);

    let limit = merged_limit(policy, &retained);
    let winner = retained[0];

    let strategies: Vec<OverageStrategy> = retained
        .iter()
        .map(|g| g.feature.metadata.overage_strategy)
        .collect();
    let mut metadata = winner.feature.metadata.clone();
    metadata.overage_strategy =
        merge_overage(policy, winner.feature.metadata.overage_strategy, &strategies);

    let snapshot: Vec<GrantSnapshot> = retained.iter().map(|g| GrantSnapshot::of(g)).collect();
    let version = version_hash(&snapshot)?;

    let grant_start = retained.iter().map(|g| g.effective_at).min().unwrap_or(now);
    let grant_end = retained.iter().filter_map(|g| g.expires_at).max();

    let mut reset = winner.feature.reset_cadence().clone();
    if reset.anchor.is_none() {
        reset.anchor = Some(winner.anchor);
    }
    let scope = winner.feature.aggregation_method.config().scope;
    let (effective_at, expires_at) = match scope {
        AggregationScope::Lifetime => (grant_start, grant_end),
        AggregationScope::Period => {
            match cycle_window(grant_start, grant_end, now, &reset, None) {
                Some(window) => (window.start, Some(window.end)),
                None => (grant_start, grant_end),
            }
        }
    };

    Ok(Entitlement {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        customer_id: customer_id.to_string(),
        feature_slug: feature_slug.clone(),
        feature_type: winner.feature.feature_type,
        usage_mode: winner.feature.usage_mode,
        aggregation_method: winner.feature.aggregation_method,
        merging_policy: policy,
        limit,
        reset,
        anchor: winner.anchor,
        grants: snapshot,
        version,
        effective_at,
        expires_at,
        next_revalidate_at: now + revalidate_interval_ms,
        computed_at: now,
        updated_at: now,
        metadata,
        pricing: winner.feature.config.clone(),
    })
}

/// Select the grants the policy retains, priority order preserved
fn apply_policy<'a>(policy: MergingPolicy, sorted: &[&'a Grant]) -> Vec<&'a Grant> {
    match policy {
        MergingPolicy::Sum => sorted.to_vec(),
        MergingPolicy::Max => vec![pick_by_limit(sorted, true)],
        MergingPolicy::Min => vec![pick_by_limit(sorted, false)],
        MergingPolicy::Replace => vec![sorted[0]],
    }
}

/// Grant with the max (or min) non-null limit; priority breaks ties and
/// covers the all-unlimited case
fn pick_by_limit<'a>(sorted: &[&'a Grant], want_max: bool) -> &'a Grant {
    let mut best = sorted[0];
    for candidate in sorted {
        let better = match (candidate.limit, best.limit) {
            (Some(c), Some(b)) => {
                if want_max {
                    c > b
                } else {
                    c < b
                }
            }
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best = candidate;
        }
    }
    best
}

fn merged_limit(policy: MergingPolicy, retained: &[&Grant]) -> Option<Decimal> {
    match policy {
        MergingPolicy::Sum => {
            if retained.iter().all(|g| g.limit.is_none()) {
                None
            } else {
                Some(
                    retained
                        .iter()
                        .map(|g| g.limit.unwrap_or(Decimal::ZERO))
                        .sum(),
                )
            }
        }
        // max/min/replace retain exactly one grant
        _ => retained[0].limit,
    }
}

fn hash_memo() -> &'static Mutex<HashMap<String, String>> {
    static MEMO: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    MEMO.get_or_init(|| Mutex::new(HashMap::new()))
}

/// SHA-256 of the canonical JSON of the snapshot, memoized process-wide.
/// Any mutation to a retained grant changes the hash.
///
/// # Errors
///
/// Returns error if the snapshot cannot be serialized
pub fn version_hash(snapshot: &[GrantSnapshot]) -> Result<String> {
    let canonical = serde_json::to_string(snapshot)?;
    if let Ok(memo) = hash_memo().lock() {
        if let Some(hit) = memo.get(&canonical) {
            return Ok(hit.clone());
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    if let Ok(mut memo) = hash_memo().lock() {
        memo.insert(canonical, digest.clone());
    }
    Ok(digest)
}
