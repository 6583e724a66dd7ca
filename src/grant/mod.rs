//! Grants and the grant store
//!
//! A grant is one unit of entitlement issued to a subject (customer,
//! project, plan or plan version). Grants are append-only: deletion is a
//! soft-delete flag, and renewal inserts a fresh row with a shifted
//! validity window.

pub mod resolver;

use rusqlite::OptionalExtension;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::AggregationMethod;
use crate::cycle::{cycle_window, CycleConfig};
use crate::pricing::{PricingConfig, UsageMode};
use crate::storage::DbPool;
use crate::{Error, Result};

/// Kind of subject a grant is issued to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Customer,
    Project,
    Plan,
    PlanVersion,
}

impl SubjectKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Project => "project",
            Self::Plan => "plan",
            Self::PlanVersion => "plan_version",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Self::Customer),
            "project" => Some(Self::Project),
            "plan" => Some(Self::Plan),
            "plan_version" => Some(Self::PlanVersion),
            _ => None,
        }
    }
}

/// Origin of a grant; the priority ladder is derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    Subscription,
    Addon,
    Trial,
    Promotion,
    Manual,
}

impl GrantType {
    /// Merge priority; higher wins
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Subscription => 10,
            Self::Addon => 20,
            Self::Trial => 60,
            Self::Promotion => 70,
            Self::Manual => 80,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Addon => "addon",
            Self::Trial => "trial",
            Self::Promotion => "promotion",
            Self::Manual => "manual",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(Self::Subscription),
            "addon" => Some(Self::Addon),
            "trial" => Some(Self::Trial),
            "promotion" => Some(Self::Promotion),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// What kind of feature the grant entitles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Flat,
    Tier,
    Package,
    Usage,
}

/// How the meter behaves once usage crosses the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverageStrategy {
    None,
    LastCall,
    Always,
}

/// Per-feature behavioral flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub overage_strategy: OverageStrategy,
    /// Percent of the limit that flips the over-threshold flag
    #[serde(default)]
    pub notify_usage_threshold: Option<u8>,
    /// Deny-and-block the customer on limit breach
    #[serde(default)]
    pub block_customer: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub realtime: bool,
}

impl Default for FeatureMetadata {
    fn default() -> Self {
        Self {
            overage_strategy: OverageStrategy::None,
            notify_usage_threshold: None,
            block_customer: false,
            hidden: false,
            realtime: false,
        }
    }
}

/// Per-grant feature configuration, embedded in the grant row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePlanVersion {
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub aggregation_method: AggregationMethod,
    pub usage_mode: UsageMode,
    pub billing: CycleConfig,
    #[serde(default)]
    pub reset: Option<CycleConfig>,
    #[serde(default)]
    pub metadata: FeatureMetadata,
    #[serde(default)]
    pub config: PricingConfig,
}

impl FeaturePlanVersion {
    /// The cadence meters reset on: the reset config when present,
    /// otherwise the billing cadence
    #[must_use]
    pub fn reset_cadence(&self) -> &CycleConfig {
        self.reset.as_ref().unwrap_or(&self.billing)
    }
}

/// A unit of entitlement issued to a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub project_id: String,
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub feature_plan_version_id: String,
    pub grant_type: GrantType,
    /// `None` means unlimited
    pub limit: Option<Decimal>,
    /// Cycle alignment anchor, epoch milliseconds
    pub anchor: i64,
    pub effective_at: i64,
    pub expires_at: Option<i64>,
    pub auto_renew: bool,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub feature: FeaturePlanVersion,
}

impl Grant {
    /// Merge priority inherited from the grant type
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.grant_type.priority()
    }

    /// Live at `now`: effective, not expired, not soft-deleted
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        !self.deleted
            && self.effective_at <= now
            && self.expires_at.map_or(true, |e| now < e)
    }

    /// Renew an expired auto-renewing grant by rolling its validity
    /// window forward one cycle at a time until it covers `now`.
    ///
    /// Subscriptions and trials never self-renew; their lifecycle is
    /// driven by plan events.
    #[must_use]
    pub fn renewed(&self, now: i64) -> Option<Self> {
        if !self.auto_renew
            || matches!(self.grant_type, GrantType::Subscription | GrantType::Trial)
        {
            return None;
        }
        let expires_at = self.expires_at?;
        if now < expires_at || self.deleted {
            return None;
        }
        let cadence = self.feature.reset_cadence();
        let window = cycle_window(self.effective_at, None, expires_at - 1, cadence, None)?;
        let step = window.len_ms().max(1);

        let mut effective_at = self.effective_at;
        let mut new_expires = expires_at;
        while new_expires <= now {
            effective_at = new_expires;
            new_expires = new_expires.checked_add(step)?;
        }

        Some(Self {
            id: Uuid::new_v4().to_string(),
            effective_at,
            expires_at: Some(new_expires),
            created_at: now,
            updated_at: now,
            ..self.clone()
        })
    }
}

/// A subject a customer resolves through (itself, its project, its plan)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: String,
}

impl Subject {
    #[must_use]
    pub fn new(kind: SubjectKind, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

/// Append-only grant store over the shared SQLite pool
#[derive(Clone)]
pub struct GrantStore {
    pool: DbPool,
}

impl GrantStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a grant; a row with the same conflict key is left untouched
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn insert(&self, grant: &Grant) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let feature = serde_json::to_string(&grant.feature)?;
        conn.execute(
            "INSERT OR IGNORE INTO grants (
                id, project_id, subject_kind, subject_id, feature_plan_version_id,
                grant_type, limit_amount, anchor, effective_at, expires_at,
                auto_renew, deleted, deleted_at, created_at, updated_at, feature
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, ?12, ?13, ?14)",
            rusqlite::params![
                grant.id,
                grant.project_id,
                grant.subject_kind.as_str(),
                grant.subject_id,
                grant.feature_plan_version_id,
                grant.grant_type.as_str(),
                grant.limit.map(|l| l.to_string()),
                grant.anchor,
                grant.effective_at,
                grant.expires_at,
                grant.auto_renew,
                grant.created_at,
                grant.updated_at,
                feature,
            ],
        )?;
        Ok(())
    }

    /// List grants for the given subjects whose validity window overlaps
    /// `[start_at, end_at)`. Pass `start_at == end_at == now` for a
    /// point-in-time query.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn list_active_for_subjects(
        &self,
        project_id: &str,
        subjects: &[Subject],
        start_at: i64,
        end_at: i64,
    ) -> Result<Vec<Grant>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut out: Vec<Grant> = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT id, project_id, subject_kind, subject_id, feature_plan_version_id,
                    grant_type, limit_amount, anchor, effective_at, expires_at,
                    auto_renew, deleted, created_at, updated_at, feature
             FROM grants
             WHERE project_id = ?1 AND subject_kind = ?2 AND subject_id = ?3
               AND deleted = 0
               AND effective_at <= ?4
               AND (expires_at IS NULL OR expires_at > ?5)
             ORDER BY effective_at ASC",
        )?;

        for subject in subjects {
            let rows = stmt.query_map(
                rusqlite::params![project_id, subject.kind.as_str(), subject.id, end_at, start_at],
                row_to_grant,
            )?;
            for row in rows {
                let grant = row?;
                if !out.iter().any(|g| g.id == grant.id) {
                    out.push(grant);
                }
            }
        }

        Ok(out)
    }

    /// Fetch a single grant by id
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn get(&self, id: &str) -> Result<Option<Grant>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let grant = conn
            .query_row(
                "SELECT id, project_id, subject_kind, subject_id, feature_plan_version_id,
                        grant_type, limit_amount, anchor, effective_at, expires_at,
                        auto_renew, deleted, created_at, updated_at, feature
                 FROM grants WHERE id = ?1",
                [id],
                row_to_grant,
            )
            .optional()?;
        Ok(grant)
    }

    /// Soft-delete grants owned by one subject
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn soft_delete(
        &self,
        ids: &[String],
        project_id: &str,
        subject_kind: SubjectKind,
        subject_id: &str,
        now: i64,
    ) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut deleted = 0;
        for id in ids {
            deleted += conn.execute(
                "UPDATE grants SET deleted = 1, deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND project_id = ?3 AND subject_kind = ?4
                   AND subject_id = ?5 AND deleted = 0",
                rusqlite::params![now, id, project_id, subject_kind.as_str(), subject_id],
            )?;
        }
        Ok(deleted)
    }
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Grant> {
    let subject_kind: String = row.get(2)?;
    let grant_type: String = row.get(5)?;
    let limit: Option<String> = row.get(6)?;
    let feature: String = row.get(14)?;

    Ok(Grant {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subject_kind: SubjectKind::from_str(&subject_kind).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "subject_kind".into(), rusqlite::types::Type::Text)
        })?,
        subject_id: row.get(3)?,
        feature_plan_version_id: row.get(4)?,
        grant_type: GrantType::from_str(&grant_type).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(5, "grant_type".into(), rusqlite::types::Type::Text)
        })?,
        limit: limit.and_then(|l| l.parse().ok()),
        anchor: row.get(7)?,
        effective_at: row.get(8)?,
        expires_at: row.get(9)?,
        auto_renew: row.get(10)?,
        deleted: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        feature: serde_json::from_str(&feature).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                14,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
    })
}
