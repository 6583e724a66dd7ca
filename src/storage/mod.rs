//! Entitlement storage
//!
//! The durable per-actor surface: entitlement state keyed by
//! (project, customer, feature), the idempotency-key set, and the
//! append-only usage-record and verification buffers that batch out to
//! the analytics sink on `flush()`. Pending batches survive restarts and
//! are replayed on the first flush after boot.

mod schema;

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::analytics::{Analytics, UsageRecord, Verification};
use crate::grant::resolver::Entitlement;
use crate::meter::MeterState;
use crate::{Error, Result};

pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Minimum idempotency-key lifetime regardless of cycle length
const MIN_IDEMPOTENCY_TTL_MS: i64 = 60 * 60 * 1000;

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "entitlement store initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing and ephemeral actors)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Live state held for one entitlement: the merged view plus its meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementState {
    pub entitlement: Entitlement,
    #[serde(default)]
    pub meter: Option<MeterState>,
}

impl EntitlementState {
    #[must_use]
    pub fn key(&self) -> String {
        make_key(
            &self.entitlement.project_id,
            &self.entitlement.customer_id,
            &self.entitlement.feature_slug,
        )
    }
}

/// Storage key for a (project, customer, feature) triple
#[must_use]
pub fn make_key(project_id: &str, customer_id: &str, feature_slug: &str) -> String {
    format!("{project_id}:{customer_id}:{feature_slug}")
}

/// Durable entitlement storage over the shared pool
#[derive(Clone)]
pub struct EntitlementStorage {
    pool: DbPool,
    analytics: Arc<dyn Analytics>,
}

impl EntitlementStorage {
    #[must_use]
    pub fn new(pool: DbPool, analytics: Arc<dyn Analytics>) -> Self {
        Self { pool, analytics }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Fetch the state stored under `key`
    ///
    /// # Errors
    ///
    /// Returns error if the read or deserialization fails
    pub fn get(&self, key: &str) -> Result<Option<EntitlementState>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT state FROM entitlements WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    /// Upsert the state; at most one row per (project, customer, feature)
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn set(&self, state: &EntitlementState) -> Result<()> {
        let conn = self.conn()?;
        let key = state.key();
        let payload = serde_json::to_string(state)?;
        conn.execute(
            "INSERT INTO entitlements (key, project_id, customer_id, feature_slug, version, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (key) DO UPDATE SET
                 version = excluded.version,
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                key,
                state.entitlement.project_id,
                state.entitlement.customer_id,
                state.entitlement.feature_slug,
                state.entitlement.version,
                payload,
                state.entitlement.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Delete the state stored under `key`
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM entitlements WHERE key = ?1", [key])?;
        Ok(())
    }

    /// List the stored entitlement states for one customer
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn list_for_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> Result<Vec<EntitlementState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT state FROM entitlements WHERE project_id = ?1 AND customer_id = ?2
             ORDER BY feature_slug ASC",
        )?;
        let rows = stmt.query_map([project_id, customer_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Drop all state owned by one customer: entitlements, idempotency
    /// keys and unflushed buffers
    ///
    /// # Errors
    ///
    /// Returns error if any delete fails
    pub fn reset(&self, project_id: &str, customer_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM entitlements WHERE project_id = ?1 AND customer_id = ?2",
            [project_id, customer_id],
        )?;
        conn.execute(
            "DELETE FROM usage_records WHERE project_id = ?1 AND customer_id = ?2 AND flushed = 0",
            [project_id, customer_id],
        )?;
        conn.execute(
            "DELETE FROM verifications WHERE project_id = ?1 AND customer_id = ?2 AND flushed = 0",
            [project_id, customer_id],
        )?;
        conn.execute(
            "DELETE FROM idempotency_keys WHERE project_id = ?1 AND customer_id = ?2",
            [project_id, customer_id],
        )?;
        Ok(())
    }

    /// Record an idempotency key, returning whether it was already known.
    /// The first observation inserts the key with the given TTL; expired
    /// keys count as unseen and are re-armed. Keys are scoped per
    /// (project, customer): equal client-supplied keys from different
    /// tenants never collide.
    ///
    /// # Errors
    ///
    /// Returns error if the read or write fails
    pub fn has_idempotence_key(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
        key: &str,
        now: i64,
        cycle_len_ms: Option<i64>,
    ) -> Result<bool> {
        let ttl = idempotency_ttl_ms(cycle_len_ms);
        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM idempotency_keys
                 WHERE project_id = ?1 AND customer_id = ?2 AND feature_slug = ?3 AND key = ?4",
                [project_id, customer_id, feature_slug, key],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(expires_at) if expires_at > now => Ok(true),
            _ => {
                conn.execute(
                    "INSERT INTO idempotency_keys
                        (project_id, customer_id, feature_slug, key, seen_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (project_id, customer_id, feature_slug, key) DO UPDATE SET
                         seen_at = excluded.seen_at,
                         expires_at = excluded.expires_at",
                    rusqlite::params![project_id, customer_id, feature_slug, key, now, now + ttl],
                )?;
                Ok(false)
            }
        }
    }

    /// Append a usage record to the outbound buffer
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn insert_usage_record(&self, record: &UsageRecord) -> Result<()> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(&record.metadata)?;
        conn.execute(
            "INSERT INTO usage_records (
                id, customer_id, project_id, feature_slug, usage, timestamp,
                idempotence_key, request_id, created_at, metadata, deleted, flushed
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
            rusqlite::params![
                record.id,
                record.customer_id,
                record.project_id,
                record.feature_slug,
                record.usage.to_string(),
                record.timestamp,
                record.idempotence_key,
                record.request_id,
                record.created_at,
                metadata,
                record.deleted,
            ],
        )?;
        Ok(())
    }

    /// Append a verification to the outbound buffer
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn insert_verification(&self, verification: &Verification) -> Result<()> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(&verification.metadata)?;
        conn.execute(
            "INSERT INTO verifications (
                customer_id, project_id, feature_slug, timestamp, allowed,
                denied_reason, metadata, latency, request_id, created_at, flushed
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            rusqlite::params![
                verification.customer_id,
                verification.project_id,
                verification.feature_slug,
                verification.timestamp,
                verification.allowed,
                verification.denied_reason,
                metadata,
                verification.latency,
                verification.request_id,
                verification.created_at,
            ],
        )?;
        Ok(())
    }

    /// Number of buffered rows not yet shipped to analytics
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn pending_counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn()?;
        let records: usize = conn.query_row(
            "SELECT COUNT(*) FROM usage_records WHERE flushed = 0",
            [],
            |row| row.get(0),
        )?;
        let verifications: usize = conn.query_row(
            "SELECT COUNT(*) FROM verifications WHERE flushed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok((records, verifications))
    }

    /// Ship pending batches to the analytics sink and garbage-collect
    /// expired idempotency keys. Rows stay buffered when the sink fails
    /// and are retried on the next flush.
    ///
    /// # Errors
    ///
    /// Returns error if the local reads or writes fail; sink failures
    /// are returned after the successfully shipped batch is marked
    pub async fn flush(&self, now: i64) -> Result<FlushOutcome> {
        let records = self.pending_usage_records()?;
        let verifications = self.pending_verifications()?;
        let mut outcome = FlushOutcome::default();

        if !records.is_empty() {
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            self.analytics.ingest_usage_records(records).await?;
            let conn = self.conn()?;
            for id in &ids {
                conn.execute("UPDATE usage_records SET flushed = 1 WHERE id = ?1", [id])?;
            }
            outcome.usage_records = ids.len();
        }

        if !verifications.is_empty() {
            let (ids, rows): (Vec<i64>, Vec<Verification>) = verifications.into_iter().unzip();
            self.analytics.ingest_verifications(rows).await?;
            let conn = self.conn()?;
            for id in &ids {
                conn.execute("UPDATE verifications SET flushed = 1 WHERE id = ?1", [id])?;
            }
            outcome.verifications = ids.len();
        }

        let conn = self.conn()?;
        outcome.expired_keys = conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
            [now],
        )?;

        Ok(outcome)
    }

    fn pending_usage_records(&self) -> Result<Vec<UsageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, customer_id, project_id, feature_slug, usage, timestamp,
                    idempotence_key, request_id, created_at, metadata, deleted
             FROM usage_records WHERE flushed = 0 ORDER BY id ASC",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok(RawUsageRecord {
                id: row.get(0)?,
                customer_id: row.get(1)?,
                project_id: row.get(2)?,
                feature_slug: row.get(3)?,
                usage: row.get(4)?,
                timestamp: row.get(5)?,
                idempotence_key: row.get(6)?,
                request_id: row.get(7)?,
                created_at: row.get(8)?,
                metadata: row.get(9)?,
                deleted: row.get(10)?,
            })
        })?;

        let mut out = Vec::new();
        for row in mapped {
            let raw = row?;
            out.push(UsageRecord {
                usage: raw
                    .usage
                    .parse()
                    .map_err(|_| Error::Database(format!("bad usage decimal for {}", raw.id)))?,
                metadata: serde_json::from_str(&raw.metadata)?,
                id: raw.id,
                customer_id: raw.customer_id,
                project_id: raw.project_id,
                feature_slug: raw.feature_slug,
                timestamp: raw.timestamp,
                idempotence_key: raw.idempotence_key,
                request_id: raw.request_id,
                created_at: raw.created_at,
                deleted: raw.deleted,
            });
        }
        Ok(out)
    }

    fn pending_verifications(&self) -> Result<Vec<(i64, Verification)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, customer_id, project_id, feature_slug, timestamp, allowed,
                    denied_reason, metadata, latency, request_id, created_at
             FROM verifications WHERE flushed = 0 ORDER BY id ASC",
        )?;
        let mapped = stmt.query_map([], |row| {
            let metadata: String = row.get(7)?;
            Ok((
                row.get::<_, i64>(0)?,
                Verification {
                    customer_id: row.get(1)?,
                    project_id: row.get(2)?,
                    feature_slug: row.get(3)?,
                    timestamp: row.get(4)?,
                    allowed: row.get(5)?,
                    denied_reason: row.get(6)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    latency: row.get(8)?,
                    request_id: row.get(9)?,
                    created_at: row.get(10)?,
                },
            ))
        })?;

        let mut out = Vec::new();
        for row in mapped {
            out.push(row?);
        }
        Ok(out)
    }

    /// Read an actor-local config value
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM actor_config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write an actor-local config value
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO actor_config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }
}

struct RawUsageRecord {
    id: String,
    customer_id: String,
    project_id: String,
    feature_slug: String,
    usage: String,
    timestamp: i64,
    idempotence_key: String,
    request_id: String,
    created_at: i64,
    metadata: String,
    deleted: bool,
}

/// What one flush pass shipped and collected
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub usage_records: usize,
    pub verifications: usize,
    pub expired_keys: usize,
}

/// Idempotency keys live two cycles, with a one-hour floor
#[must_use]
pub fn idempotency_ttl_ms(cycle_len_ms: Option<i64>) -> i64 {
    cycle_len_ms
        .and_then(|len| len.checked_mul(2))
        .map_or(MIN_IDEMPOTENCY_TTL_MS, |ttl| ttl.max(MIN_IDEMPOTENCY_TTL_MS))
}
