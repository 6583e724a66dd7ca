//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Grants: append-only, soft-deleted
        CREATE TABLE IF NOT EXISTS grants (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            subject_kind TEXT NOT NULL CHECK(subject_kind IN ('customer', 'project', 'plan', 'plan_version')),
            subject_id TEXT NOT NULL,
            feature_plan_version_id TEXT NOT NULL,
            grant_type TEXT NOT NULL CHECK(grant_type IN ('subscription', 'addon', 'trial', 'promotion', 'manual')),
            limit_amount TEXT,
            anchor INTEGER NOT NULL,
            effective_at INTEGER NOT NULL,
            expires_at INTEGER,
            auto_renew INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            feature TEXT NOT NULL
        );

        -- conflict key; COALESCE folds open-ended expiries into one value
        CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_conflict_key ON grants(
            project_id, subject_id, subject_kind, grant_type,
            effective_at, COALESCE(expires_at, -1), feature_plan_version_id
        );

        CREATE INDEX IF NOT EXISTS idx_grants_subject ON grants(project_id, subject_kind, subject_id);
        CREATE INDEX IF NOT EXISTS idx_grants_deleted ON grants(deleted);

        -- Entitlement state, one row per (project, customer, feature)
        CREATE TABLE IF NOT EXISTS entitlements (
            key TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            feature_slug TEXT NOT NULL,
            version TEXT NOT NULL,
            state TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project_id, customer_id, feature_slug)
        );

        CREATE INDEX IF NOT EXISTS idx_entitlements_customer ON entitlements(project_id, customer_id);

        -- Idempotency keys with expiry, scoped like every other table
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            project_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            feature_slug TEXT NOT NULL,
            key TEXT NOT NULL,
            seen_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY(project_id, customer_id, feature_slug, key)
        );

        -- Usage record append log
        CREATE TABLE IF NOT EXISTS usage_records (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            feature_slug TEXT NOT NULL,
            usage TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            idempotence_key TEXT NOT NULL,
            request_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            deleted INTEGER NOT NULL DEFAULT 0,
            flushed INTEGER NOT NULL DEFAULT 0
        );

        -- Verification append log
        CREATE TABLE IF NOT EXISTS verifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            feature_slug TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            allowed INTEGER NOT NULL,
            denied_reason TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            latency REAL NOT NULL DEFAULT 0,
            request_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            flushed INTEGER NOT NULL DEFAULT 0
        );

        -- Actor-local configuration (colo label etc)
        CREATE TABLE IF NOT EXISTS actor_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Flush-scan indices for the append logs
        CREATE INDEX IF NOT EXISTS idx_usage_records_pending ON usage_records(flushed, id);
        CREATE INDEX IF NOT EXISTS idx_verifications_pending ON verifications(flushed, id);
        CREATE INDEX IF NOT EXISTS idx_idempotency_expiry ON idempotency_keys(expires_at);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}
