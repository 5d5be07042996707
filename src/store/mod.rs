mod models;
mod queue;
mod registry;
mod states;

pub use models::*;
pub use queue::ClaimedJob;
pub use registry::{NewTest, TestPatch};
pub use states::{DueTest, StatusSummary, SummaryRow};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,
}

/// Durable metadata + state store. Single SQLite connection guarded by a
/// mutex; all coordination between the scheduler, workers, and the API goes
/// through here.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Wall-clock unix timestamp in seconds, fractional.
pub fn now_ts() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at_ts REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                created_at_ts REAL NOT NULL,
                revoked_at_ts REAL
            );

            CREATE TABLE IF NOT EXISTS tests (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                disabled_reason TEXT,
                disabled_until_ts REAL,
                interval_seconds INTEGER NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                jitter_seconds INTEGER NOT NULL,
                down_after_failures INTEGER NOT NULL,
                up_after_successes INTEGER NOT NULL,
                notify_on_recovery INTEGER NOT NULL DEFAULT 0,
                dispatch_on_failure INTEGER NOT NULL DEFAULT 0,
                source_relpath TEXT NOT NULL,
                source_filename TEXT NOT NULL,
                source_sha256 TEXT NOT NULL,
                created_at_ts REAL NOT NULL,
                updated_at_ts REAL NOT NULL
            );

            -- One row per monitored subject: a test (subject_id = test id)
            -- or a domain (subject_id = 'domain:<name>').
            CREATE TABLE IF NOT EXISTS subject_state (
                subject_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                effective_ok TEXT NOT NULL DEFAULT 'unknown',
                fail_streak INTEGER NOT NULL DEFAULT 0,
                success_streak INTEGER NOT NULL DEFAULT 0,
                last_ok_ts REAL,
                last_fail_ts REAL,
                last_infra_ts REAL,
                last_alert_ts REAL,
                next_due_ts REAL,
                last_elapsed_ms REAL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                test_id TEXT NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
                scheduled_for_ts REAL NOT NULL,
                started_at_ts REAL,
                finished_at_ts REAL,
                status TEXT NOT NULL,
                elapsed_ms REAL,
                error_kind TEXT,
                error_message TEXT,
                final_url TEXT,
                title TEXT,
                artifacts_json TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS run_queue (
                id TEXT PRIMARY KEY,
                test_id TEXT NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
                due_ts REAL NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                run_id TEXT,
                leased_by TEXT,
                leased_until_ts REAL
            );

            -- Escalation outcomes, so operators can see what the agent found.
            CREATE TABLE IF NOT EXISTS dispatch_runs (
                id TEXT PRIMARY KEY,
                created_at_ts REAL NOT NULL,
                subject_id TEXT NOT NULL,
                job_id TEXT,
                status TEXT,
                agent_message TEXT,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tests_tenant_enabled ON tests(tenant_id, enabled);
            CREATE INDEX IF NOT EXISTS idx_state_due ON subject_state(kind, next_due_ts);
            CREATE INDEX IF NOT EXISTS idx_runs_test_sched ON runs(test_id, scheduled_for_ts DESC);
            CREATE INDEX IF NOT EXISTS idx_queue_status_due ON run_queue(status, due_ts);
            -- Coalescing: at most one open (queued or leased) entry per test.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_open
                ON run_queue(test_id) WHERE status != 'done';
            ",
        )?;
        Ok(())
    }
}
