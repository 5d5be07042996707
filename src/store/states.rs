use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{now_ts, EffectiveOk, Store, StoreError, SubjectKind, SubjectState};

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<SubjectState> {
    Ok(SubjectState {
        subject_id: row.get("subject_id")?,
        kind: SubjectKind::parse(&row.get::<_, String>("kind")?),
        effective_ok: EffectiveOk::parse(&row.get::<_, String>("effective_ok")?),
        fail_streak: row.get("fail_streak")?,
        success_streak: row.get("success_streak")?,
        last_ok_ts: row.get("last_ok_ts")?,
        last_fail_ts: row.get("last_fail_ts")?,
        last_infra_ts: row.get("last_infra_ts")?,
        last_alert_ts: row.get("last_alert_ts")?,
        next_due_ts: row.get("next_due_ts")?,
        last_elapsed_ms: row.get("last_elapsed_ms")?,
    })
}

/// A due test as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct DueTest {
    pub test_id: String,
    pub tenant_id: String,
    pub interval_seconds: i64,
    pub jitter_seconds: i64,
    pub fail_streak: i64,
}

impl Store {
    pub fn get_state(&self, subject_id: &str) -> Result<Option<SubjectState>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT * FROM subject_state WHERE subject_id=?1",
                params![subject_id],
                state_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Create the state row for a subject if missing (domains appear here on
    /// first config load; tests get theirs at insert time).
    pub fn ensure_state(&self, subject_id: &str, kind: SubjectKind, next_due_ts: f64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO subject_state (subject_id, kind, next_due_ts) VALUES (?1, ?2, ?3)",
            params![subject_id, kind.as_str(), next_due_ts],
        )?;
        Ok(())
    }

    /// Write-through of a full state block after an observation.
    pub fn write_state(&self, state: &SubjectState) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE subject_state SET
                effective_ok=?1, fail_streak=?2, success_streak=?3,
                last_ok_ts=?4, last_fail_ts=?5, last_infra_ts=?6, last_alert_ts=?7,
                last_elapsed_ms=?8
             WHERE subject_id=?9",
            params![
                state.effective_ok.as_str(),
                state.fail_streak,
                state.success_streak,
                state.last_ok_ts,
                state.last_fail_ts,
                state.last_infra_ts,
                state.last_alert_ts,
                state.last_elapsed_ms,
                state.subject_id,
            ],
        )?;
        Ok(())
    }

    pub fn set_next_due(&self, subject_id: &str, next_due_ts: f64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE subject_state SET next_due_ts=?1 WHERE subject_id=?2",
            params![next_due_ts, subject_id],
        )?;
        Ok(())
    }

    /// Enabled, due tests with no open queue entry, oldest due first.
    pub fn due_tests(&self, limit: i64) -> Result<Vec<DueTest>, StoreError> {
        let now = now_ts();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.tenant_id, t.interval_seconds, t.jitter_seconds, s.fail_streak
             FROM tests t JOIN subject_state s ON s.subject_id = t.id
             WHERE t.enabled = 1
               AND (t.disabled_until_ts IS NULL OR t.disabled_until_ts <= ?1)
               AND s.next_due_ts IS NOT NULL AND s.next_due_ts <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM run_queue q WHERE q.test_id = t.id AND q.status != 'done'
               )
             ORDER BY s.next_due_ts ASC
             LIMIT ?2",
            )?;
        let rows = stmt
            .query_map(params![now, limit.max(1)], |row| {
                Ok(DueTest {
                    test_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    interval_seconds: row.get(2)?,
                    jitter_seconds: row.get(3)?,
                    fail_streak: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_states(&self) -> Result<Vec<SubjectState>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM subject_state ORDER BY subject_id")?;
        let rows = stmt
            .query_map([], state_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn status_summary(&self, slowest_n: usize) -> Result<StatusSummary, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.tenant_id, t.name, t.base_url, t.enabled,
                    s.effective_ok, s.fail_streak, s.last_ok_ts, s.last_fail_ts, s.last_elapsed_ms
             FROM tests t LEFT JOIN subject_state s ON s.subject_id = t.id
             ORDER BY t.created_at_ts DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SummaryRow {
                    test_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    name: row.get(2)?,
                    base_url: row.get(3)?,
                    enabled: row.get::<_, i64>(4)? != 0,
                    effective_ok: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| EffectiveOk::parse(&s))
                        .unwrap_or(EffectiveOk::Unknown),
                    fail_streak: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    last_ok_ts: row.get(7)?,
                    last_fail_ts: row.get(8)?,
                    last_elapsed_ms: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let failing = rows
            .iter()
            .filter(|r| r.effective_ok == EffectiveOk::Down)
            .count();

        let mut slowest: Vec<SummaryRow> = rows
            .iter()
            .filter(|r| r.last_elapsed_ms.is_some())
            .cloned()
            .collect();
        slowest.sort_by(|a, b| {
            b.last_elapsed_ms
                .partial_cmp(&a.last_elapsed_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slowest.truncate(slowest_n);

        let mut last_run_per_tenant: Vec<(String, f64)> = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT t.tenant_id, MAX(r.finished_at_ts)
                 FROM runs r JOIN tests t ON t.id = r.test_id
                 WHERE r.finished_at_ts IS NOT NULL
                 GROUP BY t.tenant_id",
            )?;
            let pairs = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            last_run_per_tenant.extend(pairs);
        }

        Ok(StatusSummary {
            tests_total: rows.len(),
            failing,
            tests: rows,
            slowest,
            last_run_per_tenant,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub test_id: String,
    pub tenant_id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub effective_ok: EffectiveOk,
    pub fail_streak: i64,
    pub last_ok_ts: Option<f64>,
    pub last_fail_ts: Option<f64>,
    pub last_elapsed_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub tests_total: usize,
    pub failing: usize,
    pub slowest: Vec<SummaryRow>,
    pub last_run_per_tenant: Vec<(String, f64)>,
    pub tests: Vec<SummaryRow>,
}
