use rusqlite::{params, OptionalExtension};

use super::{artifacts_from_json, now_ts, Run, RunCompletion, RunStatus, Store, StoreError, TestKind};

fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Snapshot handed to a worker when it wins a queue claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub entry_id: String,
    pub run_id: String,
    pub test_id: String,
    pub tenant_id: String,
    pub test_name: String,
    pub base_url: String,
    pub kind: TestKind,
    pub timeout_seconds: i64,
    pub source_relpath: String,
    pub source_filename: String,
    pub source_sha256: String,
    pub attempt: i64,
}

impl Store {
    /// Insert a queued entry for the test unless one is already open.
    /// Returns false when coalesced away.
    pub fn enqueue_run(&self, test_id: &str, due_ts: f64) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO run_queue (id, test_id, due_ts, status)
             VALUES (?1, ?2, ?3, 'queued')",
            params![uuid(), test_id, due_ts],
        )?;
        Ok(n > 0)
    }

    pub fn has_open_entry(&self, test_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_queue WHERE test_id=?1 AND status != 'done'",
            params![test_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Open (queued or leased) entries, globally and for one tenant. The
    /// scheduler uses these to enforce concurrency quotas at enqueue time.
    pub fn open_entry_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM run_queue WHERE status != 'done'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn open_entry_count_for_tenant(&self, tenant_id: &str) -> Result<i64, StoreError> {
        let conn = self.conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM run_queue q JOIN tests t ON t.id = q.test_id
             WHERE q.status != 'done' AND t.tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Claim the oldest due queued entry: conditional queued->leased update
    /// plus creation of the run record, in one transaction so two workers
    /// can never lease the same entry.
    pub fn claim_next(&self, worker_id: &str, grace_secs: f64) -> Result<Option<ClaimedJob>, StoreError> {
        let now = now_ts();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let candidate = tx
            .query_row(
                "SELECT q.id, q.test_id, q.attempt,
                        t.tenant_id, t.name, t.base_url, t.kind, t.timeout_seconds,
                        t.source_relpath, t.source_filename, t.source_sha256
                 FROM run_queue q JOIN tests t ON t.id = q.test_id
                 WHERE q.status = 'queued' AND q.due_ts <= ?1
                 ORDER BY q.due_ts ASC
                 LIMIT 1",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((entry_id, test_id, attempt, tenant_id, test_name, base_url, kind, timeout, relpath, filename, sha256)) =
            candidate
        else {
            tx.commit()?;
            return Ok(None);
        };

        let run_id = uuid();
        let lease_until = now + 2.0 * timeout as f64 + grace_secs;
        let updated = tx.execute(
            "UPDATE run_queue
             SET status='leased', run_id=?1, leased_by=?2, leased_until_ts=?3, attempt=attempt+1
             WHERE id=?4 AND status='queued'",
            params![run_id, worker_id, lease_until, entry_id],
        )?;
        if updated == 0 {
            tx.commit()?;
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO runs (id, test_id, scheduled_for_ts, status, error_kind)
             VALUES (?1, ?2, ?3, 'infra_degraded', 'pending')",
            params![run_id, test_id, now],
        )?;
        tx.commit()?;

        Ok(Some(ClaimedJob {
            entry_id,
            run_id,
            test_id,
            tenant_id,
            test_name,
            base_url,
            kind: TestKind::parse(&kind).unwrap_or(TestKind::ScriptPython),
            timeout_seconds: timeout,
            source_relpath: relpath,
            source_filename: filename,
            source_sha256: sha256,
            attempt: attempt + 1,
        }))
    }

    /// Write the terminal run record and release the queue entry.
    pub fn complete_run(&self, entry_id: &str, run_id: &str, completion: &RunCompletion) -> Result<(), StoreError> {
        let artifacts_json = serde_json::to_string(&completion.artifacts)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE runs SET
                started_at_ts=?1, finished_at_ts=?2, status=?3, elapsed_ms=?4,
                error_kind=?5, error_message=?6, final_url=?7, title=?8, artifacts_json=?9
             WHERE id=?10",
            params![
                completion.started_at_ts,
                completion.finished_at_ts,
                completion.status.as_str(),
                completion.elapsed_ms,
                completion.error_kind,
                completion.error_message,
                completion.final_url,
                completion.title,
                artifacts_json,
                run_id,
            ],
        )?;
        tx.execute(
            "UPDATE run_queue SET status='done', leased_by=NULL, leased_until_ts=NULL WHERE id=?1",
            params![entry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Abandoned leases (worker crashed or was killed mid-run): release the
    /// entry and turn the pending run into a synthetic infra_degraded record
    /// so the state engine sees neither a pass nor a fail.
    pub fn expire_stale_leases(&self) -> Result<Vec<(String, String)>, StoreError> {
        let now = now_ts();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let expired: Vec<(String, String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, test_id, run_id FROM run_queue
                 WHERE status='leased' AND leased_until_ts IS NOT NULL AND leased_until_ts < ?1",
            )?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut observed = Vec::new();
        for (entry_id, test_id, run_id) in &expired {
            tx.execute(
                "UPDATE run_queue SET status='done', leased_by=NULL, leased_until_ts=NULL WHERE id=?1",
                params![entry_id],
            )?;
            if let Some(run_id) = run_id {
                tx.execute(
                    "UPDATE runs SET finished_at_ts=?1, status='infra_degraded',
                            error_kind='worker_lost', error_message='lease expired; worker lost'
                     WHERE id=?2 AND finished_at_ts IS NULL",
                    params![now, run_id],
                )?;
            }
            observed.push((test_id.clone(), run_id.clone().unwrap_or_default()));
        }
        tx.commit()?;
        Ok(observed)
    }

    pub fn list_runs(&self, tenant_id: &str, test_id: &str, limit: i64) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.* FROM runs r JOIN tests t ON t.id = r.test_id
             WHERE r.test_id=?1 AND t.tenant_id=?2
             ORDER BY r.scheduled_for_ts DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![test_id, tenant_id, limit.clamp(1, 500)], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT r.* FROM runs r JOIN tests t ON t.id = r.test_id
                 WHERE r.id=?1 AND t.tenant_id=?2",
                params![run_id, tenant_id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// (tenant_id, test_id) for a run, scoped to the tenant; used to resolve
    /// artifact paths without leaking cross-tenant ids.
    pub fn run_scope(&self, tenant_id: &str, run_id: &str) -> Result<Option<(String, String)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT t.tenant_id, t.id FROM runs r JOIN tests t ON t.id = r.test_id
                 WHERE r.id=?1 AND t.tenant_id=?2",
                params![run_id, tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn prune_runs_before(&self, cutoff_ts: f64) -> Result<usize, StoreError> {
        let n = self.conn().execute(
            "DELETE FROM runs WHERE finished_at_ts IS NOT NULL AND finished_at_ts < ?1",
            params![cutoff_ts],
        )?;
        Ok(n)
    }

    pub fn record_dispatch_run(
        &self,
        subject_id: &str,
        job_id: Option<&str>,
        status: Option<&str>,
        agent_message: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO dispatch_runs (id, created_at_ts, subject_id, job_id, status, agent_message, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid(),
                now_ts(),
                subject_id,
                job_id,
                status,
                agent_message.map(|s| clip(s, 20_000)),
                error_message.map(|s| clip(s, 5_000)),
            ],
        )?;
        Ok(())
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let raw: String = row.get("artifacts_json")?;
    Ok(Run {
        id: row.get("id")?,
        test_id: row.get("test_id")?,
        scheduled_for_ts: row.get("scheduled_for_ts")?,
        started_at_ts: row.get("started_at_ts")?,
        finished_at_ts: row.get("finished_at_ts")?,
        status: RunStatus::parse(&row.get::<_, String>("status")?).unwrap_or(RunStatus::InfraDegraded),
        elapsed_ms: row.get("elapsed_ms")?,
        error_kind: row.get("error_kind")?,
        error_message: row.get("error_message")?,
        final_url: row.get("final_url")?,
        title: row.get("title")?,
        artifacts: artifacts_from_json(&raw),
    })
}
