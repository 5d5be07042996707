use rand::Rng;
use rusqlite::{params, OptionalExtension, Row};

use super::{
    now_ts, ApiKeyRecord, AuthedTenant, Store, StoreError, SubjectKind, SubjectState, Tenant,
    Test, TestKind,
};

fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn test_from_row(row: &Row<'_>) -> rusqlite::Result<Test> {
    Ok(Test {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        name: row.get("name")?,
        base_url: row.get("base_url")?,
        kind: TestKind::parse(&row.get::<_, String>("kind")?).unwrap_or(TestKind::ScriptPython),
        enabled: row.get::<_, i64>("enabled")? != 0,
        disabled_reason: row.get("disabled_reason")?,
        disabled_until_ts: row.get("disabled_until_ts")?,
        interval_seconds: row.get("interval_seconds")?,
        timeout_seconds: row.get("timeout_seconds")?,
        jitter_seconds: row.get("jitter_seconds")?,
        down_after_failures: row.get("down_after_failures")?,
        up_after_successes: row.get("up_after_successes")?,
        notify_on_recovery: row.get::<_, i64>("notify_on_recovery")? != 0,
        dispatch_on_failure: row.get::<_, i64>("dispatch_on_failure")? != 0,
        source_relpath: row.get("source_relpath")?,
        source_filename: row.get("source_filename")?,
        source_sha256: row.get("source_sha256")?,
        created_at_ts: row.get("created_at_ts")?,
        updated_at_ts: row.get("updated_at_ts")?,
    })
}

/// Everything needed to create a test plus its initial state row.
pub struct NewTest {
    pub tenant_id: String,
    pub name: String,
    pub base_url: String,
    pub kind: TestKind,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub jitter_seconds: i64,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    pub notify_on_recovery: bool,
    pub dispatch_on_failure: bool,
    pub source_relpath: String,
    pub source_filename: String,
    pub source_sha256: String,
}

/// Partial metadata update; only `Some` fields are written. Source fields
/// are deliberately absent; source replacement is a separate atomic path.
#[derive(Default)]
pub struct TestPatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub jitter_seconds: Option<i64>,
    pub down_after_failures: Option<i64>,
    pub up_after_successes: Option<i64>,
    pub notify_on_recovery: Option<bool>,
    pub dispatch_on_failure: Option<bool>,
}

impl Store {
    pub fn create_tenant(&self, name: &str) -> Result<Tenant, StoreError> {
        let tenant = Tenant {
            id: uuid(),
            name: name.trim().to_string(),
            created_at_ts: now_ts(),
        };
        self.conn().execute(
            "INSERT INTO tenants (id, name, created_at_ts) VALUES (?1, ?2, ?3)",
            params![tenant.id, tenant.name, tenant.created_at_ts],
        )?;
        Ok(tenant)
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, name, created_at_ts FROM tenants ORDER BY created_at_ts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at_ts: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_api_key(
        &self,
        tenant_id: &str,
        name: &str,
        token_hash: &str,
    ) -> Result<ApiKeyRecord, StoreError> {
        let rec = ApiKeyRecord {
            id: uuid(),
            tenant_id: tenant_id.to_string(),
            name: name.trim().to_string(),
            created_at_ts: now_ts(),
        };
        self.conn().execute(
            "INSERT INTO api_keys (id, tenant_id, name, token_hash, created_at_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rec.id, rec.tenant_id, rec.name, token_hash, rec.created_at_ts],
        )?;
        Ok(rec)
    }

    pub fn revoke_api_key(&self, key_id: &str) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "UPDATE api_keys SET revoked_at_ts=?1 WHERE id=?2 AND revoked_at_ts IS NULL",
            params![now_ts(), key_id],
        )?;
        Ok(n > 0)
    }

    pub fn auth_by_token_hash(&self, token_hash: &str) -> Result<Option<AuthedTenant>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, tenant_id FROM api_keys WHERE token_hash=?1 AND revoked_at_ts IS NULL",
                params![token_hash],
                |row| {
                    Ok(AuthedTenant {
                        api_key_id: row.get(0)?,
                        tenant_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Create a test and its initial state row in one transaction. The first
    /// due time is jittered so a batch upload does not thundering-herd the
    /// runner pool.
    pub fn insert_test(&self, new: NewTest) -> Result<Test, StoreError> {
        let now = now_ts();
        let id = uuid();
        let jitter = if new.jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=new.jitter_seconds) as f64
        } else {
            0.0
        };

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tests (
                id, tenant_id, name, base_url, kind, enabled,
                interval_seconds, timeout_seconds, jitter_seconds,
                down_after_failures, up_after_successes,
                notify_on_recovery, dispatch_on_failure,
                source_relpath, source_filename, source_sha256,
                created_at_ts, updated_at_ts
             ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                id,
                new.tenant_id,
                new.name.trim(),
                new.base_url.trim(),
                new.kind.as_str(),
                new.interval_seconds,
                new.timeout_seconds,
                new.jitter_seconds,
                new.down_after_failures,
                new.up_after_successes,
                new.notify_on_recovery as i64,
                new.dispatch_on_failure as i64,
                new.source_relpath,
                new.source_filename,
                new.source_sha256,
                now,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO subject_state (subject_id, kind, next_due_ts) VALUES (?1, 'test', ?2)",
            params![id, now + jitter],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_test_any(&id)?.ok_or(StoreError::NotFound)
    }

    pub fn list_tests(
        &self,
        tenant_id: &str,
        enabled: Option<bool>,
        base_url_contains: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Test, Option<SubjectState>)>, StoreError> {
        let conn = self.conn();
        let sql = "SELECT t.*, s.effective_ok AS s_ok, s.fail_streak AS s_fail,
                    s.success_streak AS s_succ,
                    s.last_ok_ts AS s_last_ok, s.last_fail_ts AS s_last_fail,
                    s.last_infra_ts AS s_last_infra, s.last_alert_ts AS s_last_alert,
                    s.next_due_ts AS s_next_due, s.last_elapsed_ms AS s_elapsed
             FROM tests t LEFT JOIN subject_state s ON s.subject_id = t.id
             WHERE t.tenant_id = ?1 AND (?2 < 0 OR t.enabled = ?2)
             ORDER BY t.created_at_ts DESC LIMIT ?3 OFFSET ?4";

        let limit = limit.clamp(1, 500);
        let offset = offset.max(0);
        let enabled_val = enabled.map(|b| b as i64).unwrap_or(-1);

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![tenant_id, enabled_val, limit, offset], |row| {
                let test = test_from_row(row)?;
                let state = state_from_joined_row(row, &test.id)?;
                Ok((test, state))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let needle = base_url_contains.map(|s| s.to_ascii_lowercase());
        Ok(rows
            .into_iter()
            .filter(|(t, _)| match &needle {
                Some(n) => t.base_url.to_ascii_lowercase().contains(n),
                None => true,
            })
            .collect())
    }

    pub fn get_test(
        &self,
        tenant_id: &str,
        test_id: &str,
    ) -> Result<Option<(Test, Option<SubjectState>)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT t.*, s.effective_ok AS s_ok, s.fail_streak AS s_fail,
                        s.success_streak AS s_succ, s.last_ok_ts AS s_last_ok,
                        s.last_fail_ts AS s_last_fail, s.last_infra_ts AS s_last_infra,
                        s.last_alert_ts AS s_last_alert, s.next_due_ts AS s_next_due,
                        s.last_elapsed_ms AS s_elapsed
                 FROM tests t LEFT JOIN subject_state s ON s.subject_id = t.id
                 WHERE t.id = ?1 AND t.tenant_id = ?2",
                params![test_id, tenant_id],
                |row| {
                    let test = test_from_row(row)?;
                    let state = state_from_joined_row(row, &test.id)?;
                    Ok((test, state))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Internal lookup without a tenant scope (runner / engine paths).
    pub fn get_test_any(&self, test_id: &str) -> Result<Option<Test>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT * FROM tests WHERE id = ?1",
                params![test_id],
                test_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_test_meta(
        &self,
        tenant_id: &str,
        test_id: &str,
        patch: &TestPatch,
    ) -> Result<bool, StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        macro_rules! set {
            ($field:ident, $col:expr) => {
                if let Some(v) = &patch.$field {
                    sets.push(format!("{}=?{}", $col, values.len() + 1));
                    values.push(Box::new(v.clone()));
                }
            };
        }
        set!(name, "name");
        set!(base_url, "base_url");
        set!(interval_seconds, "interval_seconds");
        set!(timeout_seconds, "timeout_seconds");
        set!(jitter_seconds, "jitter_seconds");
        set!(down_after_failures, "down_after_failures");
        set!(up_after_successes, "up_after_successes");
        set!(notify_on_recovery, "notify_on_recovery");
        set!(dispatch_on_failure, "dispatch_on_failure");

        if sets.is_empty() {
            return Ok(false);
        }
        sets.push(format!("updated_at_ts=?{}", values.len() + 1));
        values.push(Box::new(now_ts()));
        let where_start = values.len();
        values.push(Box::new(test_id.to_string()));
        values.push(Box::new(tenant_id.to_string()));

        let sql = format!(
            "UPDATE tests SET {} WHERE id=?{} AND tenant_id=?{}",
            sets.join(", "),
            where_start + 1,
            where_start + 2,
        );
        let n = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
        Ok(n > 0)
    }

    /// Swap the stored source pointer. The caller has already written the
    /// new blob to disk (tmp + rename), so the row update is the commit point.
    pub fn update_test_source(
        &self,
        tenant_id: &str,
        test_id: &str,
        source_relpath: &str,
        source_filename: &str,
        source_sha256: &str,
    ) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "UPDATE tests
             SET source_relpath=?1, source_filename=?2, source_sha256=?3, updated_at_ts=?4
             WHERE id=?5 AND tenant_id=?6",
            params![source_relpath, source_filename, source_sha256, now_ts(), test_id, tenant_id],
        )?;
        Ok(n > 0)
    }

    pub fn set_test_disabled(
        &self,
        tenant_id: &str,
        test_id: &str,
        disabled: bool,
        reason: Option<&str>,
        until_ts: Option<f64>,
    ) -> Result<bool, StoreError> {
        let now = now_ts();
        // A future until_ts keeps the test enabled but skipped until then;
        // no until_ts means a hard disable.
        let (enabled, reason, until) = if !disabled {
            (1i64, None::<String>, None::<f64>)
        } else if let Some(ts) = until_ts.filter(|ts| *ts > now) {
            (1, reason.map(|s| s.trim().to_string()), Some(ts))
        } else {
            (0, reason.map(|s| s.trim().to_string()), None)
        };
        let n = self.conn().execute(
            "UPDATE tests
             SET enabled=?1, disabled_reason=?2, disabled_until_ts=?3, updated_at_ts=?4
             WHERE id=?5 AND tenant_id=?6",
            params![enabled, reason, until, now, test_id, tenant_id],
        )?;
        Ok(n > 0)
    }

    /// Re-arm the subject so the next scheduler tick picks it up. Combined
    /// with the single-open-queue-entry invariant this coalesces repeated
    /// run-now requests.
    pub fn trigger_run_now(&self, tenant_id: &str, test_id: &str) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "UPDATE subject_state SET next_due_ts=?1
             WHERE subject_id IN (SELECT id FROM tests WHERE id=?2 AND tenant_id=?3)",
            params![now_ts(), test_id, tenant_id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_test(&self, tenant_id: &str, test_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "DELETE FROM tests WHERE id=?1 AND tenant_id=?2",
            params![test_id, tenant_id],
        )?;
        if n > 0 {
            tx.execute(
                "DELETE FROM subject_state WHERE subject_id=?1",
                params![test_id],
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }
}

fn state_from_joined_row(
    row: &Row<'_>,
    subject_id: &str,
) -> rusqlite::Result<Option<SubjectState>> {
    let ok: Option<String> = row.get("s_ok")?;
    let Some(ok) = ok else {
        return Ok(None);
    };
    Ok(Some(SubjectState {
        subject_id: subject_id.to_string(),
        kind: SubjectKind::Test,
        effective_ok: super::EffectiveOk::parse(&ok),
        fail_streak: row.get::<_, Option<i64>>("s_fail")?.unwrap_or(0),
        success_streak: row.get::<_, Option<i64>>("s_succ")?.unwrap_or(0),
        last_ok_ts: row.get("s_last_ok")?,
        last_fail_ts: row.get("s_last_fail")?,
        last_infra_ts: row.get("s_last_infra")?,
        last_alert_ts: row.get("s_last_alert")?,
        next_due_ts: row.get("s_next_due")?,
        last_elapsed_ms: row.get("s_elapsed")?,
    }))
}
