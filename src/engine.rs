use chrono::{TimeZone, Utc};
use tracing::{error, info, warn};

use crate::dispatch::build_failure_prompt;
use crate::state::SharedState;
use crate::store::{now_ts, EffectiveOk, RunStatus, SubjectKind, SubjectState, Test};

/// Per-subject configuration the engine needs to judge an observation.
#[derive(Debug, Clone)]
pub struct SubjectMeta {
    pub subject_id: String,
    pub kind: SubjectKind,
    pub display_name: String,
    pub base_url: String,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    pub notify_on_recovery: bool,
    pub dispatch_on_failure: bool,
}

impl From<&Test> for SubjectMeta {
    fn from(t: &Test) -> Self {
        SubjectMeta {
            subject_id: t.id.clone(),
            kind: SubjectKind::Test,
            display_name: t.name.clone(),
            base_url: t.base_url.clone(),
            down_after_failures: t.down_after_failures,
            up_after_successes: t.up_after_successes,
            notify_on_recovery: t.notify_on_recovery,
            dispatch_on_failure: t.dispatch_on_failure,
        }
    }
}

/// One completed run/probe as the engine sees it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub status: RunStatus,
    pub elapsed_ms: Option<f64>,
    pub run_id: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub went_down: bool,
    pub recovered: bool,
}

/// Apply one observation to a state block. Pure: persistence and alerting
/// are the caller's job.
///
/// infra_degraded is neutral: a crashing browser must never flip a subject
/// DOWN. timeout counts as a failure; the test code had its bounded chance.
pub fn apply_observation(
    state: &mut SubjectState,
    status: RunStatus,
    down_after_failures: i64,
    up_after_successes: i64,
    now: f64,
) -> Transition {
    let none = Transition {
        went_down: false,
        recovered: false,
    };

    if status == RunStatus::InfraDegraded {
        state.last_infra_ts = Some(now);
        return none;
    }

    let observed_ok = status == RunStatus::Pass;
    if observed_ok {
        state.success_streak += 1;
        state.fail_streak = 0;
        state.last_ok_ts = Some(now);
    } else {
        state.fail_streak += 1;
        state.success_streak = 0;
        state.last_fail_ts = Some(now);
    }

    let down_after = down_after_failures.max(1);
    let up_after = up_after_successes.max(1);

    match state.effective_ok {
        EffectiveOk::Unknown => {
            if observed_ok {
                // A subject settles UP on its first pass; thresholds guard
                // recovery from DOWN, not initial convergence.
                state.effective_ok = EffectiveOk::Up;
                none
            } else if state.fail_streak >= down_after {
                state.effective_ok = EffectiveOk::Down;
                state.last_alert_ts = Some(now);
                Transition {
                    went_down: true,
                    recovered: false,
                }
            } else {
                none
            }
        }
        EffectiveOk::Up => {
            if !observed_ok && state.fail_streak >= down_after {
                state.effective_ok = EffectiveOk::Down;
                state.last_alert_ts = Some(now);
                Transition {
                    went_down: true,
                    recovered: false,
                }
            } else {
                none
            }
        }
        EffectiveOk::Down => {
            if observed_ok && state.success_streak >= up_after {
                state.effective_ok = EffectiveOk::Up;
                state.last_alert_ts = Some(now);
                Transition {
                    went_down: false,
                    recovered: true,
                }
            } else {
                none
            }
        }
    }
}

/// Persist one observation and emit alerts/escalations on edge transitions.
/// State is written through before any alert goes out, so a crash between
/// the two can at worst drop an alert, never double-count a run.
pub async fn observe(state: &SharedState, meta: &SubjectMeta, obs: &Observation) {
    let now = now_ts();
    let mut subject = match state.store.get_state(&meta.subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            warn!("Observation for unknown subject {}", meta.subject_id);
            return;
        }
        Err(e) => {
            error!("Failed to load state for {}: {}", meta.subject_id, e);
            return;
        }
    };

    let transition = apply_observation(
        &mut subject,
        obs.status,
        meta.down_after_failures,
        meta.up_after_successes,
        now,
    );
    if let Some(ms) = obs.elapsed_ms {
        subject.last_elapsed_ms = Some(ms);
    }

    if let Err(e) = write_state_with_retry(state, &subject).await {
        error!("Failed to persist state for {}: {}", meta.subject_id, e);
        return;
    }

    info!(
        "Observed {} status={} effective={} fail_streak={} success_streak={}",
        meta.subject_id,
        obs.status.as_str(),
        subject.effective_ok.as_str(),
        subject.fail_streak,
        subject.success_streak
    );

    if transition.went_down {
        let msg = build_down_alert(state, meta, &subject, obs);
        state.alerts.send(&msg).await;
        if meta.dispatch_on_failure {
            spawn_escalation(state.clone(), meta.clone(), obs.clone());
        }
    } else if transition.recovered && meta.notify_on_recovery {
        let msg = build_recovery_alert(state, meta, obs);
        state.alerts.send(&msg).await;
    }
}

/// Store writes are retried with short backoff; persistence failures must
/// not silently drop an observation when the database is briefly busy.
async fn write_state_with_retry(
    state: &SharedState,
    subject: &SubjectState,
) -> Result<(), crate::store::StoreError> {
    let mut delay = std::time::Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match state.store.write_state(subject) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < 2 => {
                warn!(
                    "State write for {} failed (attempt {}): {}",
                    subject.subject_id,
                    attempt + 1,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn format_ts(ts: Option<f64>) -> String {
    match ts {
        Some(ts) => Utc
            .timestamp_opt(ts as i64, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string()),
        None => "-".to_string(),
    }
}

fn public_url(state: &SharedState, path: &str) -> Option<String> {
    let base = state.config.public_base_url.trim_end_matches('/');
    if base.is_empty() {
        None
    } else {
        Some(format!("{}{}", base, path))
    }
}

fn build_down_alert(
    state: &SharedState,
    meta: &SubjectMeta,
    subject: &SubjectState,
    obs: &Observation,
) -> String {
    let mut lines = vec![
        format!(
            "{} is DOWN \u{274c}",
            match meta.kind {
                SubjectKind::Test => "Synthetic E2E test",
                SubjectKind::Domain => "Domain",
                SubjectKind::Host => "Host health",
            }
        ),
        format!("Subject: {}", meta.display_name),
    ];
    if !meta.base_url.is_empty() {
        lines.push(format!("Target: {}", meta.base_url));
    }
    lines.push(format!(
        "Debounce: fail_streak={}/{}",
        subject.fail_streak, meta.down_after_failures
    ));
    lines.push(format!("Last OK: {}", format_ts(subject.last_ok_ts)));
    if let Some(kind) = &obs.error_kind {
        lines.push(format!("Error kind: {}", truncate(kind, 120)));
    }
    if let Some(msg) = &obs.error_message {
        lines.push(format!("Error: {}", truncate(msg, 500)));
    }
    if let Some(run_id) = &obs.run_id {
        lines.push(format!("Run ID: {}", run_id));
        if let Some(url) = public_url(state, &format!("/api/v1/runs/{}", run_id)) {
            lines.push(format!("Run: {}", url));
        }
        if let Some(url) = public_url(
            state,
            &format!("/api/v1/runs/{}/artifacts/failure.png", run_id),
        ) {
            lines.push(format!("Screenshot: {}", url));
        }
    }
    lines.join("\n")
}

fn build_recovery_alert(state: &SharedState, meta: &SubjectMeta, obs: &Observation) -> String {
    let mut lines = vec![
        format!(
            "{} RECOVERED \u{2705}",
            match meta.kind {
                SubjectKind::Test => "Synthetic E2E test",
                SubjectKind::Domain => "Domain",
                SubjectKind::Host => "Host health",
            }
        ),
        format!("Subject: {}", meta.display_name),
    ];
    if !meta.base_url.is_empty() {
        lines.push(format!("Target: {}", meta.base_url));
    }
    if let Some(run_id) = &obs.run_id {
        if let Some(url) = public_url(state, &format!("/api/v1/runs/{}", run_id)) {
            lines.push(format!("Run: {}", url));
        }
    }
    lines.join("\n")
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Fire-and-forget escalation: run the dispatcher job to completion and
/// forward the agent's conclusions through the alert sink. Skipped while
/// the dispatcher circuit breaker is open.
fn spawn_escalation(state: SharedState, meta: SubjectMeta, obs: Observation) {
    match state.dispatch.as_ref() {
        None => return,
        Some(dispatch) if !dispatch.available() => {
            warn!(
                "Escalation dispatcher disabled by circuit breaker; skipping {}",
                meta.subject_id
            );
            return;
        }
        Some(_) => {}
    }
    tokio::spawn(async move {
        let Some(dispatch) = state.dispatch.as_ref() else {
            return;
        };
        let prompt = build_failure_prompt(
            meta.kind.as_str(),
            &meta.display_name,
            &meta.base_url,
            obs.run_id.as_deref(),
            obs.error_kind.as_deref(),
            obs.error_message.as_deref(),
        );

        match dispatch.run_to_completion(&prompt).await {
            Ok(outcome) => {
                dispatch.record_success();
                let text = outcome
                    .output
                    .clone()
                    .unwrap_or_else(|| "(no agent output)".to_string());
                let _ = state.store.record_dispatch_run(
                    &meta.subject_id,
                    Some(&outcome.job_id),
                    Some(&outcome.status),
                    outcome.output.as_deref(),
                    None,
                );
                let msg = format!(
                    "Escalation triage for {} completed ({}):\n\n{}",
                    meta.display_name, outcome.status, text
                );
                state.alerts.send(&msg).await;
            }
            Err(e) => {
                error!("Escalation for {} failed: {}", meta.subject_id, e);
                let _ = state.store.record_dispatch_run(
                    &meta.subject_id,
                    None,
                    Some("error"),
                    None,
                    Some(&e.to_string()),
                );
                if dispatch.record_failure() && dispatch.should_notify() {
                    let msg = format!(
                        "Escalation dispatcher disabled for {} min after repeated failures.\nLast error: {}",
                        crate::dispatch::DispatchClient::cooldown_minutes(),
                        e
                    );
                    state.alerts.send(&msg).await;
                }
            }
        }
    });
}

/// Heartbeat loop: at each configured HH:MM anchor in the configured IANA
/// timezone, send a status summary whether or not anything transitioned.
/// Anchors fire at most once per local day; wall-clock math is done in the
/// named zone so DST shifts cannot double- or zero-fire an anchor.
pub fn spawn_heartbeat(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let anchors: Vec<(u32, u32)> = state
            .config
            .heartbeat_times
            .iter()
            .filter_map(|s| parse_hhmm(s))
            .collect();
        if anchors.is_empty() {
            return;
        }
        let tz: chrono_tz::Tz = match state.config.heartbeat_timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                error!(
                    "Invalid heartbeat timezone {:?}; heartbeats disabled",
                    state.config.heartbeat_timezone
                );
                return;
            }
        };
        info!(
            "Heartbeat anchors {:?} in {}",
            state.config.heartbeat_times, tz
        );

        // (HH:MM) -> local date last sent
        let mut sent: std::collections::HashMap<(u32, u32), chrono::NaiveDate> =
            std::collections::HashMap::new();
        let mut shutdown = state.shutdown_requested();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
                _ = shutdown.recv() => break,
            }

            let local = Utc::now().with_timezone(&tz);
            let today = local.date_naive();
            for &(hh, mm) in &anchors {
                use chrono::Timelike;
                if local.hour() != hh || local.minute() != mm {
                    continue;
                }
                if sent.get(&(hh, mm)) == Some(&today) {
                    continue;
                }
                sent.insert((hh, mm), today);
                let label = format!("{:02}:{:02} {}", hh, mm, tz);
                match build_heartbeat_message(&state, &label) {
                    Ok(msg) => {
                        state.alerts.send(&msg).await;
                    }
                    Err(e) => error!("Failed to build heartbeat: {}", e),
                }
            }
        }
    })
}

pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let hh: u32 = h.parse().ok()?;
    let mm: u32 = m.parse().ok()?;
    if hh < 24 && mm < 60 {
        Some((hh, mm))
    } else {
        None
    }
}

fn build_heartbeat_message(
    state: &SharedState,
    scheduled_label: &str,
) -> Result<String, crate::store::StoreError> {
    let summary = state.store.status_summary(5)?;
    let states = state.store.all_states()?;
    let now = now_ts();

    let mut lines = vec![
        format!("Monitoring heartbeat ({})", scheduled_label),
        format!(
            "Subjects: {} tests, {} domains; failing: {}",
            summary.tests_total,
            states
                .iter()
                .filter(|s| s.kind == SubjectKind::Domain)
                .count(),
            states
                .iter()
                .filter(|s| s.effective_ok == EffectiveOk::Down)
                .count(),
        ),
    ];

    for s in &states {
        let marker = match s.effective_ok {
            EffectiveOk::Up => "\u{2705}",
            EffectiveOk::Down => "\u{274c}",
            EffectiveOk::Unknown => "\u{2753}",
        };
        let age = s
            .last_ok_ts
            .map(|ts| format_age(now - ts))
            .unwrap_or_else(|| "never".to_string());
        let elapsed = s
            .last_elapsed_ms
            .map(|ms| format!("{:.0} ms", ms))
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{} {}: last ok {}, last run {}",
            marker, s.subject_id, age, elapsed
        ));
    }

    if !summary.slowest.is_empty() {
        lines.push(String::new());
        lines.push("Slowest tests:".to_string());
        for row in &summary.slowest {
            lines.push(format!(
                "  {}: {:.0} ms",
                row.name,
                row.last_elapsed_ms.unwrap_or(0.0)
            ));
        }
    }

    Ok(lines.join("\n"))
}

fn format_age(secs: f64) -> String {
    let secs = secs.max(0.0) as i64;
    if secs < 120 {
        format!("{}s ago", secs)
    } else if secs < 7200 {
        format!("{}m ago", secs / 60)
    } else if secs < 48 * 3600 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}
