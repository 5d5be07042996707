use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::engine::{self, Observation, SubjectMeta};
use crate::runner::protocol::extract_result;
use crate::runner::sandbox;
use crate::state::SharedState;
use crate::store::{now_ts, RunStatus, SubjectKind, TestKind};

/// Body text that marks a page as effectively down even when it serves 200.
pub const DEFAULT_FORBIDDEN_TEXT: &[&str] = &[
    "maintenance",
    "temporarily unavailable",
    "we'll be back",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

fn default_interval() -> i64 {
    300
}
fn default_jitter() -> i64 {
    30
}
fn default_http_timeout() -> f64 {
    15.0
}
fn default_browser_timeout() -> i64 {
    25
}
fn default_threshold() -> i64 {
    2
}

/// One monitored first-party domain, loaded from the domains JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub url: String,

    #[serde(default = "default_interval")]
    pub interval_seconds: i64,
    #[serde(default = "default_jitter")]
    pub jitter_seconds: i64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: f64,

    /// Browser expectation check; skipped entirely when false.
    #[serde(default)]
    pub browser_check: bool,
    #[serde(default = "default_browser_timeout")]
    pub browser_timeout_seconds: i64,
    #[serde(default)]
    pub expected_title_contains: Option<String>,
    #[serde(default)]
    pub required_selector: Option<String>,

    #[serde(default)]
    pub forbidden_text: Option<Vec<String>>,

    #[serde(default = "default_threshold")]
    pub down_after_failures: i64,
    #[serde(default = "default_threshold")]
    pub up_after_successes: i64,
    #[serde(default)]
    pub notify_on_recovery: bool,
    #[serde(default)]
    pub dispatch_on_failure: bool,

    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_until_ts: Option<f64>,
}

impl DomainConfig {
    pub fn subject_id(&self) -> String {
        format!("domain:{}", self.name)
    }

    pub fn is_disabled(&self, now: f64) -> bool {
        if self.disabled {
            return true;
        }
        matches!(self.disabled_until_ts, Some(until) if until > now)
    }

    fn meta(&self) -> SubjectMeta {
        SubjectMeta {
            subject_id: self.subject_id(),
            kind: SubjectKind::Domain,
            display_name: self.name.clone(),
            base_url: self.url.clone(),
            down_after_failures: self.down_after_failures,
            up_after_successes: self.up_after_successes,
            notify_on_recovery: self.notify_on_recovery,
            dispatch_on_failure: self.dispatch_on_failure,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DomainFile {
    domains: Vec<DomainConfig>,
}

pub type DomainSet = Arc<RwLock<Vec<DomainConfig>>>;

pub fn load_domains_file(path: &Path) -> anyhow::Result<Vec<DomainConfig>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: DomainFile = serde_json::from_str(&raw)?;
    for d in &parsed.domains {
        if d.name.trim().is_empty() || d.url.trim().is_empty() {
            anyhow::bail!("domain entries need non-empty name and url");
        }
    }
    Ok(parsed.domains)
}

/// Load the initial domain set and create missing state rows. Returns an
/// empty set when no file is configured (domain monitor off).
pub fn init_domains(state: &SharedState) -> anyhow::Result<DomainSet> {
    let domains = match &state.config.domains_file {
        Some(path) => {
            let domains = load_domains_file(path)?;
            info!("Loaded {} domains from {:?}", domains.len(), path);
            domains
        }
        None => Vec::new(),
    };
    ensure_states(state, &domains);
    Ok(Arc::new(RwLock::new(domains)))
}

fn ensure_states(state: &SharedState, domains: &[DomainConfig]) {
    let now = now_ts();
    for d in domains {
        let jitter = if d.jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=d.jitter_seconds) as f64
        } else {
            0.0
        };
        if let Err(e) = state
            .store
            .ensure_state(&d.subject_id(), SubjectKind::Domain, now + jitter)
        {
            error!("Failed to ensure state for {}: {}", d.name, e);
        }
    }
}

/// Reload the domains file on SIGHUP. Removed domains simply stop being
/// scheduled; new ones start at `unknown`.
#[cfg(unix)]
pub fn spawn_reload_handler(state: SharedState, domains: DomainSet) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(path) = state.config.domains_file.clone() else {
            return;
        };
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        while hup.recv().await.is_some() {
            match load_domains_file(&path) {
                Ok(loaded) => {
                    info!("Reloaded {} domains from {:?}", loaded.len(), path);
                    ensure_states(&state, &loaded);
                    *domains.write().await = loaded;
                }
                Err(e) => error!("Domain config reload failed: {}", e),
            }
        }
    })
}

/// Scheduler hook: probe every enabled domain whose state is due, bounded
/// by the probe semaphore. Reschedules before probing so a slow probe can
/// never double-fire its own subject.
pub async fn tick_domains(state: &SharedState, domains: &DomainSet, permits: &Arc<Semaphore>) {
    let snapshot = domains.read().await.clone();
    if snapshot.is_empty() {
        return;
    }
    let now = now_ts();

    for cfg in snapshot {
        if cfg.is_disabled(now) {
            continue;
        }
        let subject_id = cfg.subject_id();
        let due = match state.store.get_state(&subject_id) {
            Ok(Some(s)) => s.next_due_ts.map(|ts| ts <= now).unwrap_or(true),
            Ok(None) => {
                ensure_states(state, std::slice::from_ref(&cfg));
                false
            }
            Err(e) => {
                error!("State read failed for {}: {}", subject_id, e);
                false
            }
        };
        if !due {
            continue;
        }

        let fail_streak = state
            .store
            .get_state(&subject_id)
            .ok()
            .flatten()
            .map(|s| s.fail_streak)
            .unwrap_or(0);
        let jitter = if cfg.jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=cfg.jitter_seconds) as f64
        } else {
            0.0
        };
        let next_due = now
            + cfg.interval_seconds as f64 * crate::scheduler::backoff_factor(fail_streak)
            + jitter;
        if let Err(e) = state.store.set_next_due(&subject_id, next_due) {
            error!("Failed to reschedule {}: {}", subject_id, e);
            continue;
        }

        let state = state.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let obs = probe_domain(&state, &cfg).await;
            engine::observe(&state, &cfg.meta(), &obs).await;
        });
    }
}

/// One probe cycle: HTTP liveness, then (only if it passed and a browser
/// check is configured) a headless-browser expectation check through the
/// sandbox protocol.
pub async fn probe_domain(state: &SharedState, cfg: &DomainConfig) -> Observation {
    let started = now_ts();
    let http = http_check(state, cfg).await;
    match http {
        HttpOutcome::Ok => {}
        HttpOutcome::Down { kind, message } => {
            return Observation {
                status: RunStatus::Fail,
                elapsed_ms: Some((now_ts() - started) * 1000.0),
                run_id: None,
                error_kind: Some(kind),
                error_message: Some(message),
            };
        }
    }

    if !cfg.browser_check {
        return Observation {
            status: RunStatus::Pass,
            elapsed_ms: Some((now_ts() - started) * 1000.0),
            run_id: None,
            error_kind: None,
            error_message: None,
        };
    }

    match browser_check(state, cfg).await {
        Ok(obs) => obs,
        Err(e) => {
            // Spawn/filesystem problems on our side are infra, not a verdict
            // on the domain.
            let msg = e.to_string();
            warn!("Browser probe for {} errored: {}", cfg.name, msg);
            Observation {
                status: RunStatus::InfraDegraded,
                elapsed_ms: Some((now_ts() - started) * 1000.0),
                run_id: None,
                error_kind: Some("browser_probe_error".to_string()),
                error_message: Some(msg),
            }
        }
    }
}

enum HttpOutcome {
    Ok,
    Down { kind: String, message: String },
}

async fn http_check(state: &SharedState, cfg: &DomainConfig) -> HttpOutcome {
    let resp = state
        .http_client
        .get(&cfg.url)
        .timeout(Duration::from_secs_f64(cfg.http_timeout_seconds.max(1.0)))
        .send()
        .await;

    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            return HttpOutcome::Down {
                kind: "http_error".to_string(),
                message: e.to_string(),
            };
        }
    };

    let status = resp.status();
    if !(status.is_success() || status.is_redirection()) {
        return HttpOutcome::Down {
            kind: "http_status".to_string(),
            message: format!("HTTP {}", status),
        };
    }

    let body = resp.text().await.unwrap_or_default();
    let visible = html_visible_text(&body);
    let forbidden: Vec<String> = cfg
        .forbidden_text
        .clone()
        .unwrap_or_else(|| DEFAULT_FORBIDDEN_TEXT.iter().map(|s| s.to_string()).collect());
    let hits: Vec<&String> = forbidden
        .iter()
        .filter(|kw| !kw.is_empty() && visible.contains(&kw.to_ascii_lowercase()))
        .collect();
    if !hits.is_empty() {
        return HttpOutcome::Down {
            kind: "forbidden_text".to_string(),
            message: format!(
                "maintenance text on page: {}",
                hits.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
    }
    HttpOutcome::Ok
}

/// Strip tags (and script/style bodies) and normalize whitespace, lowering
/// the result for case-insensitive matching.
pub fn html_visible_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let lower = html.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0;
    let mut in_tag = false;
    let mut skip_until: Option<&str> = None;

    while i < bytes.len() {
        if let Some(end_tag) = skip_until {
            if lower[i..].starts_with(end_tag) {
                i += end_tag.len();
                skip_until = None;
                in_tag = false;
            } else {
                i += 1;
            }
            continue;
        }
        let c = bytes[i] as char;
        if in_tag {
            if c == '>' {
                in_tag = false;
            }
            i += 1;
        } else if c == '<' {
            if lower[i..].starts_with("<script") {
                skip_until = Some("</script>");
            } else if lower[i..].starts_with("<style") {
                skip_until = Some("</style>");
            } else {
                in_tag = true;
            }
            i += 1;
        } else {
            out.push(c);
            i += 1;
        }
    }

    let mut normalized = String::with_capacity(out.len());
    let mut last_space = true;
    for c in out.chars() {
        if c.is_whitespace() {
            if !last_space {
                normalized.push(' ');
                last_space = true;
            }
        } else {
            normalized.push(c);
            last_space = false;
        }
    }
    normalized.trim().to_string()
}

/// Generate the JS expectation script for this domain's browser check. The
/// script runs through the same sandbox protocol as uploaded tests.
pub fn expectation_script(cfg: &DomainConfig) -> String {
    let mut body = String::new();
    body.push_str("module.exports.run = async ({ page, baseUrl }) => {\n");
    body.push_str("  const resp = await page.goto(baseUrl, { waitUntil: 'domcontentloaded' });\n");
    body.push_str("  if (resp && resp.status() >= 400) {\n");
    body.push_str("    throw new Error('HTTP ' + resp.status());\n");
    body.push_str("  }\n");
    if let Some(t) = &cfg.expected_title_contains {
        let needle = serde_json::to_string(&t.to_lowercase()).unwrap_or_default();
        body.push_str("  const title = (await page.title()) || '';\n");
        body.push_str(&format!(
            "  if (!title.toLowerCase().includes({})) {{\n",
            needle
        ));
        body.push_str("    throw new Error('title mismatch: ' + title);\n");
        body.push_str("  }\n");
    }
    if let Some(sel) = &cfg.required_selector {
        let sel = serde_json::to_string(sel).unwrap_or_default();
        body.push_str(&format!("  await page.waitForSelector({});\n", sel));
    }
    body.push_str("};\n");
    body
}

async fn browser_check(state: &SharedState, cfg: &DomainConfig) -> anyhow::Result<Observation> {
    let probe_dir = state
        .config
        .data_dir
        .join("domain-probes")
        .join(&cfg.name);
    tokio::fs::create_dir_all(&probe_dir).await?;
    let script_path = probe_dir.join("expect.js");
    tokio::fs::write(&script_path, expectation_script(cfg)).await?;

    let started = now_ts();
    let cmd = sandbox::build_command(
        &state.config,
        TestKind::ScriptJs,
        &script_path,
        &cfg.url,
        &probe_dir,
        cfg.browser_timeout_seconds,
    );
    let hard_timeout = Duration::from_secs(
        cfg.browser_timeout_seconds.max(1) as u64 + crate::config::RUN_TIMEOUT_GRACE_SECS,
    );

    let output = crate::runner::run_probe_child(cmd, hard_timeout).await?;
    let elapsed = Some((now_ts() - started) * 1000.0);

    if output.timed_out {
        return Ok(Observation {
            status: RunStatus::Timeout,
            elapsed_ms: elapsed,
            run_id: None,
            error_kind: Some("timeout".to_string()),
            error_message: Some("browser probe exceeded its timeout".to_string()),
        });
    }
    let Some(result) = extract_result(&output.combined) else {
        return Ok(Observation {
            status: RunStatus::InfraDegraded,
            elapsed_ms: elapsed,
            run_id: None,
            error_kind: Some("runner_protocol".to_string()),
            error_message: Some("probe child produced no result line".to_string()),
        });
    };
    Ok(Observation {
        status: result.effective_status(),
        elapsed_ms: result.elapsed_ms.or(elapsed),
        run_id: None,
        error_kind: result.error_kind,
        error_message: result.error_message,
    })
}
